use thiserror::Error;

/// Errors surfaced by the pricing engine, the oracle and the chat handler.
#[derive(Debug, Error)]
pub enum Error {
    /// A pricing input is outside its domain. Recoverable by correcting one field.
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// The oracle could not be reached, timed out or returned a transient error.
    #[error("language model unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The oracle rejected our credentials.
    #[error("language model rejected credentials: {0}")]
    UpstreamAuthError(String),

    /// The oracle replied with something we could not understand.
    #[error("could not understand language model reply: {0}")]
    MalformedResponse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("prompt template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// Only transient upstream failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }

    /// Short machine-readable name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamAuthError(_) => "upstream_auth_error",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Config(_) => "config",
            Self::Template(_) => "template",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(Error::UpstreamUnavailable("503".into()).is_retryable());
        assert!(!Error::UpstreamAuthError("401".into()).is_retryable());
        assert!(!Error::MalformedResponse("not json".into()).is_retryable());
        assert!(!Error::invalid("demand", "must be between 1 and 10").is_retryable());
    }

    #[test]
    fn test_invalid_input_message_names_field() {
        let err = Error::invalid("profit_margin", "must be below 1");
        assert_eq!(err.to_string(), "invalid profit_margin: must be below 1");
        assert_eq!(err.kind(), "invalid_input");
    }
}
