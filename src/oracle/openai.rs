use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use super::{Oracle, ResponseFormat};
use crate::config::OracleSettings;
use crate::conversation::Message;
use crate::error::{Error, Result};

// Structures matching the OpenAI-compatible /chat/completions endpoint
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatSpec>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormatSpec {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<Choice>,
    // usage, id, etc. are ignored
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat completions API.
pub struct OpenAiOracle {
    client: Client,
    api_key: SecretString,
    settings: OracleSettings,
}

impl OpenAiOracle {
    pub fn new(settings: &OracleSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("the language model client needs an API key".into()))?;
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            settings: settings.clone(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    fn build_request<'a>(&'a self, messages: &'a [Message], format: ResponseFormat) -> ChatRequest<'a> {
        let (temperature, max_tokens, response_format) = match format {
            ResponseFormat::Text => (
                self.settings.chat_temperature,
                self.settings.chat_max_tokens,
                None,
            ),
            ResponseFormat::Json => (
                self.settings.extraction_temperature,
                self.settings.extraction_max_tokens,
                Some(ResponseFormatSpec { kind: "json_object" }),
            ),
        };

        ChatRequest {
            model: &self.settings.model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature,
            max_tokens,
            response_format,
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::UpstreamAuthError(format!("status {}: {}", status, body))
        }
        _ => Error::UpstreamUnavailable(format!("status {}: {}", status, body)),
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    #[instrument(skip_all, fields(messages = messages.len(), format = ?format))]
    async fn generate(&self, messages: &[Message], format: ResponseFormat) -> Result<String> {
        let url = self.completions_url();
        let payload = self.build_request(messages, format);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, timeout = e.is_timeout(), "Chat completion request failed");
                Error::UpstreamUnavailable(format!("request to {} failed: {}", url, e))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            error!(%status, %body, "Chat completion API request failed");
            return Err(classify_status(status, &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::MalformedResponse(format!("unexpected response body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::MalformedResponse("response contained no message".into()))?;

        debug!(response = %content, "Received chat completion");
        Ok(content.trim().to_string())
    }
}
