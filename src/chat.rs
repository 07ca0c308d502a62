//! Conversation orchestration: the advisor chat plus price recommendations
//! derived from everything said so far.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::conversation::{Conversation, Message, Role};
use crate::error::{Error, Result};
use crate::extractor::{ExtractedParameters, ParameterExtractor};
use crate::oracle::{Oracle, ResponseFormat};
use crate::pricing::{PricingEngine, PricingField, PricingInputs, PricingResult};
use crate::prompts;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// At least one factor is still unknown.
    Collecting,
    /// All six factors are known and a price has been computed.
    Ready,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Recommendation {
    Ready {
        inputs: PricingInputs,
        result: PricingResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
    Collecting {
        known: ExtractedParameters,
        missing: Vec<PricingField>,
    },
}

impl Recommendation {
    pub fn state(&self) -> SessionState {
        match self {
            Recommendation::Ready { .. } => SessionState::Ready,
            Recommendation::Collecting { .. } => SessionState::Collecting,
        }
    }

    fn nothing_known() -> Self {
        Recommendation::Collecting {
            known: ExtractedParameters::default(),
            missing: PricingField::ALL.to_vec(),
        }
    }
}

/// One chat session. Not shared: create one per user.
pub struct ChatHandler {
    conversation: Conversation,
    oracle: Arc<dyn Oracle>,
    extractor: ParameterExtractor,
    engine: PricingEngine,
    retry: RetryPolicy,
    advisor_prompt: String,
}

impl ChatHandler {
    pub fn new(oracle: Arc<dyn Oracle>, settings: &Settings) -> Result<Self> {
        let mut handler = Self {
            conversation: Conversation::new(),
            extractor: ParameterExtractor::new(oracle.clone(), settings)?,
            oracle,
            engine: PricingEngine::new(settings.pricing)?,
            retry: RetryPolicy::from_settings(settings),
            advisor_prompt: prompts::render_advisor(&settings.prompts.advisor)?,
        };
        handler.reset();
        Ok(handler)
    }

    /// Overrides the retry policy for both chat replies and extraction.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.extractor = self.extractor.with_retry(retry);
        self
    }

    pub fn history(&self) -> &[Message] {
        self.conversation.history()
    }

    pub fn engine(&self) -> &PricingEngine {
        &self.engine
    }

    /// Starts a fresh session, keeping only the advisor prompt.
    pub fn reset(&mut self) {
        self.conversation.reset();
        self.conversation.append(Role::System, self.advisor_prompt.clone());
    }

    /// Sends a user turn and returns the assistant's reply.
    ///
    /// The user message and the reply are appended together once the reply
    /// has arrived. If the oracle fails, the history is left untouched.
    #[instrument(skip_all, fields(history = self.conversation.len()))]
    pub async fn send_message(&mut self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::invalid("message", "must not be empty"));
        }

        let user_message = Message::user(text);
        let mut candidate = self.conversation.history().to_vec();
        candidate.push(user_message.clone());

        let oracle = &self.oracle;
        let candidate = &candidate;
        let reply = self
            .retry
            .run("chat reply", move || {
                oracle.generate(candidate, ResponseFormat::Text)
            })
            .await?;

        if reply.trim().is_empty() {
            warn!("No response content from language model");
            return Err(Error::MalformedResponse("empty reply".into()));
        }

        self.conversation.push(user_message);
        self.conversation.append(Role::Assistant, reply.clone());
        info!(history = self.conversation.len(), "Chat turn completed");
        Ok(reply)
    }

    /// Re-derives the pricing factors from the full history and prices them
    /// once all six are known. Unknown factors are reported, never defaulted.
    #[instrument(skip_all, fields(history = self.conversation.len()))]
    pub async fn get_recommendations(&self) -> Result<Recommendation> {
        if !self.conversation.has_user_input() {
            info!("No user input yet; nothing to extract");
            return Ok(Recommendation::nothing_known());
        }

        let known = self.extractor.extract(self.conversation.history()).await?;
        let Some(inputs) = known.to_inputs() else {
            let missing = known.missing();
            info!(?missing, "Still collecting pricing factors");
            return Ok(Recommendation::Collecting { known, missing });
        };

        let result = self.engine.compute(&inputs)?;
        info!(final_price = result.final_price, "Computed recommendation");
        Ok(Recommendation::Ready {
            inputs,
            result,
            explanation: known.explanation,
        })
    }
}
