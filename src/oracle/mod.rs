//! The language model seam.
//!
//! Everything that needs model output goes through [`Oracle::generate`], so the
//! HTTP client can be swapped for [`ScriptedOracle`] in tests.

mod openai;
mod scripted;

use async_trait::async_trait;

use crate::conversation::Message;
use crate::error::Result;

pub use openai::OpenAiOracle;
pub use scripted::{RecordedCall, ScriptedOracle};

/// Shape of the reply we ask the model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// Free-form conversational text.
    Text,
    /// A single JSON object.
    Json,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Sends `messages` in order and returns the model's reply text.
    async fn generate(&self, messages: &[Message], format: ResponseFormat) -> Result<String>;
}
