pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod extractor;
pub mod oracle;
pub mod pricing;
pub mod prompts;
pub mod repl;
pub mod retry;
pub mod web_server;

// Re-export main types for convenience
pub use chat::{ChatHandler, Recommendation, SessionState};
pub use config::Settings;
pub use conversation::{Conversation, Message, Role};
pub use error::{Error, Result};
pub use extractor::{ExtractedParameters, ParameterExtractor};
pub use oracle::{OpenAiOracle, Oracle, ResponseFormat, ScriptedOracle};
pub use pricing::{PricingEngine, PricingField, PricingInputs, PricingResult, PricingWeights};
pub use retry::RetryPolicy;
