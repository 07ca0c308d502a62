use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{Oracle, ResponseFormat};
use crate::conversation::Message;
use crate::error::{Error, Result};

/// One request seen by a [`ScriptedOracle`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub format: ResponseFormat,
}

/// Deterministic in-process oracle that replays queued replies in order.
///
/// Clones share the same queue and call log, so a test can keep one handle
/// while the chat handler owns another. Once the queue runs dry every call
/// fails with [`Error::UpstreamUnavailable`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedOracle {
    replies: Arc<Mutex<VecDeque<Result<String>>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    delay: Duration,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push_reply(reply);
        self
    }

    pub fn with_error(self, error: Error) -> Self {
        self.push_error(error);
        self
    }

    /// Simulated latency applied to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_replies().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: Error) {
        self.lock_replies().push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn remaining(&self) -> usize {
        self.lock_replies().len()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String>>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn generate(&self, messages: &[Message], format: ResponseFormat) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                messages: messages.to_vec(),
                format,
            });

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        self.lock_replies()
            .pop_front()
            .unwrap_or_else(|| Err(Error::UpstreamUnavailable("no scripted reply left".into())))
    }
}
