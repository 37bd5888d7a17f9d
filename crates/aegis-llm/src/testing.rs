//! Deterministic backend used by pipeline tests and offline demos

use crate::client::{LlmBackend, LlmRequest};
use aegis_common::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

enum Scripted {
    Ok(Value),
    Malformed(String),
    Timeout(String),
}

/// Backend that replays a scripted sequence of responses.
///
/// Each `complete` call consumes the next scripted entry; running past the
/// script is a validation error, which keeps tests honest about call counts.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, value: Value) -> &Self {
        self.script.lock().push_back(Scripted::Ok(value));
        self
    }

    pub fn push_malformed(&self, message: impl Into<String>) -> &Self {
        self.script.lock().push_back(Scripted::Malformed(message.into()));
        self
    }

    pub fn push_timeout(&self, message: impl Into<String>) -> &Self {
        self.script.lock().push_back(Scripted::Timeout(message.into()));
        self
    }

    /// Prompts received so far, in call order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn complete(&self, request: &LlmRequest) -> Result<Value> {
        self.requests.lock().push(request.clone());
        match self.script.lock().pop_front() {
            Some(Scripted::Ok(value)) => Ok(value),
            Some(Scripted::Malformed(msg)) => Err(Error::Validation(msg)),
            Some(Scripted::Timeout(msg)) => Err(Error::Timeout(msg)),
            None => Err(Error::Validation("scripted backend exhausted".to_string())),
        }
    }
}
