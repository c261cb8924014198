//! In-memory [`InferenceBackend`] for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::InferenceBackend;
use crate::error::{ErrorKind, InferenceError};
use crate::wire::{Completion, CompletionRequest, ModelInfo, TokenUsage};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Text(String),
    Error(InferenceError),
    /// Answer `OK: <prompt length in chars>`.
    Echo,
    /// Never answer.
    Hang,
}

impl Reply {
    pub(crate) fn text(text: &str) -> Self {
        Self::Text(text.to_owned())
    }

    pub(crate) fn error(kind: ErrorKind) -> Self {
        Self::Error(InferenceError::new(kind, format!("scripted {kind}")))
    }
}

#[derive(Debug)]
pub(crate) struct ScriptedBackend {
    models: Vec<ModelInfo>,
    list_error: Option<ErrorKind>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    list_calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self {
            models: Vec::new(),
            list_error: None,
            script: Mutex::new(VecDeque::new()),
            fallback: Reply::Echo,
            list_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_models(mut self, ids: &[&str]) -> Self {
        self.models = ids
            .iter()
            .map(|id| ModelInfo {
                id: (*id).to_owned(),
                object: Some("model".to_owned()),
                created: None,
                owned_by: None,
            })
            .collect();
        self
    }

    pub(crate) fn with_list_error(mut self, kind: ErrorKind) -> Self {
        self.list_error = Some(kind);
        self
    }

    /// Queue a reply for the next completion call.
    pub(crate) fn then(self, reply: Reply) -> Self {
        self.script.lock().push_back(reply);
        self
    }

    /// Reply used once the queue is empty.
    pub(crate) fn otherwise(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn complete_calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.prompt.clone()).collect()
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        match self.list_error {
            Some(kind) => Err(InferenceError::new(kind, "scripted listing failure")),
            None => Ok(self.models.clone()),
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InferenceError> {
        self.requests.lock().push(request.clone());
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let text = match reply {
            Reply::Text(text) => text,
            Reply::Error(e) => return Err(e),
            Reply::Echo => format!("OK: {}", request.prompt.chars().count()),
            Reply::Hang => std::future::pending().await,
        };
        Ok(Completion {
            text,
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            finish_reason: Some("stop".to_owned()),
            model: Some(request.model.clone()),
        })
    }

    async fn health_check(&self) -> bool {
        self.list_error.is_none()
    }
}
