//! In-process fakes for the chat transport.

use crate::error::TransportError;
use crate::llm::client::{ChatRequest, ChatResponse, ChatTransport, Choice, ChoiceMessage, Usage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Responder = Box<dyn Fn(&ChatRequest) -> Result<ChatResponse, TransportError> + Send + Sync>;

enum Script {
    Sequence(Mutex<VecDeque<Result<ChatResponse, TransportError>>>),
    Repeating(ChatResponse),
    Responder(Responder),
}

/// Replays canned provider responses and records every request it sees.
pub struct ScriptedTransport {
    script: Script,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    /// Responses in order; once drained every call returns a 500.
    pub fn sequence(responses: Vec<Result<ChatResponse, TransportError>>) -> Self {
        Self::with_script(Script::Sequence(Mutex::new(responses.into())))
    }

    pub fn repeating(response: ChatResponse) -> Self {
        Self::with_script(Script::Repeating(response))
    }

    pub fn responder(
        f: impl Fn(&ChatRequest) -> Result<ChatResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_script(Script::Responder(Box::new(f)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send(&self, request: &ChatRequest) -> Result<ChatResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.script {
            Script::Sequence(queue) => queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| server_error(500)),
            Script::Repeating(response) => Ok(response.clone()),
            Script::Responder(f) => f(request),
        }
    }
}

pub fn completion(content: &str, prompt_tokens: u32, completion_tokens: u32) -> ChatResponse {
    ChatResponse {
        choices: vec![Choice {
            message: ChoiceMessage {
                content: Some(content.to_string()),
            },
        }],
        usage: Some(Usage {
            prompt_tokens,
            completion_tokens,
        }),
        model: None,
    }
}

pub fn server_error(status: u16) -> Result<ChatResponse, TransportError> {
    Err(TransportError::Status {
        status,
        body: format!("status {status}"),
    })
}
