//! Test doubles for the fetcher's injected seams.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::fetcher::{FetchRequest, HttpTransport, Sleeper, TransportError, TransportResponse};

type Responder = dyn Fn(&FetchRequest) -> Result<TransportResponse, TransportError> + Send + Sync;

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

enum Script {
    Sequence(VecDeque<Result<TransportResponse, TransportError>>),
    Responder(Box<Responder>),
}

/// Transport that replays canned responses and remembers every request.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl ScriptedTransport {
    /// Responses handed out in order; requests past the end fail.
    pub fn sequence(responses: Vec<Result<TransportResponse, TransportError>>) -> Self {
        Self::with_script(Script::Sequence(responses.into()))
    }

    /// Response computed from each request.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&FetchRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Self::with_script(Script::Responder(Box::new(f)))
    }

    fn with_script(script: Script) -> Self {
        Self { script: Arc::new(Mutex::new(script)), requests: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, req: &FetchRequest) -> Result<TransportResponse, TransportError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(req.clone());
        }
        let mut script = self
            .script
            .lock()
            .map_err(|_| TransportError::Other("script lock poisoned".to_string()))?;
        match &mut *script {
            Script::Sequence(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".to_string()))),
            Script::Responder(f) => f(req),
        }
    }
}
