//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backend::{chunk_channel, Backend, BackendCall, BackendRequest, ProcessExit};
use crate::error::BackendError;

/// What the next call to a [`ScriptedBackend`] does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream the chunks, then exit with the given code.
    Stream { chunks: Vec<String>, exit_code: i32 },
    /// Stream the chunks, then block until cancelled.
    Hang { chunks: Vec<String> },
    /// Fail to start at all.
    StartFailure(BackendError),
    /// Never finish starting.
    StallStart,
}

/// A backend that replays queued scripts instead of running a process.
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    /// Captured requests (for assertion).
    pub requests: Mutex<Vec<BackendRequest>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a response delivered as one chunk. Scripts are used in FIFO order.
    pub fn queue_response(&self, text: &str) {
        self.queue_chunks(&[text]);
    }

    pub fn queue_chunks(&self, chunks: &[&str]) {
        self.queue(Script::Stream {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            exit_code: 0,
        });
    }

    pub fn queue_exit(&self, exit_code: i32, chunks: &[&str]) {
        self.queue(Script::Stream {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            exit_code,
        });
    }

    pub fn queue_hang(&self, chunks: &[&str]) {
        self.queue(Script::Hang {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        });
    }

    pub fn queue_start_failure(&self, error: BackendError) {
        self.queue(Script::StartFailure(error));
    }

    pub fn queue_stalled_start(&self) {
        self.queue(Script::StallStart);
    }

    pub fn queue(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn last_request(&self) -> Option<BackendRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Producers that have not finished yet.
    pub fn live_calls(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, request: BackendRequest) -> Result<BackendCall, BackendError> {
        self.requests.lock().unwrap().push(request.clone());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| BackendError::spawn("no scripted response queued"))?;

        let (chunks, exit_code, hang) = match script {
            Script::Stream { chunks, exit_code } => (chunks, exit_code, false),
            Script::Hang { chunks } => (chunks, 0, true),
            Script::StartFailure(err) => return Err(err),
            Script::StallStart => std::future::pending().await,
        };

        let (tx, rx) = chunk_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));

        let task = tokio::spawn(async move {
            let _guard = guard;

            for chunk in chunks {
                tokio::select! {
                    _ = token.cancelled() => return Ok(ProcessExit::killed("")),
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            return Ok(ProcessExit::killed(""));
                        }
                    }
                }
                tokio::task::yield_now().await;
            }

            if hang {
                token.cancelled().await;
                return Ok(ProcessExit::killed(""));
            }

            Ok(ProcessExit::exited(exit_code, ""))
        });

        Ok(BackendCall::new(request.id, request.timeout, rx, cancel, task))
    }
}
