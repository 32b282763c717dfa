//! Lifecycle of a single inference call.
//!
//! A [`Backend`] starts a call and hands back a [`BackendCall`]: a stream of text
//! chunks fed by a producer task that owns the underlying process. The handle
//! enforces the per-call timeout, turns a silent successful exit into
//! [`BackendError::EmptyOutput`], and cancels the producer when dropped, so the
//! process is released on every path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BackendError;

/// Chunks buffered between the producer and the consumer.
pub const CHUNK_BUFFER: usize = 64;

/// Sampling and runtime parameters understood by the backend process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_context_size")]
    pub context_size: u32,

    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Pass `--no-mmap` to the backend.
    #[serde(default)]
    pub no_mmap: bool,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_context_size() -> u32 {
    4096
}

fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_size: default_context_size(),
            threads: default_threads(),
            no_mmap: false,
        }
    }
}

impl GenerationParams {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_no_mmap(mut self, no_mmap: bool) -> Self {
        self.no_mmap = no_mmap;
        self
    }
}

/// Process-wide unique identifier of a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

impl CallId {
    pub fn next() -> Self {
        CallId(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub id: CallId,
    pub prompt: String,
    pub params: GenerationParams,
    pub timeout: Option<Duration>,
}

impl BackendRequest {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            id: CallId::next(),
            prompt: prompt.into(),
            params,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How the producer's process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
    /// Bounded tail of the process's diagnostic output.
    pub stderr_tail: String,
    /// The process was killed because the call was cancelled.
    pub killed: bool,
}

impl ProcessExit {
    pub fn exited(code: i32, stderr_tail: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            success: code == 0,
            stderr_tail: stderr_tail.into(),
            killed: false,
        }
    }

    pub fn killed(stderr_tail: impl Into<String>) -> Self {
        Self {
            code: None,
            success: false,
            stderr_tail: stderr_tail.into(),
            killed: true,
        }
    }
}

/// Summary returned by [`BackendCall::wait`].
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub id: CallId,
    pub exit: ProcessExit,
    pub bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
}

pub type ProducerTask = JoinHandle<Result<ProcessExit, BackendError>>;

/// Create the channel a producer task streams chunks through.
pub fn chunk_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(CHUNK_BUFFER)
}

/// Owned handle to one running call. Never reused.
pub struct BackendCall {
    id: CallId,
    chunks: mpsc::Receiver<String>,
    cancel: CancellationToken,
    task: Option<ProducerTask>,
    outcome: Option<Result<ProcessExit, BackendError>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    timed_out: bool,
    bytes: usize,
    chunk_count: usize,
    started: Instant,
}

impl BackendCall {
    /// Wrap a producer task.
    ///
    /// The producer must stop sending and release its process once `cancel`
    /// fires, then resolve with how the process ended.
    pub fn new(
        id: CallId,
        timeout: Option<Duration>,
        chunks: mpsc::Receiver<String>,
        cancel: CancellationToken,
        task: ProducerTask,
    ) -> Self {
        let started = Instant::now();
        Self {
            id,
            chunks,
            cancel,
            task: Some(task),
            outcome: None,
            timeout,
            deadline: timeout.map(|t| started + t),
            timed_out: false,
            bytes: 0,
            chunk_count: 0,
            started,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    /// Next chunk of output, or `None` at end of stream, cancellation or timeout.
    pub async fn next_chunk(&mut self) -> Option<String> {
        loop {
            if self.timed_out {
                return None;
            }

            let received = match self.deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.chunks.recv()).await {
                        Ok(received) => received,
                        Err(_) => {
                            self.expire();
                            return None;
                        }
                    }
                }
                None => self.chunks.recv().await,
            };

            match received {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => {
                    self.bytes += chunk.len();
                    self.chunk_count += 1;
                    return Some(chunk);
                }
                None => return None,
            }
        }
    }

    /// Request termination. Idempotent and harmless after completion.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(call = %self.id, "Cancelling backend call");
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes
    }

    fn expire(&mut self) {
        warn!(call = %self.id, timeout = ?self.timeout, "Backend call timed out");
        self.timed_out = true;
        self.cancel.cancel();
    }

    /// Wait for the process to be gone and classify how the call ended.
    ///
    /// Unread output is drained first. Safe to call again if a previous wait
    /// was abandoned part way.
    pub async fn wait(&mut self) -> Result<ExitReport, BackendError> {
        if !self.cancel.is_cancelled() {
            while self.next_chunk().await.is_some() {}
        }
        self.chunks.close();

        if self.outcome.is_none() {
            if let Some(task) = self.task.as_mut() {
                let joined = match self.deadline {
                    Some(deadline) if !self.timed_out => {
                        match tokio::time::timeout_at(deadline, &mut *task).await {
                            Ok(joined) => joined,
                            Err(_) => {
                                warn!(call = %self.id, "Backend process outlived its timeout");
                                self.timed_out = true;
                                self.cancel.cancel();
                                task.await
                            }
                        }
                    }
                    _ => task.await,
                };
                self.task = None;
                self.outcome = Some(joined.unwrap_or_else(|e| {
                    Err(BackendError::io(format!("backend task failed: {}", e)))
                }));
            }
        }

        let exit = match &self.outcome {
            Some(outcome) => outcome.clone()?,
            None => return Err(BackendError::io("backend call has no producer")),
        };

        if self.timed_out {
            return Err(BackendError::Timeout(self.timeout.unwrap_or_default()));
        }

        let report = ExitReport {
            id: self.id,
            exit,
            bytes: self.bytes,
            chunks: self.chunk_count,
            elapsed: self.started.elapsed(),
            cancelled: self.cancel.is_cancelled(),
        };

        if report.cancelled {
            return Ok(report);
        }
        if !report.exit.success {
            return Err(BackendError::non_zero_exit(
                report.exit.code,
                report.exit.stderr_tail.clone(),
            ));
        }
        if report.bytes == 0 {
            return Err(BackendError::EmptyOutput);
        }

        debug!(call = %self.id, bytes = report.bytes, elapsed = ?report.elapsed, "Backend call finished");
        Ok(report)
    }
}

impl Drop for BackendCall {
    fn drop(&mut self) {
        // The producer reaps its process once it sees the cancellation.
        self.cancel.cancel();
    }
}

impl fmt::Debug for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCall")
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .field("timed_out", &self.timed_out)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Something that can run a prompt and stream back text.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, request: BackendRequest) -> Result<BackendCall, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_from(
        chunks: Vec<&'static str>,
        exit: ProcessExit,
        timeout: Option<Duration>,
    ) -> BackendCall {
        let (tx, rx) = chunk_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk.to_string()).await.is_err() {
                    break;
                }
            }
            drop(tx);
            Ok(exit)
        });
        BackendCall::new(CallId::next(), timeout, rx, cancel, task)
    }

    #[tokio::test]
    async fn test_streams_chunks_then_reports() {
        let mut call = call_from(vec!["a", "", "bc"], ProcessExit::exited(0, ""), None);
        assert_eq!(call.next_chunk().await.as_deref(), Some("a"));
        assert_eq!(call.next_chunk().await.as_deref(), Some("bc"));
        assert_eq!(call.next_chunk().await, None);

        let report = call.wait().await.unwrap();
        assert_eq!(report.bytes, 3);
        assert_eq!(report.chunks, 2);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_empty_output_is_an_error() {
        let mut call = call_from(vec![], ProcessExit::exited(0, ""), None);
        assert_eq!(call.wait().await.unwrap_err(), BackendError::EmptyOutput);
    }

    #[tokio::test]
    async fn test_only_empty_chunks_is_empty_output() {
        let mut call = call_from(vec!["", ""], ProcessExit::exited(0, ""), None);
        assert_eq!(call.wait().await.unwrap_err(), BackendError::EmptyOutput);
    }

    #[tokio::test]
    async fn test_non_zero_exit_wins_over_empty_output() {
        let mut call = call_from(vec![], ProcessExit::exited(2, "bad model"), None);
        assert_eq!(
            call.wait().await.unwrap_err(),
            BackendError::non_zero_exit(Some(2), "bad model")
        );
    }

    #[tokio::test]
    async fn test_wait_drains_unread_output() {
        let mut call = call_from(vec!["x", "y"], ProcessExit::exited(0, ""), None);
        let report = call.wait().await.unwrap();
        assert_eq!(report.bytes, 2);
    }

    #[tokio::test]
    async fn test_timeout_cancels_producer() {
        let (_tx, rx) = chunk_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            Ok(ProcessExit::killed(""))
        });
        let mut call = BackendCall::new(
            CallId::next(),
            Some(Duration::from_millis(50)),
            rx,
            cancel,
            task,
        );

        assert_eq!(call.next_chunk().await, None);
        assert!(call.is_cancelled());
        assert_eq!(
            call.wait().await.unwrap_err(),
            BackendError::Timeout(Duration::from_millis(50))
        );
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_tx, rx) = chunk_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            Ok(ProcessExit::killed(""))
        });
        let mut call = BackendCall::new(CallId::next(), None, rx, cancel, task);

        call.cancel();
        call.cancel();
        let report = call.wait().await.unwrap();
        assert!(report.cancelled);
        assert!(report.exit.killed);

        // Still fine after completion.
        call.cancel();
        assert!(call.wait().await.unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_drop_cancels_producer() {
        let (_tx, rx) = chunk_channel();
        let cancel = CancellationToken::new();
        let observer = cancel.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            token.cancelled().await;
            Ok(ProcessExit::killed(""))
        });

        let call = BackendCall::new(CallId::next(), None, rx, cancel, task);
        drop(call);
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_call_ids_are_unique() {
        let a = CallId::next();
        let b = CallId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("call-"));
    }

    #[test]
    fn test_generation_params_builder() {
        let params = GenerationParams::default()
            .with_temperature(0.7)
            .with_max_tokens(256)
            .with_context_size(2048)
            .with_threads(2)
            .with_no_mmap(true);

        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.max_tokens, 256);
        assert_eq!(params.context_size, 2048);
        assert_eq!(params.threads, 2);
        assert!(params.no_mmap);
    }
}
