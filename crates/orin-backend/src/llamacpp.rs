//! llama.cpp backend: one `llama-cli` process per call.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use orin_core::{
    chunk_channel, Backend, BackendCall, BackendError, BackendRequest, CallId, GenerationParams,
    ProcessExit,
};

use crate::utf8::Utf8Decoder;

const READ_BUFFER: usize = 4096;

/// Bytes of stderr kept for error reports.
const STDERR_TAIL_LIMIT: usize = 2048;

/// How long to wait for stderr to close after the process is gone.
const STDERR_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaCppConfig {
    /// `llama-cli` executable, either a path or a name looked up on `PATH`.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// GGUF model file.
    #[serde(default)]
    pub model: PathBuf,

    /// Arguments placed before the generated ones.
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("llama-cli")
}

fn default_extra_args() -> Vec<String> {
    ["--no-display-prompt", "-no-cnv", "-ngl", "0"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LlamaCppConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            model: PathBuf::new(),
            extra_args: default_extra_args(),
        }
    }
}

/// Whether the configured binary and model can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub binary: Option<PathBuf>,
    pub model_found: bool,
}

impl ProbeReport {
    pub fn is_ready(&self) -> bool {
        self.binary.is_some() && self.model_found
    }
}

pub struct LlamaCppBackend {
    config: LlamaCppConfig,
}

impl LlamaCppBackend {
    pub fn new(config: LlamaCppConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LlamaCppConfig {
        &self.config
    }

    /// Full argument list for one generation.
    pub fn build_args(&self, prompt: &str, params: &GenerationParams) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.extend([
            "-m".to_string(),
            self.config.model.display().to_string(),
            "-p".to_string(),
            prompt.to_string(),
            "-n".to_string(),
            params.max_tokens.to_string(),
            "--temp".to_string(),
            params.temperature.to_string(),
            "-c".to_string(),
            params.context_size.to_string(),
            "-t".to_string(),
            params.threads.to_string(),
        ]);
        if params.no_mmap {
            args.push("--no-mmap".to_string());
        }
        args
    }

    pub fn probe(&self) -> ProbeReport {
        ProbeReport {
            binary: resolve_program(&self.config.binary),
            model_found: self.config.model.is_file(),
        }
    }
}

/// Resolve a program to a path, searching `PATH` for bare names.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }

    let path_env = std::env::var_os("PATH")?;
    std::env::split_paths(&path_env)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[async_trait]
impl Backend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    async fn start(&self, request: BackendRequest) -> Result<BackendCall, BackendError> {
        let args = self.build_args(&request.prompt, &request.params);

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::spawn(format!("{}: {}", self.config.binary.display(), e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::spawn("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::spawn("stderr was not captured"))?;

        debug!(
            call = %request.id,
            pid = ?child.id(),
            binary = %self.config.binary.display(),
            "Spawned backend process"
        );

        let (tx, rx) = chunk_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            request.id,
            child,
            stdout,
            stderr,
            tx,
            cancel.clone(),
        ));

        Ok(BackendCall::new(request.id, request.timeout, rx, cancel, task))
    }
}

/// Owns the child for its whole life: streams stdout, then kills if needed and reaps.
async fn supervise(
    id: CallId,
    mut child: Child,
    mut stdout: ChildStdout,
    stderr: ChildStderr,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<ProcessExit, BackendError> {
    let stderr_task = tokio::spawn(collect_stderr(id, stderr));

    let mut decoder = Utf8Decoder::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut killed = false;
    let mut read_error = None;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                killed = true;
                break;
            }
            read = stdout.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                let sent = tokio::select! {
                    _ = cancel.cancelled() => {
                        killed = true;
                        break;
                    }
                    sent = tx.send(text) => sent,
                };
                if sent.is_err() {
                    // Consumer is gone.
                    killed = true;
                    break;
                }
            }
            Err(e) => {
                read_error = Some(e);
                break;
            }
        }
    }

    if !killed && read_error.is_none() {
        let rest = decoder.finish();
        if !rest.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => killed = true,
                _ = tx.send(rest) => {}
            }
        }
    }
    drop(tx);

    let status = if killed || read_error.is_some() {
        kill_and_reap(id, &mut child).await
    } else {
        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        match exited {
            Some(status) => status,
            None => {
                killed = true;
                kill_and_reap(id, &mut child).await
            }
        }
    };

    let stderr_tail = match tokio::time::timeout(STDERR_GRACE, stderr_task).await {
        Ok(Ok(tail)) => tail,
        _ => {
            debug!(call = %id, "Backend stderr did not close in time");
            String::new()
        }
    };

    if let Some(e) = read_error {
        return Err(BackendError::io(format!("reading backend output: {}", e)));
    }
    let status = status?;

    if killed {
        debug!(call = %id, "Backend process killed");
        return Ok(ProcessExit::killed(stderr_tail));
    }

    debug!(call = %id, status = %status, "Backend process exited");
    Ok(match status.code() {
        Some(code) => ProcessExit::exited(code, stderr_tail),
        None => ProcessExit {
            code: None,
            success: false,
            stderr_tail,
            killed: false,
        },
    })
}

async fn kill_and_reap(id: CallId, child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    if let Err(e) = child.kill().await {
        warn!(call = %id, error = %e, "Failed to kill backend process");
    }
    child.wait().await
}

/// Drain stderr so the process never blocks on it, keeping the last few KiB.
async fn collect_stderr(id: CallId, stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = String::new();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(call = %id, "{}", line);
                push_tail(&mut tail, &line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(call = %id, error = %e, "Stopped reading backend stderr");
                break;
            }
        }
    }

    tail.trim_end().to_string()
}

fn push_tail(tail: &mut String, line: &str) {
    tail.push_str(line);
    tail.push('\n');

    if tail.len() > STDERR_TAIL_LIMIT {
        let mut cut = tail.len() - STDERR_TAIL_LIMIT;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A backend running `/bin/sh -c <script>`; generated arguments land in `$1..`.
    fn shell_backend(script: &str) -> LlamaCppBackend {
        LlamaCppBackend::new(LlamaCppConfig {
            binary: PathBuf::from("/bin/sh"),
            model: PathBuf::from("model.gguf"),
            extra_args: vec!["-c".to_string(), script.to_string(), "llama".to_string()],
        })
    }

    async fn collect(call: &mut BackendCall) -> String {
        let mut out = String::new();
        while let Some(chunk) = call.next_chunk().await {
            out.push_str(&chunk);
        }
        out
    }

    #[test]
    fn test_build_args() {
        let backend = LlamaCppBackend::new(LlamaCppConfig {
            binary: PathBuf::from("llama-cli"),
            model: PathBuf::from("/models/qwen.gguf"),
            ..Default::default()
        });
        let params = GenerationParams::default()
            .with_temperature(0.5)
            .with_max_tokens(128)
            .with_context_size(2048)
            .with_threads(8)
            .with_no_mmap(true);

        let args = backend.build_args("User: hi\n\nAssistant:", &params);
        assert_eq!(
            args,
            vec![
                "--no-display-prompt",
                "-no-cnv",
                "-ngl",
                "0",
                "-m",
                "/models/qwen.gguf",
                "-p",
                "User: hi\n\nAssistant:",
                "-n",
                "128",
                "--temp",
                "0.5",
                "-c",
                "2048",
                "-t",
                "8",
                "--no-mmap",
            ]
        );
    }

    #[test]
    fn test_build_args_without_no_mmap() {
        let backend = LlamaCppBackend::new(LlamaCppConfig::default());
        let args = backend.build_args("p", &GenerationParams::default());
        assert!(!args.contains(&"--no-mmap".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_process_output() {
        let backend = shell_backend("printf '<think>plan</think>'; printf 'answer to: %s' \"$4\"");
        let mut call = backend
            .start(BackendRequest::new("the prompt", GenerationParams::default()))
            .await
            .unwrap();

        let output = collect(&mut call).await;
        assert_eq!(output, "<think>plan</think>answer to: the prompt");

        let report = call.wait().await.unwrap();
        assert_eq!(report.exit.code, Some(0));
        assert_eq!(report.bytes, output.len());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_process_is_empty_output() {
        let backend = shell_backend("exit 0");
        let mut call = backend
            .start(BackendRequest::new("p", GenerationParams::default()))
            .await
            .unwrap();

        assert_eq!(call.wait().await.unwrap_err(), BackendError::EmptyOutput);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let backend = shell_backend("echo 'failed to load model' >&2; exit 3");
        let mut call = backend
            .start(BackendRequest::new("p", GenerationParams::default()))
            .await
            .unwrap();

        assert_eq!(
            call.wait().await.unwrap_err(),
            BackendError::non_zero_exit(Some(3), "failed to load model")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let backend = shell_backend("printf 'start'; exec sleep 30");
        let request = BackendRequest::new("p", GenerationParams::default())
            .with_timeout(Some(Duration::from_millis(300)));
        let mut call = backend.start(request).await.unwrap();

        let started = std::time::Instant::now();
        let output = collect(&mut call).await;
        assert_eq!(output, "start");
        assert_eq!(
            call.wait().await.unwrap_err(),
            BackendError::Timeout(Duration::from_millis(300))
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let backend = shell_backend("printf 'x'; exec sleep 30");
        let mut call = backend
            .start(BackendRequest::new("p", GenerationParams::default()))
            .await
            .unwrap();

        assert_eq!(call.next_chunk().await.as_deref(), Some("x"));
        call.cancel();
        let report = call.wait().await.unwrap();
        assert!(report.cancelled);
        assert!(report.exit.killed);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let backend = LlamaCppBackend::new(LlamaCppConfig {
            binary: PathBuf::from("/nonexistent/llama-cli"),
            ..Default::default()
        });
        let err = backend
            .start(BackendRequest::new("p", GenerationParams::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::ProcessSpawnFailure(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_probe() {
        let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let ready = LlamaCppBackend::new(LlamaCppConfig {
            binary: PathBuf::from("sh"),
            model: manifest,
            ..Default::default()
        });
        assert!(ready.probe().is_ready());

        let missing = LlamaCppBackend::new(LlamaCppConfig {
            binary: PathBuf::from("/nonexistent/llama-cli"),
            model: PathBuf::from("/nonexistent/model.gguf"),
            ..Default::default()
        });
        let report = missing.probe();
        assert!(report.binary.is_none());
        assert!(!report.model_found);
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let mut tail = String::new();
        for i in 0..500 {
            push_tail(&mut tail, &format!("line {}", i));
        }
        assert!(tail.len() <= STDERR_TAIL_LIMIT);
        assert!(tail.ends_with("line 499\n"));
    }
}
