//! Session transcript: one JSON-lines file per conversation.
//!
//! The first line is a session header; every following line is one turn.
//! Lines are flushed as they are written so an interrupted session keeps
//! everything up to its last completed turn.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::Serialize;

use orin_core::{Role, TurnOutcome};

pub struct Transcript {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
}

#[derive(Serialize)]
struct HeaderLine<'a> {
    timestamp: String,
    event_type: &'static str,
    model: &'a str,
    system_prompt: &'a str,
    window_size: usize,
}

#[derive(Serialize)]
struct TurnLine<'a> {
    timestamp: String,
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_ms: Option<u128>,
}

/// What the header line records about the session.
pub struct SessionInfo<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub window_size: usize,
}

/// Open a new `session_<stamp>[_n].jsonl`, never reusing an existing file.
fn create_unique(dir: &Path, stamp: &str) -> io::Result<(PathBuf, File)> {
    let mut n = 0;
    loop {
        let name = if n == 0 {
            format!("session_{}.jsonl", stamp)
        } else {
            format!("session_{}_{}.jsonl", stamp, n)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

impl Transcript {
    /// Create `session_<YYYYmmdd_HHMMSS>.jsonl` in `dir` and write its header.
    pub fn create(dir: &Path, info: &SessionInfo<'_>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create transcript directory: {}", dir.display()))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let (path, file) = create_unique(dir, &stamp)
            .with_context(|| format!("Failed to create transcript in {}", dir.display()))?;

        let mut transcript = Self {
            path,
            writer: BufWriter::new(file),
            lines: 0,
        };
        transcript.write_line(&HeaderLine {
            timestamp: Utc::now().to_rfc3339(),
            event_type: "session_start",
            model: info.model,
            system_prompt: info.system_prompt,
            window_size: info.window_size,
        })?;

        tracing::debug!(path = %transcript.path.display(), "Transcript started");
        Ok(transcript)
    }

    /// Append a completed question and its final answer.
    pub fn record_turn(&mut self, question: &str, outcome: &TurnOutcome) -> Result<()> {
        self.write_line(&TurnLine {
            timestamp: Utc::now().to_rfc3339(),
            role: Role::User,
            content: question,
            verification: None,
            elapsed_ms: None,
        })?;
        self.write_line(&TurnLine {
            timestamp: Utc::now().to_rfc3339(),
            role: Role::Assistant,
            content: &outcome.answer,
            verification: Some(outcome.verdict.to_string()),
            elapsed_ms: Some(outcome.elapsed.as_millis()),
        })
    }

    fn write_line<T: Serialize>(&mut self, line: &T) -> Result<()> {
        let json = serde_json::to_string(line).context("Failed to encode transcript line")?;
        writeln!(self.writer, "{}", json)
            .and_then(|_| self.writer.flush())
            .with_context(|| format!("Failed to write transcript: {}", self.path.display()))?;
        self.lines += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written so far, header included.
    pub fn lines(&self) -> usize {
        self.lines
    }
}

impl Drop for Transcript {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use orin_core::Verdict;

    fn info() -> SessionInfo<'static> {
        SessionInfo {
            model: "qwen.gguf",
            system_prompt: "Be brief.",
            window_size: 6,
        }
    }

    fn outcome(answer: &str) -> TurnOutcome {
        TurnOutcome {
            answer: answer.to_string(),
            reasoning: String::new(),
            verdict: Verdict::Verified,
            run: None,
            calls: 2,
            elapsed: Duration::from_millis(1500),
            raw_output: answer.to_string(),
            show_reasoning: false,
            generated_words: 1,
        }
    }

    #[test]
    fn test_transcript_writes_header_and_turns() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = Transcript::create(dir.path(), &info()).unwrap();

        let name = transcript.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("session_"));
        assert!(name.ends_with(".jsonl"));

        transcript.record_turn("What is 2+2?", &outcome("4")).unwrap();
        assert_eq!(transcript.lines(), 3);

        // Flushed without dropping.
        let content = std::fs::read_to_string(transcript.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "session_start");
        assert_eq!(lines[0]["window_size"], 6);
        assert_eq!(lines[1]["role"], "user");
        assert_eq!(lines[1]["content"], "What is 2+2?");
        assert!(lines[1].get("verification").is_none());
        assert_eq!(lines[2]["role"], "assistant");
        assert_eq!(lines[2]["content"], "4");
        assert_eq!(lines[2]["verification"], "verified");
        assert_eq!(lines[2]["elapsed_ms"], 1500);
    }

    #[test]
    fn test_new_sessions_get_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = Transcript::create(dir.path(), &info()).unwrap();
        let second = Transcript::create(dir.path(), &info()).unwrap();
        assert_ne!(first.path(), second.path());
    }

    #[test]
    fn test_existing_file_is_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("session_20260101_120000.jsonl");
        std::fs::write(&taken, "keep").unwrap();

        let (path, _file) = create_unique(dir.path(), "20260101_120000").unwrap();
        assert_eq!(path, dir.path().join("session_20260101_120000_1.jsonl"));
        assert_eq!(std::fs::read_to_string(&taken).unwrap(), "keep");

        let (next, _file) = create_unique(dir.path(), "20260101_120000").unwrap();
        assert_eq!(next, dir.path().join("session_20260101_120000_2.jsonl"));
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("orin").join("sessions");
        let transcript = Transcript::create(&nested, &info()).unwrap();
        assert!(transcript.path().starts_with(&nested));
    }
}
