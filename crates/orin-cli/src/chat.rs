//! Interactive chat mode with readline support.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config as EditorConfig, Editor};
use tokio_util::sync::CancellationToken;

use orin_core::{
    Backend, ConversationHistory, Error, ReasoningDisplay, TurnOptions, TurnOutcome,
    VerificationLoop,
};

use crate::config::Config;
use crate::render::TerminalRenderer;
use crate::transcript::{SessionInfo, Transcript};

/// Print the statistics line every this many questions.
const STATS_EVERY: usize = 5;

/// Toggles the REPL commands change during a session.
#[derive(Debug, Clone, Copy)]
struct SessionSettings {
    pub display: ReasoningDisplay,
    pub verify: bool,
}

impl SessionSettings {
    fn turn_options(&self) -> TurnOptions {
        TurnOptions {
            display: self.display,
            verify: self.verify,
        }
    }
}

/// Chat commands
#[derive(Debug, PartialEq, Eq)]
enum ChatCommand {
    Quit,
    Help,
    Clear,
    New,
    Thinking(Option<String>),
    Verify,
    Stats,
    Debug,
    Unknown(String),
    Message(String), // Regular message
}

fn parse_command(input: &str) -> ChatCommand {
    let trimmed = input.trim();

    if !trimmed.starts_with('/') {
        return ChatCommand::Message(trimmed.to_string());
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    match cmd.as_str() {
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        "/help" | "/?" => ChatCommand::Help,
        "/clear" => ChatCommand::Clear,
        "/new" => ChatCommand::New,
        "/thinking" => ChatCommand::Thinking(arg),
        "/verify" | "/interleaved" => ChatCommand::Verify,
        "/stats" => ChatCommand::Stats,
        "/debug" => ChatCommand::Debug,
        _ => ChatCommand::Unknown(cmd),
    }
}

/// Chat session state
pub struct ChatSession {
    verifier: VerificationLoop,
    history: ConversationHistory,
    settings: SessionSettings,
    renderer: TerminalRenderer,
    transcript: Option<Transcript>,
    transcript_dir: Option<PathBuf>,
    model_label: String,
    last_raw_output: Option<String>,
}

impl ChatSession {
    pub fn new(
        config: &Config,
        backend: Arc<dyn Backend>,
        renderer: TerminalRenderer,
        transcript_dir: Option<PathBuf>,
    ) -> Self {
        let timeout = config
            .session
            .timeout_secs
            .map(std::time::Duration::from_secs);
        let verifier = VerificationLoop::new(
            backend,
            config.markers.clone(),
            config.generation.clone(),
            config.verification.clone(),
        )
        .with_timeout(timeout);

        let model_label = config
            .backend
            .model
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| config.backend.model.display().to_string());

        let mut session = Self {
            verifier,
            history: ConversationHistory::new(
                config.session.system_prompt.clone(),
                config.session.window_size,
            ),
            settings: SessionSettings {
                display: config.session.thinking,
                verify: config.session.verify,
            },
            renderer,
            transcript: None,
            transcript_dir,
            model_label,
            last_raw_output: None,
        };
        session.open_transcript();
        session
    }

    fn open_transcript(&mut self) {
        let Some(dir) = &self.transcript_dir else {
            return;
        };
        let info = SessionInfo {
            model: &self.model_label,
            system_prompt: self.history.system_prompt(),
            window_size: self.history.window_size(),
        };
        match Transcript::create(dir, &info) {
            Ok(transcript) => self.transcript = Some(transcript),
            Err(e) => {
                tracing::warn!(error = %e, "Transcript disabled");
                let _ = self
                    .renderer
                    .print_warning(&format!("Transcript disabled: {:#}", e));
            }
        }
    }

    /// Close the current transcript, reporting where it went if anything was said.
    fn close_transcript(&mut self) {
        if let Some(transcript) = self.transcript.take() {
            if transcript.lines() > 1 {
                let _ = self.renderer.print_info(&format!(
                    "Session saved to {}",
                    transcript.path().display()
                ));
            }
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Run one question through the verification loop, interruptible with Ctrl+C.
    pub async fn ask(&mut self, question: &str) -> std::result::Result<TurnOutcome, Error> {
        let interrupt = CancellationToken::new();
        let watcher = {
            let token = interrupt.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            })
        };

        let options = self.settings.turn_options();
        let result = self
            .verifier
            .run_turn(
                &mut self.history,
                question,
                &options,
                &interrupt,
                &mut self.renderer,
            )
            .await;
        watcher.abort();

        match &result {
            Ok(outcome) => {
                self.last_raw_output = Some(outcome.raw_output.clone());
                if let Some(transcript) = &mut self.transcript {
                    if let Err(e) = transcript.record_turn(question, outcome) {
                        tracing::warn!(error = %e, "Failed to write transcript");
                    }
                }
            }
            Err(_) => self.renderer.abort_turn(),
        }
        result
    }

    /// Ask and report the result on the terminal. The session stays usable on error.
    async fn ask_interactive(&mut self, question: &str) {
        match self.ask(question).await {
            Ok(outcome) => {
                let _ = self
                    .renderer
                    .print_timing(outcome.elapsed, outcome.metrics().tokens_per_second());
                let questions = self.history.stats().questions;
                if questions > 0 && questions % STATS_EVERY == 0 {
                    let _ = self.renderer.print_info(&self.history.stats().to_string());
                }
            }
            Err(Error::Cancelled) => {
                let _ = self.renderer.print_warning("\nGeneration interrupted\n");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Turn failed");
                let _ = self.renderer.print_error(&e.to_string());
            }
        }
    }

    fn print_stats(&mut self) -> std::io::Result<()> {
        let stats = self.history.stats();
        let prompt: String = self.history.system_prompt().chars().take(100).collect();
        let settings = format!(
            "Thinking: {} | Verification: {} | Window: {} pairs | Backend: {} ({})",
            self.settings.display,
            if self.settings.verify { "on" } else { "off" },
            self.history.window_size(),
            self.verifier.backend_name(),
            self.model_label,
        );

        self.renderer.print_info(&format!("\n{}", stats))?;
        self.renderer.print_info(&settings)?;
        self.renderer.print_info(&format!("System: {}...\n", prompt))
    }

    /// Apply a command. Returns false when the session should end.
    fn handle_command(&mut self, command: ChatCommand) -> bool {
        let renderer = &mut self.renderer;
        let shown = match command {
            ChatCommand::Quit => return false,
            ChatCommand::Help => renderer.print_help(),
            ChatCommand::Clear => {
                self.history.clear();
                renderer.print_status("Conversation history cleared")
            }
            ChatCommand::New => {
                self.close_transcript();
                self.history.reset();
                self.last_raw_output = None;
                self.open_transcript();
                self.renderer.print_status("Started new conversation session")
            }
            ChatCommand::Thinking(arg) => {
                let next = match arg {
                    None => Ok(self.settings.display.next()),
                    Some(arg) => arg.parse::<ReasoningDisplay>(),
                };
                match next {
                    Ok(mode) => {
                        self.settings.display = mode;
                        renderer.print_status(&format!("Thinking display mode: {}", mode))
                    }
                    Err(e) => renderer.print_warning(&e.to_string()),
                }
            }
            ChatCommand::Verify => {
                self.settings.verify = !self.settings.verify;
                if self.settings.verify {
                    renderer.print_status(&format!(
                        "Verification: ON (up to {} revision(s) per answer)",
                        self.verifier.config().iteration_cap
                    ))
                } else {
                    renderer.print_status("Verification: OFF")
                }
            }
            ChatCommand::Stats => self.print_stats(),
            ChatCommand::Debug => match &self.last_raw_output {
                Some(raw) => renderer.print_block("Last Raw Output", raw),
                None => renderer.print_warning("No output to show yet"),
            },
            ChatCommand::Unknown(cmd) => renderer.print_warning(&format!(
                "Unknown command: {}. Type /help for available commands.",
                cmd
            )),
            ChatCommand::Message(_) => Ok(()),
        };

        if let Err(e) = shown {
            tracing::debug!(error = %e, "Failed to write to terminal");
        }
        true
    }

    /// Read-eval-print loop until `/exit` or end of input.
    pub async fn run(&mut self) -> Result<()> {
        let config = EditorConfig::builder()
            .history_ignore_space(true)
            .history_ignore_dups(true)?
            .build();
        let mut rl: Editor<(), FileHistory> = Editor::with_config(config)?;

        let history_path = Config::history_path();
        if let Some(path) = &history_path {
            let _ = rl.load_history(path);
        }

        let _ = self.renderer.print_prompt_hint();

        loop {
            let text = match read_input(&mut rl)? {
                Input::Text(text) => text,
                Input::Interrupted => {
                    println!("^C");
                    continue;
                }
                Input::Eof => break,
            };

            if text.is_empty() {
                continue;
            }
            let _ = rl.add_history_entry(text.as_str());

            match parse_command(&text) {
                ChatCommand::Message(question) => self.ask_interactive(&question).await,
                command => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
            }
        }

        println!("Goodbye!");
        self.close_transcript();

        // Save history
        if let Some(path) = &history_path {
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            let _ = rl.save_history(path);
        }

        Ok(())
    }
}

enum Input {
    Text(String),
    Interrupted,
    Eof,
}

/// Read one message: a command line, or lines up to an empty line or Ctrl+D.
fn read_input(rl: &mut Editor<(), FileHistory>) -> Result<Input> {
    let first = match rl.readline("you> ") {
        Ok(line) => line,
        Err(ReadlineError::Interrupted) => return Ok(Input::Interrupted),
        Err(ReadlineError::Eof) => return Ok(Input::Eof),
        Err(e) => return Err(anyhow::anyhow!("Error reading input: {}", e)),
    };

    if first.trim().is_empty() || first.trim_start().starts_with('/') {
        return Ok(Input::Text(first.trim().to_string()));
    }

    let mut lines = vec![first];
    loop {
        match rl.readline("...  ") {
            Ok(line) if line.trim().is_empty() => break,
            Ok(line) => lines.push(line),
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => return Ok(Input::Interrupted),
            Err(e) => return Err(anyhow::anyhow!("Error reading input: {}", e)),
        }
    }

    Ok(Input::Text(lines.join("\n").trim().to_string()))
}
