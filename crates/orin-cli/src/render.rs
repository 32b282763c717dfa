//! Terminal output for turns and REPL messages.

use std::io::{self, Stdout, Write};
use std::time::Duration;

use crossterm::style::{Attribute, Color, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal::size;
use crossterm::QueueableCommand;

use orin_core::{Phase, TurnEvent, TurnSink, Verdict};

use crate::spinner::Spinner;

/// Where the current phase's output stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Reasoning,
    Answer,
}

pub struct TerminalRenderer {
    out: Stdout,
    /// Colors and spinner; off when stdout is not a terminal.
    styled: bool,
    spinner: Option<Spinner>,
    section: Section,
    /// Printed a header for this phase's answer but no text yet.
    answer_started: bool,
    iteration: u32,
}

impl TerminalRenderer {
    pub fn new(styled: bool) -> Self {
        Self {
            out: io::stdout(),
            styled,
            spinner: None,
            section: Section::None,
            answer_started: false,
            iteration: 0,
        }
    }

    pub fn detect() -> Self {
        Self::new(atty::is(atty::Stream::Stdout))
    }

    fn color(&mut self, color: Color) -> io::Result<()> {
        if self.styled {
            self.out.queue(SetForegroundColor(color))?;
        }
        Ok(())
    }

    fn bold(&mut self) -> io::Result<()> {
        if self.styled {
            self.out.queue(SetAttribute(Attribute::Bold))?;
        }
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        if self.styled {
            self.out.queue(SetAttribute(Attribute::Reset))?;
            self.out.queue(ResetColor)?;
        }
        Ok(())
    }

    fn line(&mut self, color: Color, text: &str) -> io::Result<()> {
        self.color(color)?;
        writeln!(self.out, "{}", text)?;
        self.reset()?;
        self.out.flush()
    }

    /// Print a section header with styling.
    pub fn print_section_header(&mut self, title: &str) -> io::Result<()> {
        let width = size().map(|(w, _)| w as usize).unwrap_or(80).min(100);
        let title_len = title.chars().count() + 2;
        let remaining = width.saturating_sub(title_len).saturating_sub(1);
        let left_len = remaining / 2;
        let right_len = remaining - left_len;

        self.color(Color::DarkGrey)?;
        write!(self.out, "{} ", "─".repeat(left_len))?;
        self.color(Color::Cyan)?;
        write!(self.out, "{}", title)?;
        self.color(Color::DarkGrey)?;
        writeln!(self.out, " {}", "─".repeat(right_len))?;
        self.reset()?;
        self.out.flush()
    }

    pub fn print_status(&mut self, msg: &str) -> io::Result<()> {
        self.line(Color::Green, &format!("✓ {}", msg))
    }

    pub fn print_info(&mut self, msg: &str) -> io::Result<()> {
        self.line(Color::DarkGrey, msg)
    }

    pub fn print_warning(&mut self, msg: &str) -> io::Result<()> {
        self.line(Color::Yellow, msg)
    }

    pub fn print_error(&mut self, msg: &str) -> io::Result<()> {
        self.color(Color::Red)?;
        self.out.flush()?;
        eprintln!("Error: {}", msg);
        self.reset()?;
        self.out.flush()
    }

    pub fn print_prompt_hint(&mut self) -> io::Result<()> {
        self.line(
            Color::DarkGrey,
            "/help · /exit or Ctrl+D · empty line or Ctrl+D submits · Ctrl+C interrupts",
        )
    }

    pub fn print_help(&mut self) -> io::Result<()> {
        self.color(Color::Cyan)?;
        self.bold()?;
        writeln!(self.out, "\nCommands:")?;
        self.reset()?;
        for (cmd, desc) in [
            ("/help", "Show this help message"),
            ("/clear", "Clear conversation history"),
            ("/new", "Start a new conversation session"),
            ("/thinking [mode]", "Cycle or set reasoning display (auto/always/never)"),
            ("/verify", "Toggle answer verification (alias: /interleaved)"),
            ("/stats", "Show session statistics"),
            ("/debug", "Show the last raw model output"),
            ("/exit, /quit", "Exit"),
        ] {
            self.color(Color::Green)?;
            write!(self.out, "  {:<18}", cmd)?;
            self.reset()?;
            writeln!(self.out, "{}", desc)?;
        }
        writeln!(self.out)?;
        writeln!(self.out, "Type a message over one or more lines; an empty line or Ctrl+D sends it.")?;
        writeln!(self.out, "In auto mode reasoning is shown for analytical or longer questions.\n")?;
        self.out.flush()
    }

    /// `[1.2s, ~14.0 tok/s]` after an answer.
    pub fn print_timing(&mut self, elapsed: Duration, tokens_per_second: f64) -> io::Result<()> {
        self.line(
            Color::DarkGrey,
            &format!(
                "[{:.1}s, ~{:.1} tok/s]\n",
                elapsed.as_secs_f64(),
                tokens_per_second
            ),
        )
    }

    /// Print a block of text between two dim rules.
    pub fn print_block(&mut self, title: &str, body: &str) -> io::Result<()> {
        self.print_section_header(title)?;
        writeln!(self.out, "{}", body)?;
        self.print_section_header(&format!("end {}", title))
    }

    fn stop_spinner(&mut self) {
        if let Some(mut spinner) = self.spinner.take() {
            spinner.stop();
        }
    }

    /// Stop any spinner left over from an interrupted or failed turn.
    pub fn abort_turn(&mut self) {
        self.stop_spinner();
        if self.section != Section::None {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
        }
        self.section = Section::None;
    }

    fn answer_title(&self, phase: Phase) -> String {
        match phase {
            Phase::Drafting => "Response".to_string(),
            Phase::Critiquing => "Verification".to_string(),
            Phase::Revising => format!("Revision {}", self.iteration + 1),
            Phase::Accepted => "Answer".to_string(),
        }
    }

    fn handle(&mut self, event: TurnEvent) -> io::Result<()> {
        match event {
            TurnEvent::PhaseStarted { phase, iteration } => {
                self.section = Section::None;
                self.answer_started = false;
                self.iteration = iteration;
                if self.styled {
                    let label = match phase {
                        Phase::Drafting => "Thinking",
                        Phase::Critiquing => "Verifying",
                        Phase::Revising => "Revising",
                        Phase::Accepted => "Finishing",
                    };
                    self.spinner = Some(Spinner::start(label));
                }
            }
            TurnEvent::Reasoning { text, .. } => {
                self.stop_spinner();
                if self.section != Section::Reasoning {
                    self.print_section_header("Thinking")?;
                    self.section = Section::Reasoning;
                }
                self.color(Color::DarkGrey)?;
                write!(self.out, "{}", text)?;
                self.reset()?;
                self.out.flush()?;
            }
            TurnEvent::Answer { phase, text } => {
                self.stop_spinner();
                // Leading blank lines after a reasoning span are noise.
                let text = if self.answer_started {
                    text.as_str()
                } else {
                    text.trim_start()
                };
                if text.is_empty() {
                    return Ok(());
                }
                if self.section != Section::Answer {
                    if self.section == Section::Reasoning {
                        writeln!(self.out)?;
                    }
                    let title = self.answer_title(phase);
                    self.print_section_header(&title)?;
                    self.section = Section::Answer;
                }
                self.answer_started = true;
                if phase == Phase::Critiquing {
                    self.color(Color::DarkGrey)?;
                }
                write!(self.out, "{}", text)?;
                self.reset()?;
                self.out.flush()?;
            }
            TurnEvent::PhaseFinished { unterminated, .. } => {
                self.stop_spinner();
                if self.section != Section::None {
                    writeln!(self.out)?;
                }
                if unterminated {
                    self.line(Color::Yellow, "(the output ended inside an unclosed reasoning marker)")?;
                }
                self.section = Section::None;
                self.out.flush()?;
            }
            TurnEvent::Degraded { phase, error } => {
                self.stop_spinner();
                if self.section != Section::None {
                    writeln!(self.out)?;
                    self.section = Section::None;
                }
                self.line(
                    Color::Yellow,
                    &format!("Verification stopped while {}: {}", phase, error),
                )?;
            }
            TurnEvent::Finished { verdict } => {
                self.stop_spinner();
                match &verdict {
                    Verdict::NotRequested => {}
                    Verdict::Verified => self.line(Color::Green, "✓ verified")?,
                    Verdict::CapReached | Verdict::Unverified(_) => {
                        self.line(Color::Yellow, &format!("! {}", verdict))?
                    }
                }
            }
        }
        Ok(())
    }
}

impl TurnSink for TerminalRenderer {
    fn on_event(&mut self, event: TurnEvent) {
        if let Err(e) = self.handle(event) {
            tracing::debug!(error = %e, "Failed to write to terminal");
        }
    }
}

impl Drop for TerminalRenderer {
    fn drop(&mut self) {
        self.stop_spinner();
    }
}
