//! Conversation log with a sliding prompt window.
//!
//! The log keeps every turn of the session for the transcript and `/stats`.
//! Only [`ConversationHistory::prompt_view`] is windowed: it returns the system
//! turn followed by the most recent `window_size` user/assistant pairs.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Orin, a helpful AI assistant. \
Be concise, clear, and accurate. Think step-by-step for complex questions.";

pub const DEFAULT_WINDOW_SIZE: usize = 6;

/// Rough words-to-tokens factor used for throughput estimates.
const TOKENS_PER_WORD: f64 = 1.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Measurements for one completed turn, folded into the session statistics.
#[derive(Debug, Clone, Default)]
pub struct TurnMetrics {
    pub generated_words: usize,
    pub elapsed: Duration,
    pub verified: bool,
}

impl TurnMetrics {
    pub fn tokens_per_second(&self) -> f64 {
        throughput(self.generated_words, self.elapsed)
    }
}

fn throughput(words: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        words as f64 * TOKENS_PER_WORD / secs
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub turns: usize,
    pub questions: usize,
    pub verified_turns: usize,
    pub generated_words: usize,
    pub generation_time: Duration,
}

impl SessionStats {
    pub fn tokens_per_second(&self) -> f64 {
        throughput(self.generated_words, self.generation_time)
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs();
        write!(
            f,
            "Session: {}m {}s | Messages: {} | Questions: {}",
            secs / 60,
            secs % 60,
            self.turns,
            self.questions
        )?;
        if self.verified_turns > 0 {
            write!(f, " | Verified: {}", self.verified_turns)?;
        }
        if self.generation_time > Duration::ZERO {
            write!(f, " | ~{:.1} tok/s", self.tokens_per_second())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConversationHistory {
    system_prompt: String,
    turns: Vec<Turn>,
    window_size: usize,
    started_at: DateTime<Local>,
    questions: usize,
    verified_turns: usize,
    generated_words: usize,
    generation_time: Duration,
}

impl ConversationHistory {
    /// A window smaller than one pair would hide the newest turn, so it is raised to one.
    pub fn new(system_prompt: impl Into<String>, window_size: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            turns: Vec::new(),
            window_size: window_size.max(1),
            started_at: Local::now(),
            questions: 0,
            verified_turns: 0,
            generated_words: 0,
            generation_time: Duration::ZERO,
        }
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Append a completed question/answer pair and account for it.
    pub fn record_turn(&mut self, question: &str, answer: &str, metrics: &TurnMetrics) {
        self.append(Turn::user(question));
        self.append(Turn::assistant(answer));
        self.questions += 1;
        self.generated_words += metrics.generated_words;
        self.generation_time += metrics.elapsed;
        if metrics.verified {
            self.verified_turns += 1;
        }
    }

    /// System turn plus the newest `window_size` turn-pairs, oldest first.
    pub fn prompt_view(&self) -> Vec<Turn> {
        let start = self.window_start();
        let mut view = Vec::with_capacity(1 + self.turns.len() - start);
        view.push(Turn {
            role: Role::System,
            content: self.system_prompt.clone(),
            timestamp: self.started_at.with_timezone(&Utc),
        });
        view.extend_from_slice(&self.turns[start..]);
        view
    }

    /// Index of the first logged turn inside the prompt window.
    ///
    /// The window always begins at a user turn so a pair is never split. A log
    /// with no user turns at all is returned whole.
    fn window_start(&self) -> usize {
        let mut pairs = 0;
        let mut start = None;

        for (i, turn) in self.turns.iter().enumerate().rev() {
            if turn.role == Role::User {
                pairs += 1;
                if pairs > self.window_size {
                    break;
                }
                start = Some(i);
            }
        }

        start.unwrap_or(0)
    }

    pub fn full_log(&self) -> &[Turn] {
        &self.turns
    }

    /// Forget the conversation but keep the session clock and totals.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.questions = 0;
    }

    /// Start over completely, as if the session had just begun.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.started_at = Local::now();
        self.questions = 0;
        self.verified_turns = 0;
        self.generated_words = 0;
        self.generation_time = Duration::ZERO;
    }

    pub fn stats(&self) -> SessionStats {
        let elapsed = (Local::now() - self.started_at)
            .to_std()
            .unwrap_or_default();
        SessionStats {
            started_at: self.started_at,
            elapsed,
            turns: self.turns.len(),
            questions: self.questions,
            verified_turns: self.verified_turns,
            generated_words: self.generated_words,
            generation_time: self.generation_time,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT, DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_with_pairs(window: usize, pairs: usize) -> ConversationHistory {
        let mut history = ConversationHistory::new("sys", window);
        for i in 0..pairs {
            history.record_turn(&format!("q{}", i), &format!("a{}", i), &TurnMetrics::default());
        }
        history
    }

    fn contents(turns: &[Turn]) -> Vec<&str> {
        turns.iter().map(|t| t.content.as_str()).collect()
    }

    #[test]
    fn test_prompt_view_starts_with_system() {
        let history = ConversationHistory::new("be brief", 3);
        let view = history.prompt_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].role, Role::System);
        assert_eq!(view[0].content, "be brief");
    }

    #[test]
    fn test_prompt_view_is_windowed_suffix() {
        let history = history_with_pairs(2, 5);
        let view = history.prompt_view();

        assert_eq!(contents(&view), vec!["sys", "q3", "a3", "q4", "a4"]);
        assert_eq!(history.full_log().len(), 10);
    }

    #[test]
    fn test_prompt_view_never_exceeds_window() {
        for window in 1..5 {
            let mut history = ConversationHistory::new("sys", window);
            for i in 0..8 {
                history.append(Turn::user(format!("q{}", i)));
                let view = history.prompt_view();
                let users = view.iter().filter(|t| t.role == Role::User).count();
                assert!(users <= window);
                assert_eq!(view.last().unwrap().content, format!("q{}", i));

                history.append(Turn::assistant(format!("a{}", i)));
                let view = history.prompt_view();
                assert!(view.iter().filter(|t| t.role == Role::User).count() <= window);
                assert_eq!(view.last().unwrap().content, format!("a{}", i));
            }
        }
    }

    #[test]
    fn test_window_keeps_pairs_together() {
        let history = history_with_pairs(1, 3);
        let view = history.prompt_view();
        assert_eq!(view[1].role, Role::User);
        assert_eq!(contents(&view), vec!["sys", "q2", "a2"]);
    }

    #[test]
    fn test_zero_window_is_raised() {
        let history = history_with_pairs(0, 2);
        assert_eq!(history.window_size(), 1);
        assert_eq!(contents(&history.prompt_view()), vec!["sys", "q1", "a1"]);
    }

    #[test]
    fn test_clear_keeps_clock() {
        let mut history = history_with_pairs(4, 2);
        let started = history.started_at();
        history.clear();

        assert!(history.is_empty());
        assert_eq!(history.stats().questions, 0);
        assert_eq!(history.started_at(), started);
    }

    #[test]
    fn test_reset_clears_statistics() {
        let mut history = ConversationHistory::new("sys", 4);
        history.record_turn(
            "q",
            "a",
            &TurnMetrics {
                generated_words: 10,
                elapsed: Duration::from_secs(2),
                verified: true,
            },
        );
        assert_eq!(history.stats().verified_turns, 1);
        assert_eq!(history.stats().generated_words, 10);

        history.reset();
        let stats = history.stats();
        assert_eq!(stats.turns, 0);
        assert_eq!(stats.verified_turns, 0);
        assert_eq!(stats.generated_words, 0);
        assert_eq!(stats.generation_time, Duration::ZERO);
    }

    #[test]
    fn test_stats_display() {
        let mut history = ConversationHistory::new("sys", 4);
        history.record_turn(
            "q",
            "a",
            &TurnMetrics {
                generated_words: 20,
                elapsed: Duration::from_secs(2),
                verified: false,
            },
        );

        let stats = history.stats();
        assert_eq!(stats.turns, 2);
        assert_eq!(stats.questions, 1);
        assert!((stats.tokens_per_second() - 13.0).abs() < 1e-9);

        let line = stats.to_string();
        assert!(line.contains("Messages: 2"));
        assert!(line.contains("Questions: 1"));
        assert!(line.contains("tok/s"));
    }
}
