//! Per-turn decision on whether reasoning text is rendered.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Questions longer than this many words show reasoning in `auto` mode.
pub const AUTO_WORD_THRESHOLD: usize = 12;

/// Conversational fillers that never warrant visible reasoning.
const FILLERS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "yo",
    "sup",
    "thanks",
    "thank you",
    "thx",
    "ty",
    "ok",
    "okay",
    "cool",
    "nice",
    "great",
    "yes",
    "no",
    "yep",
    "nope",
    "sure",
    "bye",
    "goodbye",
    "good morning",
    "good afternoon",
    "good evening",
    "good night",
    "how are you",
    "whats up",
    "what's up",
];

/// Words that ask for analysis rather than a quick fact.
const ANALYTICAL_CUES: &[&str] = &[
    "explain",
    "explanation",
    "why",
    "how",
    "analyze",
    "analyse",
    "analysis",
    "compare",
    "comparison",
    "contrast",
    "difference",
    "differences",
    "versus",
    "vs",
    "reason",
    "reasoning",
    "prove",
    "proof",
    "derive",
    "evaluate",
    "calculate",
    "solve",
    "step",
    "steps",
    "tradeoff",
    "tradeoffs",
    "pros",
    "cons",
    "implications",
    "justify",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningDisplay {
    #[default]
    Auto,
    Always,
    Never,
}

impl ReasoningDisplay {
    /// The mode `/thinking` switches to from this one.
    pub fn next(self) -> Self {
        match self {
            ReasoningDisplay::Auto => ReasoningDisplay::Always,
            ReasoningDisplay::Always => ReasoningDisplay::Never,
            ReasoningDisplay::Never => ReasoningDisplay::Auto,
        }
    }
}

impl fmt::Display for ReasoningDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasoningDisplay::Auto => write!(f, "auto"),
            ReasoningDisplay::Always => write!(f, "always"),
            ReasoningDisplay::Never => write!(f, "never"),
        }
    }
}

impl FromStr for ReasoningDisplay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ReasoningDisplay::Auto),
            "always" | "on" => Ok(ReasoningDisplay::Always),
            "never" | "off" => Ok(ReasoningDisplay::Never),
            other => Err(Error::config(format!(
                "unknown reasoning display mode '{}' (expected auto, always or never)",
                other
            ))),
        }
    }
}

pub fn should_show_reasoning(question: &str, mode: ReasoningDisplay) -> bool {
    match mode {
        ReasoningDisplay::Always => true,
        ReasoningDisplay::Never => false,
        ReasoningDisplay::Auto => classify(question),
    }
}

fn classify(question: &str) -> bool {
    let normalized = normalize(question);
    let words: Vec<&str> = normalized.split_whitespace().collect();

    if words.is_empty() || is_filler(&normalized, &words) {
        return false;
    }

    if words.iter().any(|w| ANALYTICAL_CUES.contains(w)) {
        return true;
    }

    words.len() > AUTO_WORD_THRESHOLD
}

/// Lowercase, drop punctuation other than apostrophes, collapse whitespace.
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Exact filler, or a filler followed by a single word ("hi there", "thanks again").
fn is_filler(normalized: &str, words: &[&str]) -> bool {
    FILLERS.iter().any(|filler| {
        if normalized == *filler {
            return true;
        }
        let filler_words = filler.split(' ').count();
        words.len() == filler_words + 1
            && normalized
                .strip_prefix(filler)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}
