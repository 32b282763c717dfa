//! orin-core: streaming session core for orin
//!
//! This crate holds everything between the REPL and the inference process:
//! the reasoning/answer stream parser, the windowed conversation history, the
//! reasoning display policy, the backend call handle and the turn controller
//! with its optional self-verification pass.

pub mod backend;
pub mod display;
pub mod error;
pub mod history;
pub mod parser;
pub mod prompt;
pub mod verification;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{
    chunk_channel, Backend, BackendCall, BackendRequest, CallId, ExitReport, GenerationParams,
    ProcessExit, ProducerTask,
};
pub use display::{should_show_reasoning, ReasoningDisplay};
pub use error::{BackendError, Error};
pub use history::{
    ConversationHistory, Role, SessionStats, Turn, TurnMetrics, DEFAULT_SYSTEM_PROMPT,
    DEFAULT_WINDOW_SIZE,
};
pub use parser::{
    coalesce, parse_complete, Markers, ParseAmbiguity, ParsedResponse, ParserMode, Segment,
    SegmentKind, TagStreamParser,
};
pub use prompt::render_prompt;
pub use verification::{
    Phase, TurnEvent, TurnOptions, TurnOutcome, TurnSink, Verdict, VerificationConfig,
    VerificationLoop, VerificationRun,
};

pub type Result<T> = std::result::Result<T, Error>;
