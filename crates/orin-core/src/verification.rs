//! Turn controller: draft an answer, then optionally critique and revise it.
//!
//! Every phase is one backend call whose output is streamed through a
//! [`TagStreamParser`] and reported to a [`TurnSink`] as it arrives. The
//! conversation history is only written once the whole turn has completed, so
//! an interrupt or a failed draft leaves it exactly as it was.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendCall, BackendRequest, GenerationParams};
use crate::display::{should_show_reasoning, ReasoningDisplay};
use crate::error::{BackendError, Error};
use crate::history::{ConversationHistory, Turn, TurnMetrics};
use crate::parser::{Markers, ParsedResponse, Segment, SegmentKind, TagStreamParser};
use crate::prompt::render_prompt;

pub const CRITIQUE_REQUEST: &str = "Verify your previous answer. If it is correct and complete, \
reply with \"NO ISSUES\". Otherwise reply with \"ISSUES:\" followed by the corrections needed.";

const INCOMPLETE_CRITIQUE: &str = "the critique ended before reaching a verdict";

pub const REVISION_REQUEST: &str =
    "Rewrite your answer applying those corrections. Reply with the corrected answer only.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Maximum number of revisions per turn. Zero disables verification.
    #[serde(default = "default_iteration_cap")]
    pub iteration_cap: u32,

    #[serde(default = "default_critique_temperature")]
    pub critique_temperature: f32,

    #[serde(default = "default_critique_max_tokens")]
    pub critique_max_tokens: u32,

    /// Phrases in a critique that mean the candidate needs another revision.
    #[serde(default = "default_problem_markers")]
    pub problem_markers: Vec<String>,
}

fn default_iteration_cap() -> u32 {
    1
}

fn default_critique_temperature() -> f32 {
    0.2
}

fn default_critique_max_tokens() -> u32 {
    256
}

fn default_problem_markers() -> Vec<String> {
    [
        "issues:",
        "incorrect",
        "mistake",
        "error in",
        "wrong",
        "inaccurate",
        "needs correction",
        "should be",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            iteration_cap: default_iteration_cap(),
            critique_temperature: default_critique_temperature(),
            critique_max_tokens: default_critique_max_tokens(),
            problem_markers: default_problem_markers(),
        }
    }
}

impl VerificationConfig {
    pub fn signals_problem(&self, critique: &str) -> bool {
        let critique = critique.to_lowercase();
        self.problem_markers
            .iter()
            .any(|marker| critique.contains(&marker.to_lowercase()))
    }

    fn critique_params(&self, base: &GenerationParams) -> GenerationParams {
        base.clone()
            .with_temperature(self.critique_temperature)
            .with_max_tokens(self.critique_max_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Drafting,
    Critiquing,
    Revising,
    Accepted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Drafting => write!(f, "drafting"),
            Phase::Critiquing => write!(f, "critiquing"),
            Phase::Revising => write!(f, "revising"),
            Phase::Accepted => write!(f, "accepted"),
        }
    }
}

/// How the final answer of a turn was arrived at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Verification was off for this turn.
    NotRequested,
    /// A critique found nothing to correct.
    Verified,
    /// The revision limit was hit; the latest revision is used.
    CapReached,
    /// A critique or revision call failed; the best candidate so far is used.
    Unverified(String),
}

impl Verdict {
    /// Whether a verification pass ran to completion.
    pub fn completed(&self) -> bool {
        matches!(self, Verdict::Verified | Verdict::CapReached)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::NotRequested => write!(f, "not verified"),
            Verdict::Verified => write!(f, "verified"),
            Verdict::CapReached => write!(f, "revised (iteration limit reached)"),
            Verdict::Unverified(reason) => write!(f, "unverified: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRun {
    pub original_answer: String,
    pub critique: Option<String>,
    pub corrected_answer: Option<String>,
    pub iterations: u32,
    pub iteration_cap: u32,
    pub phase: Phase,
}

impl VerificationRun {
    fn new(original_answer: String, iteration_cap: u32) -> Self {
        Self {
            original_answer,
            critique: None,
            corrected_answer: None,
            iterations: 0,
            iteration_cap,
            phase: Phase::Drafting,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub answer: String,
    pub reasoning: String,
    pub verdict: Verdict,
    pub run: Option<VerificationRun>,
    pub calls: u32,
    pub elapsed: Duration,
    /// Unparsed output of the last call, for `/debug`.
    pub raw_output: String,
    pub show_reasoning: bool,
    pub generated_words: usize,
}

impl TurnOutcome {
    pub fn metrics(&self) -> TurnMetrics {
        TurnMetrics {
            generated_words: self.generated_words,
            elapsed: self.elapsed,
            verified: self.verdict.completed(),
        }
    }
}

/// Progress of a turn, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    PhaseStarted { phase: Phase, iteration: u32 },
    Reasoning { phase: Phase, text: String },
    Answer { phase: Phase, text: String },
    PhaseFinished {
        phase: Phase,
        elapsed: Duration,
        unterminated: bool,
    },
    Degraded { phase: Phase, error: BackendError },
    Finished { verdict: Verdict },
}

pub trait TurnSink: Send {
    fn on_event(&mut self, event: TurnEvent);
}

impl TurnSink for Vec<TurnEvent> {
    fn on_event(&mut self, event: TurnEvent) {
        self.push(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TurnOptions {
    pub display: ReasoningDisplay,
    pub verify: bool,
}

struct PhaseOutput {
    parsed: ParsedResponse,
    raw: String,
}

enum Step {
    Chunk(Option<String>),
    Interrupted,
}

pub struct VerificationLoop {
    backend: Arc<dyn Backend>,
    markers: Markers,
    params: GenerationParams,
    config: VerificationConfig,
    timeout: Option<Duration>,
}

impl VerificationLoop {
    pub fn new(
        backend: Arc<dyn Backend>,
        markers: Markers,
        params: GenerationParams,
        config: VerificationConfig,
    ) -> Self {
        Self {
            backend,
            markers,
            params,
            config,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Answer one question and commit the exchange to `history`.
    ///
    /// Returns [`Error::Cancelled`] if `interrupt` fires at any point, and the
    /// drafting call's error if the draft fails. In both cases `history` is
    /// left untouched.
    pub async fn run_turn(
        &self,
        history: &mut ConversationHistory,
        question: &str,
        options: &TurnOptions,
        interrupt: &CancellationToken,
        sink: &mut dyn TurnSink,
    ) -> Result<TurnOutcome, Error> {
        let started = Instant::now();
        let show_reasoning = should_show_reasoning(question, options.display);

        let mut turns = history.prompt_view();
        turns.push(Turn::user(question));

        let mut calls = 1;
        let draft = self
            .invoke(Phase::Drafting, 0, &turns, &self.params, show_reasoning, interrupt, sink)
            .await?;
        let mut generated_words = word_count(&draft.raw);

        let mut answer = draft.parsed.final_answer().to_string();
        if answer.is_empty() {
            return Err(BackendError::EmptyOutput.into());
        }
        let mut reasoning = draft.parsed.reasoning.clone();
        let mut raw_output = draft.raw;

        let cap = self.config.iteration_cap;
        let (verdict, run) = if !options.verify || cap == 0 {
            (Verdict::NotRequested, None)
        } else {
            let mut run = VerificationRun::new(answer.clone(), cap);
            let critique_params = self.config.critique_params(&self.params);

            let verdict = loop {
                let mut critique_turns = turns.clone();
                critique_turns.push(Turn::assistant(answer.as_str()));
                critique_turns.push(Turn::user(CRITIQUE_REQUEST));

                run.phase = Phase::Critiquing;
                calls += 1;
                let critique = match self
                    .invoke(
                        Phase::Critiquing,
                        run.iterations,
                        &critique_turns,
                        &critique_params,
                        false,
                        interrupt,
                        sink,
                    )
                    .await
                {
                    Ok(output) => output,
                    Err(Error::Backend(err)) => break self.degrade(Phase::Critiquing, err, sink),
                    Err(err) => return Err(err),
                };
                generated_words += word_count(&critique.raw);
                raw_output = critique.raw;

                // A critique cut short has no verdict of its own; judge it by
                // everything it said.
                let concluded =
                    !critique.parsed.unterminated && !critique.parsed.final_answer().is_empty();
                let critique_text = if concluded {
                    critique.parsed.final_answer().to_string()
                } else {
                    [critique.parsed.reasoning.trim(), critique.parsed.final_answer()]
                        .iter()
                        .filter(|part| !part.is_empty())
                        .copied()
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                let needs_revision = self.config.signals_problem(&critique_text);
                run.critique = Some(critique_text.clone());
                if !needs_revision {
                    if concluded {
                        break Verdict::Verified;
                    }
                    warn!("Critique ended without a verdict, keeping the current answer");
                    break Verdict::Unverified(INCOMPLETE_CRITIQUE.to_string());
                }

                let mut revision_turns = critique_turns;
                revision_turns.push(Turn::assistant(critique_text));
                revision_turns.push(Turn::user(REVISION_REQUEST));

                run.phase = Phase::Revising;
                calls += 1;
                let revision = match self
                    .invoke(
                        Phase::Revising,
                        run.iterations,
                        &revision_turns,
                        &self.params,
                        show_reasoning,
                        interrupt,
                        sink,
                    )
                    .await
                {
                    Ok(output) => output,
                    Err(Error::Backend(err)) => break self.degrade(Phase::Revising, err, sink),
                    Err(err) => return Err(err),
                };
                generated_words += word_count(&revision.raw);
                raw_output = revision.raw;
                run.iterations += 1;

                let revised = revision.parsed.final_answer();
                if revised.is_empty() {
                    debug!("Revision had no answer text, keeping the previous candidate");
                } else {
                    answer = revised.to_string();
                    reasoning = revision.parsed.reasoning.clone();
                    run.corrected_answer = Some(answer.clone());
                }

                if run.iterations >= cap {
                    break Verdict::CapReached;
                }
            };

            run.phase = Phase::Accepted;
            (verdict, Some(run))
        };

        if interrupt.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let outcome = TurnOutcome {
            answer,
            reasoning,
            verdict: verdict.clone(),
            run,
            calls,
            elapsed: started.elapsed(),
            raw_output,
            show_reasoning,
            generated_words,
        };

        history.record_turn(question, &outcome.answer, &outcome.metrics());
        info!(calls, verdict = %verdict, elapsed = ?outcome.elapsed, "Turn complete");
        sink.on_event(TurnEvent::Finished { verdict });

        Ok(outcome)
    }

    fn degrade(&self, phase: Phase, error: BackendError, sink: &mut dyn TurnSink) -> Verdict {
        warn!(%phase, error = %error, "Verification call failed, keeping the current answer");
        let verdict = Verdict::Unverified(error.to_string());
        sink.on_event(TurnEvent::Degraded { phase, error });
        verdict
    }

    /// Run one backend call to completion, streaming classified text to `sink`.
    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        phase: Phase,
        iteration: u32,
        turns: &[Turn],
        params: &GenerationParams,
        show_reasoning: bool,
        interrupt: &CancellationToken,
        sink: &mut dyn TurnSink,
    ) -> Result<PhaseOutput, Error> {
        sink.on_event(TurnEvent::PhaseStarted { phase, iteration });
        let started = Instant::now();

        let request = BackendRequest::new(render_prompt(turns), params.clone())
            .with_timeout(self.timeout);
        debug!(call = %request.id, %phase, iteration, backend = self.backend.name(), "Starting backend call");

        let mut call = tokio::select! {
            biased;
            _ = interrupt.cancelled() => return Err(Error::Cancelled),
            call = self.backend.start(request) => call?,
        };

        let mut parser = TagStreamParser::new(self.markers.clone());
        let mut parsed = ParsedResponse::default();
        let mut raw = String::new();

        loop {
            let step = tokio::select! {
                biased;
                _ = interrupt.cancelled() => Step::Interrupted,
                chunk = call.next_chunk() => Step::Chunk(chunk),
            };

            match step {
                Step::Interrupted => return Err(abandon(&mut call).await),
                Step::Chunk(Some(chunk)) => {
                    raw.push_str(&chunk);
                    for segment in parser.feed(&chunk) {
                        deliver(phase, &segment, show_reasoning, sink);
                        parsed.push(&segment);
                    }
                }
                Step::Chunk(None) => break,
            }
        }

        for segment in parser.finish() {
            deliver(phase, &segment, show_reasoning, sink);
            parsed.push(&segment);
        }
        parsed.close(&parser);

        let waited = tokio::select! {
            biased;
            _ = interrupt.cancelled() => None,
            report = call.wait() => Some(report),
        };
        let report = match waited {
            Some(report) => report?,
            None => return Err(abandon(&mut call).await),
        };
        if report.cancelled {
            return Err(Error::Cancelled);
        }

        if parsed.ambiguities > 0 {
            debug!(call = %report.id, count = parsed.ambiguities, "Response contained stray markers");
        }

        // A draft that never left its reasoning span still has to answer.
        if phase == Phase::Drafting && parsed.final_answer().is_empty() {
            let fallback = parsed.reasoning.trim().to_string();
            if !fallback.is_empty() {
                warn!(call = %report.id, "Response had no answer text, using its reasoning instead");
                parsed.answer = fallback.clone();
                sink.on_event(TurnEvent::Answer {
                    phase,
                    text: fallback,
                });
            }
        }

        sink.on_event(TurnEvent::PhaseFinished {
            phase,
            elapsed: started.elapsed(),
            unterminated: parsed.unterminated,
        });

        Ok(PhaseOutput { parsed, raw })
    }
}

/// Stop a call on user interrupt and wait until its process is gone.
async fn abandon(call: &mut BackendCall) -> Error {
    call.cancel();
    if let Err(err) = call.wait().await {
        debug!(call = %call.id(), error = %err, "Interrupted call ended with an error");
    }
    Error::Cancelled
}

fn deliver(phase: Phase, segment: &Segment, show_reasoning: bool, sink: &mut dyn TurnSink) {
    match segment.kind {
        SegmentKind::Reasoning if show_reasoning => sink.on_event(TurnEvent::Reasoning {
            phase,
            text: segment.text.clone(),
        }),
        SegmentKind::Reasoning => {}
        SegmentKind::Answer => sink.on_event(TurnEvent::Answer {
            phase,
            text: segment.text.clone(),
        }),
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
