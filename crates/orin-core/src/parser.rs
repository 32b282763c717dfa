//! Incremental classification of a streamed response into reasoning and answer text.
//!
//! The backend wraps its deliberation in a pair of markers (`<think>` and
//! `</think>` by default). Chunks arrive with arbitrary boundaries, so a marker
//! may be split across two or more chunks. The parser holds back the shortest
//! suffix that could still turn into a marker and releases everything else
//! immediately, which keeps output latency at one chunk.
//!
//! Nesting is not supported: an open marker seen while already inside a
//! reasoning span is literal reasoning text, and a close marker seen outside
//! one is literal answer text. Both cases are recorded as [`ParseAmbiguity`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

/// Which side of the markers a piece of text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Reasoning,
    Answer,
}

/// A classified run of response text. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Reasoning,
            text: text.into(),
        }
    }

    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Answer,
            text: text.into(),
        }
    }

    pub fn is_reasoning(&self) -> bool {
        self.kind == SegmentKind::Reasoning
    }
}

/// The open/close pair delimiting reasoning spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Markers {
    pub open: String,
    pub close: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            open: "<think>".to_string(),
            close: "</think>".to_string(),
        }
    }
}

impl Markers {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Result<Self, Error> {
        let markers = Self {
            open: open.into(),
            close: close.into(),
        };
        markers.validate()?;
        Ok(markers)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.open.is_empty() || self.close.is_empty() {
            return Err(Error::config("reasoning markers must not be empty"));
        }
        if self.open == self.close {
            return Err(Error::config(format!(
                "open and close markers must differ (both are {:?})",
                self.open
            )));
        }
        Ok(())
    }

    /// Remove every occurrence of both markers from `text`.
    pub fn strip(&self, text: &str) -> String {
        text.replace(&self.open, "").replace(&self.close, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    Outside,
    Inside,
}

impl ParserMode {
    fn kind(self) -> SegmentKind {
        match self {
            ParserMode::Outside => SegmentKind::Answer,
            ParserMode::Inside => SegmentKind::Reasoning,
        }
    }
}

/// Marker-like text that was passed through as literal content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmbiguity {
    pub mode: ParserMode,
    pub marker: String,
}

enum MarkerScan {
    /// A full marker starts at this byte offset.
    Complete(usize),
    /// The buffer from this offset to its end is a strict prefix of the marker.
    Partial(usize),
    None,
}

fn scan_for_marker(haystack: &str, marker: &str) -> MarkerScan {
    let Some(first) = marker.chars().next() else {
        return MarkerScan::None;
    };

    for (at, _) in haystack.match_indices(first) {
        let tail = &haystack[at..];
        if tail.starts_with(marker) {
            return MarkerScan::Complete(at);
        }
        if marker.starts_with(tail) {
            return MarkerScan::Partial(at);
        }
    }

    MarkerScan::None
}

/// Two-state streaming parser. One instance per response.
#[derive(Debug)]
pub struct TagStreamParser {
    markers: Markers,
    mode: ParserMode,
    pending: String,
    ambiguities: Vec<ParseAmbiguity>,
    unterminated: bool,
}

impl TagStreamParser {
    pub fn new(markers: Markers) -> Self {
        Self {
            markers,
            mode: ParserMode::Outside,
            pending: String::new(),
            ambiguities: Vec::new(),
            unterminated: false,
        }
    }

    /// Consume one chunk and return every segment that can be decided so far.
    pub fn feed(&mut self, chunk: &str) -> Vec<Segment> {
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.push_str(chunk);

        let mut segments = Vec::new();
        let mut cursor = 0;

        while cursor < buffer.len() {
            let rest = &buffer[cursor..];
            let (scan, marker_len) = {
                let marker = match self.mode {
                    ParserMode::Outside => self.markers.open.as_str(),
                    ParserMode::Inside => self.markers.close.as_str(),
                };
                (scan_for_marker(rest, marker), marker.len())
            };

            match scan {
                MarkerScan::Complete(at) => {
                    self.emit(&mut segments, &rest[..at]);
                    cursor += at + marker_len;
                    self.mode = match self.mode {
                        ParserMode::Outside => ParserMode::Inside,
                        ParserMode::Inside => ParserMode::Outside,
                    };
                }
                MarkerScan::Partial(at) => {
                    self.emit(&mut segments, &rest[..at]);
                    self.pending = rest[at..].to_string();
                    break;
                }
                MarkerScan::None => {
                    self.emit(&mut segments, rest);
                    break;
                }
            }
        }

        segments
    }

    /// Flush held-back text at end of stream.
    ///
    /// Any pending partial marker is released as answer text. A stream that
    /// ends inside a reasoning span or in the middle of a marker is flagged as
    /// unterminated.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();

        if self.mode == ParserMode::Inside {
            self.unterminated = true;
            debug!("Response ended inside an unterminated reasoning span");
        }

        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            self.unterminated = true;
            debug!(pending = %pending, "Response ended in the middle of a marker");
            segments.push(Segment::answer(pending));
        }

        self.mode = ParserMode::Outside;
        segments
    }

    fn emit(&mut self, segments: &mut Vec<Segment>, text: &str) {
        if text.is_empty() {
            return;
        }

        // Only the marker that cannot cause a transition in this mode can appear here.
        let stray = match self.mode {
            ParserMode::Outside => &self.markers.close,
            ParserMode::Inside => &self.markers.open,
        };
        if text.contains(stray.as_str()) {
            debug!(marker = %stray, mode = ?self.mode, "Treating stray marker as literal text");
            self.ambiguities.push(ParseAmbiguity {
                mode: self.mode,
                marker: stray.clone(),
            });
        }

        segments.push(Segment {
            kind: self.mode.kind(),
            text: text.to_string(),
        });
    }

    pub fn mode(&self) -> ParserMode {
        self.mode
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn ambiguities(&self) -> &[ParseAmbiguity] {
        &self.ambiguities
    }

    pub fn is_unterminated(&self) -> bool {
        self.unterminated
    }
}

/// Reasoning and answer text accumulated over one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub reasoning: String,
    pub answer: String,
    pub unterminated: bool,
    pub ambiguities: usize,
}

impl ParsedResponse {
    pub fn push(&mut self, segment: &Segment) {
        match segment.kind {
            SegmentKind::Reasoning => self.reasoning.push_str(&segment.text),
            SegmentKind::Answer => self.answer.push_str(&segment.text),
        }
    }

    /// Record end-of-stream diagnostics from the parser that produced the segments.
    pub fn close(&mut self, parser: &TagStreamParser) {
        self.unterminated = parser.is_unterminated();
        self.ambiguities = parser.ambiguities().len();
    }

    /// The answer with surrounding whitespace removed.
    pub fn final_answer(&self) -> &str {
        self.answer.trim()
    }
}

/// Parse a complete response in one pass.
pub fn parse_complete(text: &str, markers: &Markers) -> ParsedResponse {
    let mut parser = TagStreamParser::new(markers.clone());
    let mut parsed = ParsedResponse::default();

    for segment in parser.feed(text).iter().chain(parser.finish().iter()) {
        parsed.push(segment);
    }
    parsed.close(&parser);
    parsed
}

/// Merge adjacent segments of the same kind.
pub fn coalesce(segments: impl IntoIterator<Item = Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::new();
    for segment in segments {
        match merged.last_mut() {
            Some(last) if last.kind == segment.kind => last.text.push_str(&segment.text),
            _ => merged.push(segment),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> Vec<Segment> {
        let mut parser = TagStreamParser::new(Markers::default());
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(parser.feed(chunk));
        }
        out.extend(parser.finish());
        out
    }

    fn concat(segments: &[Segment]) -> String {
        segments.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let split = run(&["<th", "ink>reason</think>answer"]);
        let whole = run(&["<think>reason</think>answer"]);

        assert_eq!(split, vec![Segment::reasoning("reason"), Segment::answer("answer")]);
        assert_eq!(split, whole);
    }

    #[test]
    fn test_partial_marker_is_held_back() {
        let mut parser = TagStreamParser::new(Markers::default());
        assert!(parser.feed("<th").is_empty());
        assert_eq!(parser.pending(), "<th");

        let segments = parser.feed("ink>x");
        assert_eq!(segments, vec![Segment::reasoning("x")]);
        assert_eq!(parser.mode(), ParserMode::Inside);
    }

    #[test]
    fn test_false_start_is_released() {
        let segments = coalesce(run(&["a <th", "is is fine"]));
        assert_eq!(segments, vec![Segment::answer("a <this is fine")]);
    }

    #[test]
    fn test_no_markers_is_one_answer() {
        let segments = coalesce(run(&["Paris is ", "the capital", " of France."]));
        assert_eq!(
            segments,
            vec![Segment::answer("Paris is the capital of France.")]
        );
    }

    #[test]
    fn test_nested_open_marker_is_literal() {
        let mut parser = TagStreamParser::new(Markers::default());
        let mut segments = parser.feed("<think>a<think>b</think>c");
        segments.extend(parser.finish());

        assert_eq!(
            coalesce(segments),
            vec![Segment::reasoning("a<think>b"), Segment::answer("c")]
        );
        assert_eq!(parser.ambiguities().len(), 1);
        assert_eq!(parser.ambiguities()[0].mode, ParserMode::Inside);
    }

    #[test]
    fn test_close_marker_outside_is_literal() {
        let parsed = parse_complete("done</think> really", &Markers::default());
        assert_eq!(parsed.answer, "done</think> really");
        assert!(parsed.reasoning.is_empty());
        assert_eq!(parsed.ambiguities, 1);
    }

    #[test]
    fn test_unterminated_reasoning_flagged() {
        let mut parser = TagStreamParser::new(Markers::default());
        let mut segments = parser.feed("<think>still going</thi");
        segments.extend(parser.finish());

        assert_eq!(
            segments,
            vec![Segment::reasoning("still going"), Segment::answer("</thi")]
        );
        assert!(parser.is_unterminated());
    }

    #[test]
    fn test_trailing_partial_open_marker_flushed_as_answer() {
        let segments = run(&["answer <thi"]);
        assert_eq!(concat(&segments), "answer <thi");
        assert!(segments.iter().all(|s| s.kind == SegmentKind::Answer));

        let parsed = parse_complete("answer <thi", &Markers::default());
        assert_eq!(parsed.answer, "answer <thi");
        assert!(parsed.unterminated);
    }

    #[test]
    fn test_complete_answer_is_not_unterminated() {
        let parsed = parse_complete("answer < this", &Markers::default());
        assert!(!parsed.unterminated);
    }

    #[test]
    fn test_repeated_marker_first_char() {
        let segments = coalesce(run(&["<", "<", "think>r<", "/think>"]));
        assert_eq!(segments, vec![Segment::answer("<"), Segment::reasoning("r")]);
    }

    #[test]
    fn test_multibyte_text_around_markers() {
        let segments = coalesce(run(&["é<thi", "nk>ü→", "</think>ß"]));
        assert_eq!(
            segments,
            vec![
                Segment::answer("é"),
                Segment::reasoning("ü→"),
                Segment::answer("ß")
            ]
        );
    }

    #[test]
    fn test_custom_markers() {
        let markers = Markers::new("[[", "]]").unwrap();
        let parsed = parse_complete("[[plan]]result", &markers);
        assert_eq!(parsed.reasoning, "plan");
        assert_eq!(parsed.answer, "result");
    }

    #[test]
    fn test_invalid_markers_rejected() {
        assert!(Markers::new("", "</think>").is_err());
        assert!(Markers::new("<x>", "<x>").is_err());
    }

    #[test]
    fn test_chunking_invariance() {
        // (input, whether every marker in it is a real transition)
        let inputs = [
            ("<think>step one\nstep two</think>The answer is 4.", true),
            ("intro <think>a</think> middle <think>b</think> end", true),
            ("<<think>>x<</think>>", true),
            ("<think>unterminated <think> nested", false),
            ("no markers at all, just </think> stray text <thin", false),
        ];
        let markers = Markers::default();

        for (input, clean) in inputs {
            let reference = coalesce(run(&[input]));
            if clean {
                assert_eq!(concat(&reference), markers.strip(input));
            }

            let boundaries: Vec<usize> = input.char_indices().map(|(i, _)| i).skip(1).collect();

            // Every split into two and three chunks.
            for (n, &a) in boundaries.iter().enumerate() {
                let two = run(&[&input[..a], &input[a..]]);
                assert_eq!(coalesce(two), reference, "split at {} of {:?}", a, input);

                for &b in &boundaries[n + 1..] {
                    let three = run(&[&input[..a], &input[a..b], &input[b..]]);
                    assert_eq!(coalesce(three), reference, "split at {},{} of {:?}", a, b, input);
                }
            }

            // One character per chunk.
            let singles: Vec<String> = input.chars().map(|c| c.to_string()).collect();
            let refs: Vec<&str> = singles.iter().map(String::as_str).collect();
            assert_eq!(coalesce(run(&refs)), reference);
        }
    }

    #[test]
    fn test_parsed_response_trims_answer() {
        let parsed = parse_complete("<think>hmm</think>\n\n  42  \n", &Markers::default());
        assert_eq!(parsed.final_answer(), "42");
        assert_eq!(parsed.reasoning, "hmm");
        assert!(!parsed.unterminated);
    }
}
