//! Session state machines for the two operating modes.
//!
//! [`conversation`] hosts the per-browser push-to-talk machine;
//! [`broadcast`] hosts the long-lived publisher-driven machine. Both share
//! the [`Utterance`] bookkeeping type defined here.

pub mod broadcast;
pub mod conversation;

use tracing::warn;

/// Lifecycle of one utterance.
///
/// Transitions are monotonic along the pipeline order; `Failed` absorbs
/// any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UtteranceState {
    Open,
    Finalizing,
    Finalized,
    Translating,
    Synthesizing,
    Delivered,
    Failed,
}

/// One speaker-bounded unit of speech and its accumulated transcript.
///
/// Finals are committed segments; the latest interim is kept only for the
/// client-facing transcript preview and is never fed to the translator.
#[derive(Debug)]
pub struct Utterance {
    ordinal: u64,
    state: UtteranceState,
    finals: Vec<String>,
    latest_interim: String,
}

impl Utterance {
    pub fn new(ordinal: u64) -> Self {
        Self {
            ordinal,
            state: UtteranceState::Open,
            finals: Vec::new(),
            latest_interim: String::new(),
        }
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn state(&self) -> UtteranceState {
        self.state
    }

    /// Advance along the pipeline. Backward transitions are rejected and
    /// logged; `Failed` is always reachable.
    pub fn advance(&mut self, next: UtteranceState) {
        if next == UtteranceState::Failed {
            self.state = UtteranceState::Failed;
            return;
        }
        if self.state == UtteranceState::Failed || next <= self.state {
            warn!(
                ordinal = self.ordinal,
                from = ?self.state,
                to = ?next,
                "ignoring non-monotonic utterance transition"
            );
            return;
        }
        self.state = next;
    }

    pub fn fail(&mut self) {
        self.advance(UtteranceState::Failed);
    }

    /// Record a committed transcript segment. The interim preview resets:
    /// finals supersede it.
    pub fn push_final(&mut self, text: &str) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.finals.push(trimmed.to_string());
        }
        self.latest_interim.clear();
    }

    /// Record the newest interim hypothesis.
    pub fn set_interim(&mut self, text: &str) {
        self.latest_interim = text.trim().to_string();
    }

    /// The committed transcript: concatenation of all finals. This is the
    /// only text ever handed to the translator.
    pub fn final_text(&self) -> String {
        self.finals.join(" ")
    }

    /// The growing transcript shown to the client while recording:
    /// committed finals plus the newest interim.
    pub fn preview_text(&self) -> String {
        if self.latest_interim.is_empty() {
            self.final_text()
        } else if self.finals.is_empty() {
            self.latest_interim.clone()
        } else {
            format!("{} {}", self.final_text(), self.latest_interim)
        }
    }

    /// Whether any committed transcript exists.
    pub fn has_finals(&self) -> bool {
        !self.finals.is_empty()
    }

    /// Word count of the committed transcript.
    pub fn word_count(&self) -> usize {
        self.finals.iter().map(|f| f.split_whitespace().count()).sum()
    }

    /// Discard accumulated transcript without changing state. Used by the
    /// broadcast session after handing a segment to the pipeline.
    pub fn reset_transcript(&mut self) {
        self.finals.clear();
        self.latest_interim.clear();
    }
}
