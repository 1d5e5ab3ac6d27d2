//! Error taxonomy for the voxloop pipeline
//!
//! Per-segment and per-turn failures are recovered locally and never
//! terminate a session; only transport loss or an undefined state-machine
//! transition is fatal.

use crate::conversation::TurnId;
use crate::transcript::SegmentId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bus buffer bound exceeded; backpressure, not data loss
    #[error("bus overloaded: {0}")]
    Overloaded(&'static str),

    /// Frame could not be delivered before bus closure
    #[error("frame discarded on closed bus: {0}")]
    Discarded(&'static str),

    /// VAD capability unavailable; the gate fails open
    #[error("vad unavailable, gate failing open: {0}")]
    DegradedMode(String),

    /// STT failed mid-segment; the segment yields no final transcript
    #[error("transcription failed for segment {segment}: {reason}")]
    TranscriptionFailed { segment: SegmentId, reason: String },

    /// LLM failed; surfaced to the user as a fallback turn
    #[error("completion failed for turn {turn}: {reason}")]
    CompletionFailed { turn: TurnId, reason: String },

    /// TTS failed mid-turn; the turn is truncated gracefully
    #[error("synthesis failed for turn {turn}: {reason}")]
    SynthesisFailed { turn: TurnId, reason: String },

    /// Participant or session connectivity gone; fatal for the session
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// State machine received an event with no defined transition
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Capability-specific failure from an external engine
    #[error("capability error: {0}")]
    Capability(String),
}

impl Error {
    /// Whether this error must tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TransportLost(_) | Error::InvariantViolation(_))
    }
}
