//! Pipeline stages for the voxloop voice loop
//!
//! Independent stages, each running as its own tokio task and talking to
//! its neighbours only through frame buses:
//!
//! - [`gate::VoiceActivityGate`] — speech/silence boundary detection
//! - [`transcribe::TranscriptionStage`] — streaming speech-to-text
//! - [`synth::SynthesisStage`] — streaming text-to-speech with barge-in
//! - [`playout::PlayoutStage`] — paced delivery to the transport, with
//!   flushing of cancelled turns' queued audio

pub mod gate;
pub mod playout;
pub mod synth;
pub mod transcribe;

use voxloop_core::{AudioFrame, SegmentId, TurnId};

pub use gate::{GateConfig, HangoverGate, VoiceActivityGate};
pub use playout::{OutboundFrame, PlayoutStage};
pub use synth::{SynthCommand, SynthEvent, SynthesisStage};
pub use transcribe::{TranscriptEvent, TranscriptionStage};

/// Framing on the gate → transcription bus.
///
/// Boundaries travel in-band with the audio so ordering between frames and
/// segment open/close can never be violated.
#[derive(Debug, Clone)]
pub enum SegmentFrame {
    /// A speech segment opened
    Open(SegmentId),
    /// Audio belonging to the open segment
    Audio(SegmentId, AudioFrame),
    /// The segment closed; `forced` marks interruption/teardown closes
    Close { segment: SegmentId, forced: bool },
}

/// Out-of-band stage health signals, reported to the session orchestrator.
#[derive(Debug, Clone)]
pub enum StageSignal {
    /// VAD capability failed; the gate fell back to energy-based gating
    DegradedMode { reason: String },
    /// STT failed mid-segment; the segment yields no final transcript
    TranscriptionFailed { segment: SegmentId, reason: String },
    /// TTS failed mid-turn; the turn was truncated
    SynthesisFailed { turn: TurnId, reason: String },
}
