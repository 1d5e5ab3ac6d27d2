//! Core types and traits for the voxloop voice-conversation pipeline
//!
//! This crate provides the foundation shared by every stage:
//! - Audio frame types and PCM utilities
//! - Transcript and conversation types
//! - The frame bus connecting pipeline stages
//! - The error taxonomy
//! - Capability traits for the external VAD, STT, LLM, TTS, and transport

pub mod audio;
pub mod bus;
pub mod conversation;
pub mod error;
pub mod transcript;
pub mod traits;

pub use audio::{AudioBuffer, AudioFrame, Direction, SampleRate};
pub use bus::{bus, FrameReceiver, FrameSender, RecvError, SendError, TrySendError};
pub use conversation::{ConversationHistory, ResponseChunk, Turn, TurnId, TurnRole, TurnStatus};
pub use error::{Error, Result};
pub use transcript::{SegmentId, Transcript};
pub use traits::{
    CompletionChunk, CompletionRequest, GateEvent, JoinConfig, LlmCapability, Message, Role,
    SttCapability, Transport, TransportEvent, TransportSession, TtsCapability, VadCapability,
};

/// Unique identifier for one participant session.
pub type SessionId = uuid::Uuid;
