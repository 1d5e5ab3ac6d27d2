//! Dialogue management for voxloop sessions
//!
//! Turns final transcripts into streamed, interruptible spoken responses.
//! The state machine in [`state`] is pure; [`manager::DialogueManager`] wires
//! it to the language model and the synthesis stage.

pub mod chunker;
pub mod manager;
pub mod state;

pub use chunker::SentenceChunker;
pub use manager::DialogueManager;
pub use state::{Action, DialogueEvent, DialogueState};
