//! Capability traits for the external engines the pipeline consumes
//!
//! Vendor SDKs — whether push- or pull-based — are adapted to these
//! stream/cancellable-call contracts so the core's concurrency model never
//! depends on vendor API shape.

mod llm;
mod speech;
mod transport;

pub use llm::{CompletionChunk, CompletionRequest, LlmCapability, Message, Role};
pub use speech::{GateEvent, SttCapability, TtsCapability, VadCapability};
pub use transport::{JoinConfig, Transport, TransportEvent, TransportSession};
