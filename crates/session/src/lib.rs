//! Session orchestration for voxloop
//!
//! Owns the lifecycle of per-participant pipelines: join the transport,
//! wire gate → transcription → dialogue → synthesis with frame buses, track
//! everything in a registry, and tear it all down exactly once.

pub mod loopback;
pub mod orchestrator;

pub use loopback::{LoopbackRemote, LoopbackTransport};
pub use orchestrator::{Capabilities, SessionOrchestrator};
