//! Media transport contract
//!
//! The transport joins a room, delivers inbound audio, accepts outbound
//! audio, and reports participant presence. Everything else about the
//! underlying media stack is its own business.

use crate::audio::AudioFrame;
use crate::bus::{FrameReceiver, FrameSender};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Parameters for joining a room
#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub room: String,
    pub participant_name: String,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            room: "default-room".to_string(),
            participant_name: "assistant".to_string(),
        }
    }
}

/// Terminal and presence events from the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The remote participant left; fatal for the session
    ParticipantLeft { reason: String },
}

/// A joined media session: one remote participant, two audio edges.
pub struct TransportSession {
    /// Audio captured from the remote participant
    pub inbound: FrameReceiver<AudioFrame>,
    /// Audio to play to the remote participant
    pub outbound: FrameSender<AudioFrame>,
    /// Presence / connectivity events
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Join a room and return the media edges for one participant session.
    async fn join(&self, config: JoinConfig) -> Result<TransportSession>;
}
