//! In-process transport
//!
//! Connects a session's audio edges to a [`LoopbackRemote`] handed to the
//! caller, standing in for a real media stack in tests and local demos.

use async_trait::async_trait;
use tokio::sync::mpsc;

use voxloop_core::{
    bus, AudioFrame, Error, FrameReceiver, FrameSender, JoinConfig, Result, Transport,
    TransportEvent, TransportSession,
};

/// The far side of one loopback session.
pub struct LoopbackRemote {
    /// Feed microphone audio into the session
    pub inbound: FrameSender<AudioFrame>,
    /// Read audio the session plays back
    pub outbound: FrameReceiver<AudioFrame>,
    /// Inject presence events (e.g. participant leaving)
    pub events: mpsc::Sender<TransportEvent>,
    pub room: String,
}

pub struct LoopbackTransport {
    remotes: mpsc::Sender<LoopbackRemote>,
    inbound_capacity: usize,
    outbound_capacity: usize,
}

impl LoopbackTransport {
    /// Returns the transport plus the receiver on which each `join` delivers
    /// its remote end.
    pub fn new(
        inbound_capacity: usize,
        outbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<LoopbackRemote>) {
        let (remotes, remote_rx) = mpsc::channel(4);
        (
            Self {
                remotes,
                inbound_capacity,
                outbound_capacity,
            },
            remote_rx,
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn join(&self, config: JoinConfig) -> Result<TransportSession> {
        let (inbound_tx, inbound_rx) = bus(self.inbound_capacity);
        let (outbound_tx, outbound_rx) = bus(self.outbound_capacity);
        let (event_tx, event_rx) = mpsc::channel(8);

        let remote = LoopbackRemote {
            inbound: inbound_tx,
            outbound: outbound_rx,
            events: event_tx,
            room: config.room.clone(),
        };
        self.remotes
            .send(remote)
            .await
            .map_err(|_| Error::TransportLost("loopback peer dropped".to_string()))?;

        tracing::debug!(room = %config.room, "loopback transport joined");
        Ok(TransportSession {
            inbound: inbound_rx,
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}
