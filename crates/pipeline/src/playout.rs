//! Outbound playout
//!
//! Final hop before the transport. Synthesis hands over turn-tagged frames;
//! this stage forwards them at playback rate and drops every frame of a
//! flushed turn, so audio already queued for a cancelled response never
//! reaches the participant.
//!
//! Pacing matters for barge-in: it keeps the deep buffer on the purgeable
//! bus behind this stage rather than inside the transport, where a flush
//! could no longer reach it.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voxloop_core::{AudioFrame, FrameReceiver, FrameSender, Result, TurnId};

/// An outbound frame still attributable to the turn that produced it.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub turn: TurnId,
    pub frame: AudioFrame,
}

pub struct PlayoutStage {
    outbound: FrameSender<AudioFrame>,
    flushes: mpsc::Receiver<TurnId>,
    /// Turns whose remaining audio must be dropped
    flushed: HashSet<TurnId>,
}

impl PlayoutStage {
    pub fn new(outbound: FrameSender<AudioFrame>, flushes: mpsc::Receiver<TurnId>) -> Self {
        Self {
            outbound,
            flushes,
            flushed: HashSet::new(),
        }
    }

    /// Run until the frame bus closes or the session is cancelled.
    pub async fn run(
        mut self,
        mut frames: FrameReceiver<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut flushes_open = true;
        loop {
            // Flush notices are polled before frames so a barge-in takes
            // effect ahead of whatever audio is already queued.
            let out = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                notice = self.flushes.recv(), if flushes_open => {
                    match notice {
                        Some(turn) => {
                            tracing::debug!(%turn, "flushing queued turn audio");
                            self.flushed.insert(turn);
                        },
                        None => flushes_open = false,
                    }
                    continue;
                },
                received = frames.recv() => match received {
                    Ok(out) => out,
                    Err(_) => break,
                },
            };

            // A flush racing the frame we just pulled still wins.
            while let Ok(turn) = self.flushes.try_recv() {
                tracing::debug!(%turn, "flushing queued turn audio");
                self.flushed.insert(turn);
            }
            if self.flushed.contains(&out.turn) {
                continue;
            }

            let pace = out.frame.duration;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = self.outbound.send(out.frame) => {
                    if sent.is_err() {
                        tracing::debug!("transport outbound closed; playout stopping");
                        break;
                    }
                },
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pace) => {},
            }
        }

        self.outbound.close();
        Ok(())
    }
}
