//! Response synthesis stage
//!
//! Turns ordered response chunks into ordered outbound audio. Synthesis
//! runs chunk-ahead: while one chunk's audio is being sent, up to
//! `chunk_ahead` later chunks may already be synthesizing, which hides TTS
//! latency without unbounded buffering.
//!
//! Every chunk carries its turn's cancellation token. A barge-in cancels
//! the token; the stage then drops that turn's unsent audio immediately and
//! moves on to whatever chunk is queued next, with no draining delay.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voxloop_core::{
    AudioFrame, Direction, FrameReceiver, FrameSender, ResponseChunk, Result, TtsCapability,
    TurnId,
};

use crate::playout::OutboundFrame;
use crate::StageSignal;

/// Work item on the dialogue → synthesis bus.
#[derive(Debug, Clone)]
pub struct SynthCommand {
    pub chunk: ResponseChunk,
    /// The owning turn's cancellation token
    pub cancel: CancellationToken,
}

/// Feedback to the dialogue manager.
#[derive(Debug, Clone)]
pub enum SynthEvent {
    /// A chunk's audio has fully left the stage; its text is now "spoken"
    ChunkSent {
        turn: TurnId,
        index: u32,
        text: String,
    },
    /// The turn's final chunk finished sending
    TurnComplete { turn: TurnId },
    /// TTS failed; the turn is truncated at the last sent chunk
    Failed { turn: TurnId, reason: String },
}

/// Per-chunk prefetch buffer depth
const PREFETCH_BUFFER: usize = 8;

pub struct SynthesisStage {
    tts: Arc<dyn TtsCapability>,
    chunk_ahead: usize,
    outbound: FrameSender<OutboundFrame>,
    events: mpsc::Sender<SynthEvent>,
    signals: mpsc::Sender<StageSignal>,
    /// Outbound frames get a fresh per-session monotonic sequence
    next_sequence: u64,
}

/// A chunk whose synthesis is already running ahead of playback.
struct PrefetchedChunk {
    chunk: ResponseChunk,
    cancel: CancellationToken,
    frames: mpsc::Receiver<Result<AudioFrame>>,
}

impl SynthesisStage {
    pub fn new(
        tts: Arc<dyn TtsCapability>,
        chunk_ahead: usize,
        outbound: FrameSender<OutboundFrame>,
        events: mpsc::Sender<SynthEvent>,
        signals: mpsc::Sender<StageSignal>,
    ) -> Self {
        Self {
            tts,
            chunk_ahead: chunk_ahead.max(1),
            outbound,
            events,
            signals,
            next_sequence: 0,
        }
    }

    /// Run until the command bus closes or the session is cancelled.
    pub async fn run(
        mut self,
        mut commands: FrameReceiver<SynthCommand>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut inflight: VecDeque<PrefetchedChunk> = VecDeque::new();
        let mut commands_open = true;

        loop {
            // Keep up to chunk_ahead synthesis calls running ahead of the
            // chunk currently being sent.
            while commands_open && inflight.len() < self.chunk_ahead {
                match commands.try_recv() {
                    Some(command) => inflight.push_back(self.prefetch(command)),
                    None => break,
                }
            }

            let current = match inflight.pop_front() {
                Some(chunk) => chunk,
                None if commands_open => {
                    let command = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        received = commands.recv() => match received {
                            Ok(command) => command,
                            Err(_) => {
                                commands_open = false;
                                continue;
                            },
                        },
                    };
                    inflight.push_back(self.prefetch(command));
                    continue;
                },
                None => break,
            };

            self.send_chunk(current, &cancel).await;
        }

        self.outbound.close();
        Ok(())
    }

    /// Start synthesizing a chunk into a bounded local buffer.
    fn prefetch(&self, command: SynthCommand) -> PrefetchedChunk {
        let SynthCommand { chunk, cancel } = command;
        let (frame_tx, frame_rx) = mpsc::channel(PREFETCH_BUFFER);

        // Empty text (a bare turn-final marker) needs no engine call.
        if !chunk.text.is_empty() && !cancel.is_cancelled() {
            let engine_cancel = cancel.child_token();
            let mut stream = self.tts.synthesize(&chunk.text, engine_cancel.clone());
            tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = engine_cancel.cancelled() => break,
                        item = stream.next() => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };
                    if frame_tx.send(item).await.is_err() {
                        break;
                    }
                }
            });
        }

        PrefetchedChunk {
            chunk,
            cancel,
            frames: frame_rx,
        }
    }

    /// Forward one prefetched chunk's audio to the outbound bus.
    async fn send_chunk(&mut self, mut current: PrefetchedChunk, session_cancel: &CancellationToken) {
        let turn = current.chunk.turn;
        let index = current.chunk.index;

        if current.cancel.is_cancelled() {
            tracing::debug!(%turn, index, "chunk dropped: turn cancelled");
            return;
        }

        loop {
            let item = tokio::select! {
                biased;
                _ = session_cancel.cancelled() => return,
                _ = current.cancel.cancelled() => {
                    // Barge-in mid-chunk: unsent audio for this turn is
                    // discarded, no ChunkSent is reported.
                    tracing::debug!(%turn, index, "chunk interrupted mid-send");
                    return;
                },
                item = current.frames.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            match item {
                Ok(mut frame) => {
                    frame.direction = Direction::Outbound;
                    frame.sequence = self.next_sequence;
                    self.next_sequence += 1;
                    // The send itself must stay interruptible: a full bus
                    // would otherwise hold this turn's audio hostage past a
                    // barge-in.
                    tokio::select! {
                        biased;
                        _ = session_cancel.cancelled() => return,
                        _ = current.cancel.cancelled() => {
                            tracing::debug!(%turn, index, "chunk interrupted mid-send");
                            return;
                        },
                        sent = self.outbound.send(OutboundFrame { turn, frame }) => {
                            if sent.is_err() {
                                tracing::debug!(%turn, index, "outbound bus closed mid-chunk");
                                return;
                            }
                        },
                    }
                },
                Err(e) => {
                    tracing::warn!(%turn, index, error = %e, "tts failed; truncating turn");
                    current.cancel.cancel();
                    let _ = self
                        .events
                        .send(SynthEvent::Failed {
                            turn,
                            reason: e.to_string(),
                        })
                        .await;
                    let _ = self
                        .signals
                        .send(StageSignal::SynthesisFailed {
                            turn,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                },
            }
        }

        // Chunk fully sent
        if !current.chunk.text.is_empty() {
            let _ = self
                .events
                .send(SynthEvent::ChunkSent {
                    turn,
                    index,
                    text: current.chunk.text.clone(),
                })
                .await;
        }
        if current.chunk.is_final {
            tracing::debug!(%turn, "turn audio complete");
            let _ = self.events.send(SynthEvent::TurnComplete { turn }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use voxloop_core::{bus, SampleRate};

    /// TTS producing `frames_per_chunk` frames per call, counting
    /// concurrent synthesis calls to verify the look-ahead bound.
    struct MeteredTts {
        frames_per_chunk: usize,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        fail_on: Option<String>,
    }

    impl MeteredTts {
        fn new(frames_per_chunk: usize) -> Self {
            Self {
                frames_per_chunk,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
                fail_on: None,
            }
        }
    }

    impl TtsCapability for MeteredTts {
        fn synthesize(
            &self,
            text: &str,
            cancel: CancellationToken,
        ) -> BoxStream<'static, Result<AudioFrame>> {
            let frames = self.frames_per_chunk;
            let active = self.active.clone();
            let max_active = self.max_active.clone();
            let fail = self.fail_on.as_deref() == Some(text);
            async_stream::stream! {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                for i in 0..frames {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if fail && i == 1 {
                        yield Err(voxloop_core::Error::Capability("tts exploded".into()));
                        break;
                    }
                    // Simulate synthesis latency
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    yield Ok(AudioFrame::new(
                        vec![0.2; 320],
                        SampleRate::Hz16000,
                        Direction::Outbound,
                        0,
                    ));
                }
                active.fetch_sub(1, Ordering::SeqCst);
            }
            .boxed()
        }

        fn engine_name(&self) -> &str {
            "metered"
        }
    }

    struct Harness {
        command_tx: voxloop_core::FrameSender<SynthCommand>,
        outbound_rx: voxloop_core::FrameReceiver<OutboundFrame>,
        event_rx: mpsc::Receiver<SynthEvent>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(tts: MeteredTts, chunk_ahead: usize) -> Harness {
        start_with_capacity(tts, chunk_ahead, 256)
    }

    fn start_with_capacity(tts: MeteredTts, chunk_ahead: usize, outbound_capacity: usize) -> Harness {
        let (command_tx, command_rx) = bus(32);
        let (outbound_tx, outbound_rx) = bus(outbound_capacity);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (signal_tx, _signal_rx) = mpsc::channel(64);

        let stage = SynthesisStage::new(
            Arc::new(tts),
            chunk_ahead,
            outbound_tx,
            event_tx,
            signal_tx,
        );
        let handle = tokio::spawn(stage.run(command_rx, CancellationToken::new()));

        Harness {
            command_tx,
            outbound_rx,
            event_rx,
            handle,
        }
    }

    #[tokio::test]
    async fn frames_sent_in_order_with_fresh_sequence() {
        let mut harness = start(MeteredTts::new(3), 2);
        let turn = TurnId::new();
        let token = CancellationToken::new();

        for index in 0..2u32 {
            harness
                .command_tx
                .send(SynthCommand {
                    chunk: ResponseChunk::new(turn, index, format!("chunk {index}")),
                    cancel: token.clone(),
                })
                .await
                .unwrap();
        }
        harness
            .command_tx
            .send(SynthCommand {
                chunk: ResponseChunk::final_chunk(turn, 2, ""),
                cancel: token.clone(),
            })
            .await
            .unwrap();
        harness.command_tx.close();

        let mut sequences = Vec::new();
        while let Ok(out) = harness.outbound_rx.recv().await {
            assert_eq!(out.turn, turn);
            assert_eq!(out.frame.direction, Direction::Outbound);
            sequences.push(out.frame.sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);

        let mut sent = Vec::new();
        let mut complete = false;
        while let Some(event) = harness.event_rx.recv().await {
            match event {
                SynthEvent::ChunkSent { index, .. } => sent.push(index),
                SynthEvent::TurnComplete { turn: t } => {
                    assert_eq!(t, turn);
                    complete = true;
                },
                SynthEvent::Failed { .. } => panic!("unexpected failure"),
            }
        }
        assert_eq!(sent, vec![0, 1]);
        assert!(complete);
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_outbound_audio_immediately() {
        let mut harness = start(MeteredTts::new(50), 2);
        let turn = TurnId::new();
        let token = CancellationToken::new();

        for index in 0..4u32 {
            harness
                .command_tx
                .send(SynthCommand {
                    chunk: ResponseChunk::new(turn, index, format!("chunk {index}")),
                    cancel: token.clone(),
                })
                .await
                .unwrap();
        }

        // Let some audio flow, then barge in.
        let first = harness.outbound_rx.recv().await.unwrap();
        assert_eq!(first.frame.sequence, 0);
        token.cancel();

        // Queue the next turn right behind the cancelled one.
        let next_turn = TurnId::new();
        let next_token = CancellationToken::new();
        harness
            .command_tx
            .send(SynthCommand {
                chunk: ResponseChunk::final_chunk(next_turn, 0, "next turn"),
                cancel: next_token.clone(),
            })
            .await
            .unwrap();
        harness.command_tx.close();

        // Everything still reaching the bus after a short grace belongs to
        // the next turn; the stage never drains the cancelled turn.
        let mut complete_turns = Vec::new();
        while let Some(event) = harness.event_rx.recv().await {
            if let SynthEvent::TurnComplete { turn: t } = event {
                complete_turns.push(t);
            }
        }
        assert_eq!(complete_turns, vec![next_turn]);
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_outbound_bus_does_not_block_cancellation() {
        // Capacity 1 with nothing draining: the stage ends up parked in a
        // send. Cancelling the turn must release it instead of leaving more
        // of the cancelled turn's audio to trickle out.
        let mut harness = start_with_capacity(MeteredTts::new(20), 1, 1);
        let turn = TurnId::new();
        let token = CancellationToken::new();

        harness
            .command_tx
            .send(SynthCommand {
                chunk: ResponseChunk::final_chunk(turn, 0, "a long reply"),
                cancel: token.clone(),
            })
            .await
            .unwrap();
        harness.command_tx.close();

        let first = harness.outbound_rx.recv().await.unwrap();
        assert_eq!(first.frame.sequence, 0);

        // Give the stage time to fill the bus and block on the next send.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();

        // At most the one frame accepted before the cancel remains.
        let mut leftover = 0;
        while harness.outbound_rx.recv().await.is_ok() {
            leftover += 1;
        }
        assert!(leftover <= 1, "cancelled turn kept sending: {leftover} frames");
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn look_ahead_is_bounded() {
        let tts = MeteredTts::new(20);
        let max_active = tts.max_active.clone();
        let mut harness = start(tts, 2);
        let turn = TurnId::new();
        let token = CancellationToken::new();

        for index in 0..6u32 {
            harness
                .command_tx
                .send(SynthCommand {
                    chunk: ResponseChunk::new(turn, index, format!("chunk {index}")),
                    cancel: token.clone(),
                })
                .await
                .unwrap();
        }
        harness.command_tx.close();

        while harness.outbound_rx.recv().await.is_ok() {}
        harness.handle.await.unwrap().unwrap();

        assert!(
            max_active.load(Ordering::SeqCst) <= 2,
            "synthesis ran more than chunk_ahead calls concurrently"
        );
    }

    #[tokio::test]
    async fn tts_failure_truncates_turn() {
        let mut tts = MeteredTts::new(5);
        tts.fail_on = Some("bad chunk".to_string());
        let mut harness = start(tts, 2);
        let turn = TurnId::new();
        let token = CancellationToken::new();

        harness
            .command_tx
            .send(SynthCommand {
                chunk: ResponseChunk::new(turn, 0, "good chunk"),
                cancel: token.clone(),
            })
            .await
            .unwrap();
        harness
            .command_tx
            .send(SynthCommand {
                chunk: ResponseChunk::final_chunk(turn, 1, "bad chunk"),
                cancel: token.clone(),
            })
            .await
            .unwrap();
        harness.command_tx.close();

        while harness.outbound_rx.recv().await.is_ok() {}

        let mut failed = false;
        let mut sent = Vec::new();
        while let Some(event) = harness.event_rx.recv().await {
            match event {
                SynthEvent::Failed { turn: t, .. } => {
                    assert_eq!(t, turn);
                    failed = true;
                },
                SynthEvent::ChunkSent { index, .. } => sent.push(index),
                SynthEvent::TurnComplete { .. } => panic!("truncated turn must not complete"),
            }
        }
        assert!(failed);
        assert_eq!(sent, vec![0]);
        harness.handle.await.unwrap().unwrap();
    }
}
