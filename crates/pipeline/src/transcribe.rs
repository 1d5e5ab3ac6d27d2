//! Transcription stage
//!
//! Bridges gated audio segments to the streaming STT capability. Segments
//! arrive strictly in order on the gate bus, so the stage handles one
//! segment at a time: it feeds the segment's audio into the engine, forwards
//! transcript revisions downstream, and settles the segment's outcome when
//! the boundary closes.
//!
//! A force-closed segment that never produced a final transcript is simply
//! discarded; that is a normal outcome, not an error.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use voxloop_core::{AudioFrame, FrameReceiver, Result, SegmentId, SttCapability, Transcript};

use crate::SegmentFrame;

/// Transcription results and segment outcomes, ordered per segment.
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    Partial(Transcript),
    Final(Transcript),
    /// Segment ended without a usable final transcript
    Discarded { segment: SegmentId },
    /// STT failed mid-segment; treated downstream like a discard
    Failed { segment: SegmentId, reason: String },
}

/// Feed channel depth for one in-flight segment
const SEGMENT_AUDIO_BUFFER: usize = 32;

pub struct TranscriptionStage {
    stt: Arc<dyn SttCapability>,
}

/// One open segment being streamed into the engine.
struct ActiveSegment {
    segment: SegmentId,
    feed: Option<mpsc::Sender<AudioFrame>>,
    cancel: CancellationToken,
    reader: tokio::task::JoinHandle<SegmentOutcome>,
}

#[derive(Debug)]
enum SegmentOutcome {
    Finalized,
    NoFinal,
    EngineFailed(String),
}

impl TranscriptionStage {
    pub fn new(stt: Arc<dyn SttCapability>) -> Self {
        Self { stt }
    }

    /// Run until the gate bus closes or the session is cancelled.
    pub async fn run(
        self,
        mut input: FrameReceiver<SegmentFrame>,
        events: mpsc::Sender<TranscriptEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut active: Option<ActiveSegment> = None;

        loop {
            let seg_frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = input.recv() => match received {
                    Ok(seg_frame) => seg_frame,
                    Err(_) => break,
                },
            };

            match seg_frame {
                SegmentFrame::Open(segment) => {
                    // The gate force-closes before reopening, so an active
                    // segment here means a lost Close; settle it as forced.
                    if let Some(previous) = active.take() {
                        tracing::warn!(
                            segment = %previous.segment,
                            "segment opened while previous still active; discarding previous"
                        );
                        Self::settle(previous, true, &events).await;
                    }
                    active = Some(self.open_segment(segment, events.clone()));
                },

                SegmentFrame::Audio(segment, frame) => {
                    if let Some(current) = active.as_ref() {
                        if current.segment != segment {
                            tracing::warn!(%segment, "audio for inactive segment dropped");
                            continue;
                        }
                        if let Some(feed) = current.feed.as_ref() {
                            // Reader gone means the engine ended early; the
                            // outcome is settled at Close.
                            let _ = feed.send(frame).await;
                        }
                    }
                },

                SegmentFrame::Close { segment, forced } => match active.take() {
                    Some(current) if current.segment == segment => {
                        Self::settle(current, forced, &events).await;
                    },
                    other => {
                        tracing::warn!(%segment, "close for unknown segment ignored");
                        active = other;
                    },
                },
            }
        }

        // Session teardown: any in-flight segment is force-discarded.
        if let Some(current) = active.take() {
            Self::settle(current, true, &events).await;
        }
        Ok(())
    }

    fn open_segment(
        &self,
        segment: SegmentId,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> ActiveSegment {
        let (feed_tx, feed_rx) = mpsc::channel(SEGMENT_AUDIO_BUFFER);
        let cancel = CancellationToken::new();
        let audio = ReceiverStream::new(feed_rx).boxed();
        let mut transcripts = self.stt.transcribe(segment, audio, cancel.clone());

        tracing::debug!(%segment, engine = self.stt.engine_name(), "transcription started");

        let reader = tokio::spawn(async move {
            while let Some(item) = transcripts.next().await {
                match item {
                    Ok(transcript) if transcript.is_final => {
                        // An empty final means no usable speech; report a
                        // discard so the dialogue manager can no-op.
                        if transcript.is_empty() {
                            return SegmentOutcome::NoFinal;
                        }
                        let _ = events.send(TranscriptEvent::Final(transcript)).await;
                        // The final is terminal for the segment.
                        return SegmentOutcome::Finalized;
                    },
                    Ok(transcript) => {
                        let _ = events.send(TranscriptEvent::Partial(transcript)).await;
                    },
                    Err(e) => {
                        return SegmentOutcome::EngineFailed(e.to_string());
                    },
                }
            }
            SegmentOutcome::NoFinal
        });

        ActiveSegment {
            segment,
            feed: Some(feed_tx),
            cancel,
            reader,
        }
    }

    async fn settle(
        mut current: ActiveSegment,
        forced: bool,
        events: &mpsc::Sender<TranscriptEvent>,
    ) {
        // A forced close cancels the engine before the feed ends, so it can
        // never mistake the cut for a graceful end of audio. A graceful
        // close just stops feeding and lets the engine finalize.
        if forced {
            current.cancel.cancel();
        }
        current.feed.take();

        let segment = current.segment;
        match current.reader.await {
            Ok(SegmentOutcome::Finalized) => {
                // Final already forwarded by the reader
            },
            Ok(SegmentOutcome::NoFinal) => {
                tracing::debug!(%segment, forced, "segment discarded without final transcript");
                let _ = events.send(TranscriptEvent::Discarded { segment }).await;
            },
            Ok(SegmentOutcome::EngineFailed(reason)) => {
                tracing::warn!(%segment, %reason, "stt engine failed mid-segment");
                let _ = events
                    .send(TranscriptEvent::Failed { segment, reason })
                    .await;
            },
            Err(join_error) => {
                tracing::error!(%segment, error = %join_error, "transcript reader panicked");
                let _ = events
                    .send(TranscriptEvent::Failed {
                        segment,
                        reason: join_error.to_string(),
                    })
                    .await;
            },
        }
    }
}
