//! Speech capability traits: VAD, STT, TTS

use crate::audio::AudioFrame;
use crate::error::Result;
use crate::transcript::{SegmentId, Transcript};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Boundary events emitted by the voice activity gate.
///
/// These travel on a side channel straight to the dialogue manager, ahead of
/// the (slower) transcription path, so interruption never waits on STT.
#[derive(Debug, Clone, Copy)]
pub enum GateEvent {
    SpeechStart { segment: SegmentId, at: Instant },
    SpeechEnd { segment: SegmentId, at: Instant },
}

impl GateEvent {
    pub fn segment(&self) -> SegmentId {
        match self {
            GateEvent::SpeechStart { segment, .. } | GateEvent::SpeechEnd { segment, .. } => {
                *segment
            },
        }
    }
}

/// Voice activity classification.
///
/// Stateless per call; invoked at frame rate by the gate.
#[async_trait]
pub trait VadCapability: Send + Sync + 'static {
    /// Speech probability for one frame, in [0.0, 1.0].
    async fn classify(&self, frame: &AudioFrame) -> Result<f32>;

    /// Engine name for logging
    fn engine_name(&self) -> &str;
}

/// Streaming speech-to-text for one segment.
pub trait SttCapability: Send + Sync + 'static {
    /// Transcribe a segment's audio stream into transcript revisions.
    ///
    /// Partials may arrive at any rate; the stream ends after at most one
    /// final transcript. Cancelling the token must stop transcription
    /// promptly and end the stream.
    fn transcribe(
        &self,
        segment: SegmentId,
        audio: BoxStream<'static, AudioFrame>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<Transcript>>;

    /// Engine name for logging
    fn engine_name(&self) -> &str;
}

/// Streaming text-to-speech for one response chunk.
pub trait TtsCapability: Send + Sync + 'static {
    /// Synthesize a text chunk into an ordered audio stream.
    ///
    /// Cancelling the token must stop synthesis promptly; frames produced
    /// after cancellation are discarded by the caller.
    fn synthesize(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<AudioFrame>>;

    /// Engine name for logging
    fn engine_name(&self) -> &str;
}
