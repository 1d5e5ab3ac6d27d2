//! Voice activity gate
//!
//! Consumes the raw inbound audio stream, asks the external VAD for a
//! speech probability per frame, and turns the probability series into
//! debounced segment boundaries. Hangover-in keeps short noises from
//! opening a segment; hangover-out keeps short pauses from splitting one.
//!
//! Frames observed while a segment is open (including those buffered during
//! hangover-in) pass through to the transcription stage; boundary events go
//! straight to the dialogue manager on a side channel so interruption never
//! waits on transcription.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voxloop_config::VadSettings;
use voxloop_core::{AudioFrame, Error, FrameReceiver, FrameSender, GateEvent, Result, SegmentId,
    VadCapability};

use crate::{SegmentFrame, StageSignal};

/// Gate thresholds and debounce durations
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Probability at or above which a frame counts as speech
    pub speech_on_prob: f32,
    /// Probability below which a frame counts as silence
    pub speech_off_prob: f32,
    /// Sustained speech required before a segment opens
    pub hangover_in: Duration,
    /// Sustained silence required before a segment closes
    pub hangover_out: Duration,
    /// Frame energy above which degraded mode counts a frame as speech
    pub degraded_energy_db: f32,
}

impl GateConfig {
    pub fn from_settings(settings: &VadSettings) -> Self {
        Self {
            speech_on_prob: settings.speech_on_prob,
            speech_off_prob: settings.speech_off_prob,
            hangover_in: Duration::from_millis(settings.hangover_in_ms as u64),
            hangover_out: Duration::from_millis(settings.hangover_out_ms as u64),
            degraded_energy_db: settings.degraded_energy_db,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from_settings(&VadSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Silence,
    /// Speech observed, accumulating toward hangover-in
    PendingOpen { speech: Duration },
    Open,
    /// Silence observed while open, accumulating toward hangover-out
    PendingClose { silence: Duration },
}

/// Outcome of feeding one frame through the debounce machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// No boundary crossed
    None,
    /// Sustained speech confirmed; segment opens with this frame
    Opened,
    /// Sustained silence confirmed; segment closes after this frame
    Closed,
}

/// Pure hangover state machine, independent of any audio source.
///
/// Deterministic for a given probability/duration sequence, so the timing
/// behavior is testable without real audio.
#[derive(Debug)]
pub struct HangoverGate {
    config: GateConfig,
    phase: Phase,
}

impl HangoverGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            phase: Phase::Silence,
        }
    }

    /// Advance the machine by one frame of the given duration.
    pub fn process(&mut self, probability: f32, duration: Duration) -> GateTransition {
        match self.phase {
            Phase::Silence => {
                if probability >= self.config.speech_on_prob {
                    let speech = duration;
                    if speech >= self.config.hangover_in {
                        self.phase = Phase::Open;
                        return GateTransition::Opened;
                    }
                    self.phase = Phase::PendingOpen { speech };
                }
                GateTransition::None
            },

            Phase::PendingOpen { speech } => {
                if probability >= self.config.speech_on_prob {
                    let speech = speech + duration;
                    if speech >= self.config.hangover_in {
                        self.phase = Phase::Open;
                        GateTransition::Opened
                    } else {
                        self.phase = Phase::PendingOpen { speech };
                        GateTransition::None
                    }
                } else {
                    self.phase = Phase::Silence;
                    GateTransition::None
                }
            },

            Phase::Open => {
                if probability < self.config.speech_off_prob {
                    let silence = duration;
                    if silence >= self.config.hangover_out {
                        self.phase = Phase::Silence;
                        return GateTransition::Closed;
                    }
                    self.phase = Phase::PendingClose { silence };
                }
                GateTransition::None
            },

            Phase::PendingClose { silence } => {
                if probability < self.config.speech_off_prob {
                    let silence = silence + duration;
                    if silence >= self.config.hangover_out {
                        self.phase = Phase::Silence;
                        GateTransition::Closed
                    } else {
                        self.phase = Phase::PendingClose { silence };
                        GateTransition::None
                    }
                } else {
                    self.phase = Phase::Open;
                    GateTransition::None
                }
            },
        }
    }

    /// Whether frames currently belong to an open segment
    pub fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Open | Phase::PendingClose { .. })
    }

    /// Whether speech is accumulating toward hangover-in
    pub fn is_pending_open(&self) -> bool {
        matches!(self.phase, Phase::PendingOpen { .. })
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Silence;
    }
}

/// The gate stage: VAD classification plus segment bookkeeping.
pub struct VoiceActivityGate {
    vad: Arc<dyn VadCapability>,
    gate: HangoverGate,
    /// Segment currently open on the output bus
    open_segment: Option<SegmentId>,
    /// Frames buffered during hangover-in, flushed when the segment opens
    pending: Vec<AudioFrame>,
    degraded: bool,
    degraded_energy_db: f32,
}

impl VoiceActivityGate {
    pub fn new(config: GateConfig, vad: Arc<dyn VadCapability>) -> Self {
        let degraded_energy_db = config.degraded_energy_db;
        Self {
            vad,
            gate: HangoverGate::new(config),
            open_segment: None,
            pending: Vec::new(),
            degraded: false,
            degraded_energy_db,
        }
    }

    /// Run until the inbound bus closes or the session is cancelled.
    pub async fn run(
        mut self,
        mut inbound: FrameReceiver<AudioFrame>,
        mut out: FrameSender<SegmentFrame>,
        events: mpsc::Sender<GateEvent>,
        signals: mpsc::Sender<StageSignal>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = inbound.recv() => match received {
                    Ok(frame) => frame,
                    Err(_) => break,
                },
            };

            let probability = self.classify(&frame, &signals).await;
            self.handle_frame(frame, probability, &mut out, &events)
                .await?;
        }

        // Teardown or upstream closure: force-close any open segment so the
        // transcription stage never waits on a boundary that will not come.
        if let Some(segment) = self.open_segment.take() {
            tracing::debug!(%segment, "gate closing: force-closing open segment");
            // Peers may already be gone during session teardown.
            let _ = self.close_segment(segment, true, &mut out, &events).await;
        }
        out.close();
        Ok(())
    }

    /// Classify one frame, falling back to an energy gate on VAD errors.
    ///
    /// The fallback must still produce both speech and silence verdicts:
    /// a constant "speech" answer would hold the segment open forever and
    /// leave the session mute once the first one closed upstream.
    async fn classify(&mut self, frame: &AudioFrame, signals: &mpsc::Sender<StageSignal>) -> f32 {
        match self.vad.classify(frame).await {
            Ok(probability) => probability,
            Err(e) => {
                if !self.degraded {
                    self.degraded = true;
                    tracing::warn!(
                        error = %e,
                        engine = self.vad.engine_name(),
                        "vad capability failed; falling back to energy gating"
                    );
                    let _ = signals
                        .send(StageSignal::DegradedMode {
                            reason: e.to_string(),
                        })
                        .await;
                }
                if frame.energy_db > self.degraded_energy_db {
                    1.0
                } else {
                    0.0
                }
            },
        }
    }

    async fn handle_frame(
        &mut self,
        frame: AudioFrame,
        probability: f32,
        out: &mut FrameSender<SegmentFrame>,
        events: &mpsc::Sender<GateEvent>,
    ) -> Result<()> {
        match self.gate.process(probability, frame.duration) {
            GateTransition::Opened => {
                self.pending.push(frame);
                let segment = self.open_segment(out, events).await?;
                let buffered = std::mem::take(&mut self.pending);
                for buffered_frame in buffered {
                    self.forward(segment, buffered_frame, out).await?;
                }
            },
            GateTransition::Closed => {
                if let Some(segment) = self.open_segment.take() {
                    self.forward(segment, frame, out).await?;
                    self.close_segment(segment, false, out, events).await?;
                }
            },
            GateTransition::None => {
                if let Some(segment) = self.open_segment {
                    self.forward(segment, frame, out).await?;
                } else if self.gate.is_pending_open() {
                    self.pending.push(frame);
                } else {
                    // Confirmed silence between segments; nothing downstream
                    // wants these frames.
                    self.pending.clear();
                }
            },
        }
        Ok(())
    }

    /// Open a new segment, force-closing any segment still open.
    ///
    /// An overlap here means the previous segment's end was never confirmed
    /// (possible in degraded mode); the prior segment is force-closed
    /// before the new one opens.
    async fn open_segment(
        &mut self,
        out: &mut FrameSender<SegmentFrame>,
        events: &mpsc::Sender<GateEvent>,
    ) -> Result<SegmentId> {
        if let Some(previous) = self.open_segment.take() {
            tracing::warn!(
                %previous,
                "overlap: new speech before prior segment end was consumed; force-closing"
            );
            self.close_segment(previous, true, out, events).await?;
        }

        let segment = SegmentId::new();
        let at = self
            .pending
            .first()
            .map(|f| f.timestamp)
            .unwrap_or_else(std::time::Instant::now);

        tracing::debug!(%segment, "speech segment opened");
        events
            .send(GateEvent::SpeechStart { segment, at })
            .await
            .map_err(|_| Error::Discarded("gate event channel closed"))?;
        out.send(SegmentFrame::Open(segment))
            .await
            .map_err(|_| Error::Discarded("gate output bus closed"))?;

        self.open_segment = Some(segment);
        Ok(segment)
    }

    async fn close_segment(
        &mut self,
        segment: SegmentId,
        forced: bool,
        out: &mut FrameSender<SegmentFrame>,
        events: &mpsc::Sender<GateEvent>,
    ) -> Result<()> {
        tracing::debug!(%segment, forced, "speech segment closed");
        out.send(SegmentFrame::Close { segment, forced })
            .await
            .map_err(|_| Error::Discarded("gate output bus closed"))?;
        events
            .send(GateEvent::SpeechEnd {
                segment,
                at: std::time::Instant::now(),
            })
            .await
            .map_err(|_| Error::Discarded("gate event channel closed"))?;
        Ok(())
    }

    async fn forward(
        &self,
        segment: SegmentId,
        frame: AudioFrame,
        out: &mut FrameSender<SegmentFrame>,
    ) -> Result<()> {
        out.send(SegmentFrame::Audio(segment, frame))
            .await
            .map_err(|_| Error::Discarded("gate output bus closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use voxloop_core::{bus, Direction, SampleRate};

    fn config(hangover_in_ms: u64, hangover_out_ms: u64) -> GateConfig {
        GateConfig {
            speech_on_prob: 0.5,
            speech_off_prob: 0.35,
            hangover_in: Duration::from_millis(hangover_in_ms),
            hangover_out: Duration::from_millis(hangover_out_ms),
            degraded_energy_db: -45.0,
        }
    }

    const FRAME: Duration = Duration::from_millis(20);

    #[test]
    fn hangover_timing_scenario() {
        // 400ms speech then 800ms silence, hangover-in 200ms / out 500ms:
        // exactly one open ~200ms in, one close ~500ms after speech end.
        let mut gate = HangoverGate::new(config(200, 500));
        let mut opened_at = None;
        let mut closed_at = None;
        let mut elapsed = Duration::ZERO;

        for i in 0..60 {
            let prob = if i < 20 { 0.9 } else { 0.1 };
            elapsed += FRAME;
            match gate.process(prob, FRAME) {
                GateTransition::Opened => {
                    assert!(opened_at.is_none(), "opened twice");
                    opened_at = Some(elapsed);
                },
                GateTransition::Closed => {
                    assert!(closed_at.is_none(), "closed twice");
                    closed_at = Some(elapsed);
                },
                GateTransition::None => {},
            }
        }

        assert_eq!(opened_at, Some(Duration::from_millis(200)));
        // Speech ends at 400ms; close confirmed 500ms later.
        assert_eq!(closed_at, Some(Duration::from_millis(900)));
    }

    #[test]
    fn short_noise_never_opens() {
        let mut gate = HangoverGate::new(config(200, 500));
        // 100ms blip, below hangover-in
        for _ in 0..5 {
            assert_eq!(gate.process(0.9, FRAME), GateTransition::None);
        }
        assert_eq!(gate.process(0.1, FRAME), GateTransition::None);
        assert!(!gate.is_open());
    }

    #[test]
    fn short_pause_does_not_split_segment() {
        let mut gate = HangoverGate::new(config(100, 500));
        for _ in 0..5 {
            gate.process(0.9, FRAME);
        }
        assert!(gate.is_open());
        // 200ms pause, below hangover-out
        for _ in 0..10 {
            assert_eq!(gate.process(0.1, FRAME), GateTransition::None);
        }
        // Speech resumes; still the same segment
        assert_eq!(gate.process(0.9, FRAME), GateTransition::None);
        assert!(gate.is_open());
    }

    #[test]
    fn hysteresis_band_keeps_segment_open() {
        let mut gate = HangoverGate::new(config(100, 200));
        for _ in 0..5 {
            gate.process(0.9, FRAME);
        }
        // Probabilities between off (0.35) and on (0.5) count as speech
        // while open.
        for _ in 0..30 {
            assert_eq!(gate.process(0.4, FRAME), GateTransition::None);
        }
        assert!(gate.is_open());
    }

    struct ScriptedVad {
        probabilities: std::sync::Mutex<std::vec::IntoIter<f32>>,
        fail: bool,
    }

    impl ScriptedVad {
        fn new(probabilities: Vec<f32>) -> Self {
            Self {
                probabilities: std::sync::Mutex::new(probabilities.into_iter()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                probabilities: std::sync::Mutex::new(Vec::new().into_iter()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl VadCapability for ScriptedVad {
        async fn classify(&self, _frame: &AudioFrame) -> Result<f32> {
            if self.fail {
                return Err(Error::Capability("vad engine offline".into()));
            }
            Ok(self.probabilities.lock().unwrap().next().unwrap_or(0.0))
        }

        fn engine_name(&self) -> &str {
            "scripted"
        }
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, Direction::Inbound, seq)
    }

    fn quiet_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0; 320], SampleRate::Hz16000, Direction::Inbound, seq)
    }

    #[tokio::test]
    async fn passthrough_includes_buffered_hangover_frames() {
        // 5 speech frames (100ms at hangover-in 100ms opens on the 5th),
        // then silence past hangover-out.
        let mut probs = vec![0.9; 5];
        probs.extend(vec![0.0; 10]);
        let vad = Arc::new(ScriptedVad::new(probs));
        let gate = VoiceActivityGate::new(config(100, 100), vad);

        let (mut in_tx, in_rx) = bus(32);
        let (out_tx, mut out_rx) = bus(32);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (signal_tx, _signal_rx) = mpsc::channel(8);

        let handle = tokio::spawn(gate.run(
            in_rx,
            out_tx,
            event_tx,
            signal_tx,
            CancellationToken::new(),
        ));

        for seq in 0..15 {
            in_tx.send(frame(seq)).await.unwrap();
        }
        in_tx.close();
        handle.await.unwrap().unwrap();

        // Boundary events: one start, one end
        assert!(matches!(
            event_rx.recv().await,
            Some(GateEvent::SpeechStart { .. })
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(GateEvent::SpeechEnd { .. })
        ));

        // Bus framing: Open, all five buffered speech frames (plus the
        // silence frames up to the close), Close.
        let mut audio_seqs = Vec::new();
        let mut saw_open = false;
        let mut saw_close = false;
        while let Ok(seg_frame) = out_rx.recv().await {
            match seg_frame {
                SegmentFrame::Open(_) => saw_open = true,
                SegmentFrame::Audio(_, f) => audio_seqs.push(f.sequence),
                SegmentFrame::Close { forced, .. } => {
                    saw_close = true;
                    assert!(!forced);
                },
            }
        }
        assert!(saw_open && saw_close);
        // The first five frames were speech; they must all have passed
        // through, in order, starting from sequence 0.
        assert!(audio_seqs.len() >= 5);
        assert_eq!(&audio_seqs[..5], &[0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn vad_failure_signals_degraded_and_keeps_passing_speech() {
        let vad = Arc::new(ScriptedVad::failing());
        let gate = VoiceActivityGate::new(config(100, 100), vad);

        let (mut in_tx, in_rx) = bus(32);
        let (out_tx, mut out_rx) = bus(32);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (signal_tx, mut signal_rx) = mpsc::channel(8);

        let handle = tokio::spawn(gate.run(
            in_rx,
            out_tx,
            event_tx,
            signal_tx,
            CancellationToken::new(),
        ));

        for seq in 0..10 {
            in_tx.send(frame(seq)).await.unwrap();
        }
        in_tx.close();
        handle.await.unwrap().unwrap();

        // Degraded signal raised exactly once
        assert!(matches!(
            signal_rx.recv().await,
            Some(StageSignal::DegradedMode { .. })
        ));
        assert!(signal_rx.recv().await.is_none());

        // Energy fallback: loud audio treated as speech, segment opened
        // and force-closed at shutdown rather than dropped.
        assert!(matches!(
            event_rx.recv().await,
            Some(GateEvent::SpeechStart { .. })
        ));
        let mut audio = 0;
        let mut forced_close = false;
        while let Ok(seg_frame) = out_rx.recv().await {
            match seg_frame {
                SegmentFrame::Audio(..) => audio += 1,
                SegmentFrame::Close { forced, .. } => forced_close = forced,
                SegmentFrame::Open(_) => {},
            }
        }
        assert_eq!(audio, 10);
        assert!(forced_close);
    }

    #[tokio::test]
    async fn degraded_mode_still_closes_segments_on_silence() {
        // With the VAD offline, segment boundaries come from frame energy,
        // so the conversation keeps working: two utterances separated by
        // silence produce two gracefully closed segments.
        let vad = Arc::new(ScriptedVad::failing());
        let gate = VoiceActivityGate::new(config(100, 100), vad);

        let (mut in_tx, in_rx) = bus(64);
        let (out_tx, mut out_rx) = bus(64);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (signal_tx, _signal_rx) = mpsc::channel(8);

        let handle = tokio::spawn(gate.run(
            in_rx,
            out_tx,
            event_tx,
            signal_tx,
            CancellationToken::new(),
        ));

        let mut seq = 0;
        for _ in 0..2 {
            for _ in 0..10 {
                in_tx.send(frame(seq)).await.unwrap();
                seq += 1;
            }
            for _ in 0..10 {
                in_tx.send(quiet_frame(seq)).await.unwrap();
                seq += 1;
            }
        }
        in_tx.close();
        handle.await.unwrap().unwrap();

        let mut opens = 0;
        let mut closes = 0;
        while let Ok(seg_frame) = out_rx.recv().await {
            match seg_frame {
                SegmentFrame::Open(_) => opens += 1,
                SegmentFrame::Close { forced, .. } => {
                    assert!(!forced, "silence must close the segment gracefully");
                    closes += 1;
                },
                SegmentFrame::Audio(..) => {},
            }
        }
        assert_eq!(opens, 2);
        assert_eq!(closes, 2);

        let mut starts = 0;
        let mut ends = 0;
        while let Some(event) = event_rx.recv().await {
            match event {
                GateEvent::SpeechStart { .. } => starts += 1,
                GateEvent::SpeechEnd { .. } => ends += 1,
            }
        }
        assert_eq!(starts, 2);
        assert_eq!(ends, 2);
    }

    #[tokio::test]
    async fn overlap_force_closes_prior_segment() {
        let vad = Arc::new(ScriptedVad::new(vec![]));
        let mut gate = VoiceActivityGate::new(config(100, 100), vad);

        let (mut out_tx, mut out_rx) = bus(32);
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let first = gate.open_segment(&mut out_tx, &event_tx).await.unwrap();
        let second = gate.open_segment(&mut out_tx, &event_tx).await.unwrap();
        assert_ne!(first, second);

        // First open
        assert!(matches!(
            event_rx.recv().await,
            Some(GateEvent::SpeechStart { segment, .. }) if segment == first
        ));
        assert!(matches!(out_rx.recv().await.unwrap(), SegmentFrame::Open(s) if s == first));

        // Overlap: forced close of the first before the second opens
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            SegmentFrame::Close { segment, forced: true } if segment == first
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(GateEvent::SpeechEnd { segment, .. }) if segment == first
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(GateEvent::SpeechStart { segment, .. }) if segment == second
        ));
    }
}
