//! Session orchestration
//!
//! One session per remote participant: the orchestrator joins the transport,
//! wires the stages together with frame buses, and supervises the result.
//! Teardown is top-down: cancel the session token, then await every stage so
//! no in-flight external call outlives the session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use voxloop_agent::DialogueManager;
use voxloop_config::Settings;
use voxloop_core::{
    bus, ConversationHistory, JoinConfig, LlmCapability, Result, SessionId, SttCapability,
    Transport, TransportEvent, TransportSession, TtsCapability, VadCapability,
};
use voxloop_pipeline::{
    GateConfig, PlayoutStage, StageSignal, SynthesisStage, TranscriptionStage, VoiceActivityGate,
};

/// The pluggable engines a session runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub vad: Arc<dyn VadCapability>,
    pub stt: Arc<dyn SttCapability>,
    pub llm: Arc<dyn LlmCapability>,
    pub tts: Arc<dyn TtsCapability>,
}

struct SessionEntry {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Live sessions keyed by id. Insert on join, remove on leave.
#[derive(Default)]
struct SessionRegistry {
    inner: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    fn insert(&self, id: SessionId, entry: SessionEntry) {
        self.inner.lock().insert(id, entry);
    }

    fn remove(&self, id: SessionId) -> Option<SessionEntry> {
        self.inner.lock().remove(&id)
    }

    fn contains(&self, id: SessionId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    fn ids(&self) -> Vec<SessionId> {
        self.inner.lock().keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct SessionOrchestrator {
    transport: Arc<dyn Transport>,
    capabilities: Capabilities,
    settings: Settings,
    registry: Arc<SessionRegistry>,
}

impl SessionOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        capabilities: Capabilities,
        settings: Settings,
    ) -> Self {
        Self {
            transport,
            capabilities,
            settings,
            registry: Arc::new(SessionRegistry::default()),
        }
    }

    /// Join the transport and bring up a full pipeline for one participant.
    pub async fn open(&self, join: JoinConfig) -> Result<SessionId> {
        let id = SessionId::new_v4();
        let room = join.room.clone();
        let transport_session = self.transport.join(join).await?;
        let cancel = CancellationToken::new();

        let supervisor = self.spawn_pipeline(id, transport_session, cancel.clone());
        self.registry.insert(
            id,
            SessionEntry {
                cancel,
                supervisor,
            },
        );
        tracing::info!(session = %id, %room, "session opened");
        Ok(id)
    }

    /// Tear a session down. Safe to call repeatedly; returns false when the
    /// session is unknown or already gone.
    pub async fn close(&self, id: SessionId) -> bool {
        let Some(entry) = self.registry.remove(id) else {
            tracing::debug!(session = %id, "close: session already gone");
            return false;
        };
        entry.cancel.cancel();
        if let Err(e) = entry.supervisor.await {
            tracing::error!(session = %id, error = %e, "session supervisor panicked");
        }
        true
    }

    /// Close every live session.
    pub async fn shutdown(&self) {
        for id in self.registry.ids() {
            self.close(id).await;
        }
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        self.registry.contains(id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn spawn_pipeline(
        &self,
        id: SessionId,
        transport_session: TransportSession,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let TransportSession {
            inbound,
            outbound,
            events,
        } = transport_session;

        let (gated_tx, gated_rx) = bus(self.settings.bus.gated_capacity);
        let (synth_tx, synth_rx) = bus(self.settings.bus.synth_capacity);
        // Synthesized audio queues here, not in the transport, so a
        // barge-in flush can still reach it.
        let (playout_tx, playout_rx) = bus(self.settings.bus.outbound_capacity);
        let (gate_event_tx, gate_event_rx) = mpsc::channel(32);
        let (transcript_tx, transcript_rx) = mpsc::channel(32);
        let (synth_event_tx, synth_event_rx) = mpsc::channel(32);
        let (flush_tx, flush_rx) = mpsc::channel(8);
        let (signal_tx, signal_rx) = mpsc::channel(32);

        let gate = VoiceActivityGate::new(
            GateConfig::from_settings(&self.settings.vad),
            self.capabilities.vad.clone(),
        );
        let gate_task = tokio::spawn(gate.run(
            inbound,
            gated_tx,
            gate_event_tx,
            signal_tx.clone(),
            cancel.clone(),
        ));

        let transcription = TranscriptionStage::new(self.capabilities.stt.clone());
        let transcription_task =
            tokio::spawn(transcription.run(gated_rx, transcript_tx, cancel.clone()));

        let synthesis = SynthesisStage::new(
            self.capabilities.tts.clone(),
            self.settings.response.chunk_ahead,
            playout_tx,
            synth_event_tx,
            signal_tx,
        );
        let synthesis_task = tokio::spawn(synthesis.run(synth_rx, cancel.clone()));

        let playout = PlayoutStage::new(outbound, flush_rx);
        let playout_task = tokio::spawn(playout.run(playout_rx, cancel.clone()));

        let manager = DialogueManager::new(
            self.capabilities.llm.clone(),
            self.settings.response.clone(),
            synth_tx,
            flush_tx,
        );
        let manager_task = tokio::spawn(manager.run(
            gate_event_rx,
            transcript_rx,
            synth_event_rx,
            cancel.clone(),
        ));

        let stages = vec![gate_task, transcription_task, synthesis_task, playout_task];
        let registry = self.registry.clone();
        tokio::spawn(supervise(
            id,
            events,
            signal_rx,
            cancel,
            stages,
            manager_task,
            registry,
        ))
    }
}

/// Watches one session until it ends, then tears everything down in order.
async fn supervise(
    id: SessionId,
    mut events: mpsc::Receiver<TransportEvent>,
    mut signals: mpsc::Receiver<StageSignal>,
    cancel: CancellationToken,
    stages: Vec<JoinHandle<Result<()>>>,
    mut manager: JoinHandle<Result<ConversationHistory>>,
    registry: Arc<SessionRegistry>,
) {
    // Stage failure closes the event channels the dialogue manager reads,
    // so the manager exiting is the one signal that covers every internal
    // ending; the transport covers the external one.
    let manager_result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            result = &mut manager => break Some(result),
            event = events.recv() => match event {
                Some(TransportEvent::ParticipantLeft { reason }) => {
                    tracing::info!(session = %id, %reason, "participant left");
                    break None;
                },
                None => {
                    tracing::warn!(session = %id, "transport dropped");
                    break None;
                },
            },
            signal = signals.recv() => match signal {
                Some(signal) => log_signal(id, &signal),
                // All signal senders gone means every stage has exited.
                None => break None,
            },
        }
    };

    cancel.cancel();
    for stage in stages {
        match stage.await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::warn!(session = %id, error = %e, "stage ended with error"),
            Err(e) => tracing::error!(session = %id, error = %e, "stage panicked"),
        }
    }
    let manager_result = match manager_result {
        Some(result) => result,
        None => manager.await,
    };
    match manager_result {
        Ok(Ok(history)) => {
            tracing::info!(session = %id, turns = history.len(), "session closed");
        },
        Ok(Err(e)) => tracing::warn!(session = %id, error = %e, "dialogue manager ended with error"),
        Err(e) => tracing::error!(session = %id, error = %e, "dialogue manager panicked"),
    }
    registry.remove(id);
}

fn log_signal(id: SessionId, signal: &StageSignal) {
    match signal {
        StageSignal::DegradedMode { reason } => {
            tracing::warn!(session = %id, %reason, "gate degraded: gating on frame energy");
        },
        StageSignal::TranscriptionFailed { segment, reason } => {
            tracing::warn!(session = %id, %segment, %reason, "transcription failed");
        },
        StageSignal::SynthesisFailed { turn, reason } => {
            tracing::warn!(session = %id, %turn, %reason, "synthesis failed");
        },
    }
}
