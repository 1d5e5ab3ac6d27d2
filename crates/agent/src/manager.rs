//! Dialogue manager
//!
//! Single writer for conversation history and dialogue state. Consumes gate
//! events, transcript events, and synthesis feedback; produces synthesis
//! commands and completion requests. One task per session.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voxloop_config::ResponseSettings;
use voxloop_core::{
    CompletionRequest, ConversationHistory, FrameSender, GateEvent, LlmCapability, ResponseChunk,
    Result, Turn, TurnId, TurnStatus,
};
use voxloop_pipeline::{SynthCommand, SynthEvent, TranscriptEvent};

use crate::chunker::SentenceChunker;
use crate::state::{transition, Action, DialogueEvent, DialogueState};

/// Internal feedback from a completion task
#[derive(Debug)]
enum TurnOutcome {
    CompletionFailed { turn: TurnId, reason: String },
}

/// A turn whose response is currently being generated or spoken.
struct ActiveResponse {
    turn: TurnId,
    cancel: CancellationToken,
    /// Chunk indices handed to synthesis so far
    chunk_counter: Arc<AtomicU32>,
}

pub struct DialogueManager {
    llm: Arc<dyn LlmCapability>,
    settings: ResponseSettings,
    state: DialogueState,
    history: ConversationHistory,
    active: Option<ActiveResponse>,
    synth: FrameSender<SynthCommand>,
    /// Tells playout to drop a cancelled turn's queued audio
    flushes: mpsc::Sender<TurnId>,
    outcome_tx: mpsc::Sender<TurnOutcome>,
    outcome_rx: mpsc::Receiver<TurnOutcome>,
}

impl DialogueManager {
    pub fn new(
        llm: Arc<dyn LlmCapability>,
        settings: ResponseSettings,
        synth: FrameSender<SynthCommand>,
        flushes: mpsc::Sender<TurnId>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::channel(8);
        Self {
            llm,
            settings,
            state: DialogueState::Idle,
            history: ConversationHistory::new(),
            active: None,
            synth,
            flushes,
            outcome_tx,
            outcome_rx,
        }
    }

    pub fn state(&self) -> &DialogueState {
        &self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Run until an upstream channel closes or the session is cancelled.
    ///
    /// Returns the final conversation history for session records.
    pub async fn run(
        mut self,
        mut gate_events: mpsc::Receiver<GateEvent>,
        mut transcripts: mpsc::Receiver<TranscriptEvent>,
        mut synth_feedback: mpsc::Receiver<SynthEvent>,
        cancel: CancellationToken,
    ) -> Result<ConversationHistory> {
        if self.settings.greet_on_join {
            self.start_greeting().await;
        }

        loop {
            // Gate events are polled before transcripts: a speech start that
            // races the previous segment's final transcript must cancel the
            // in-flight response before that transcript opens a new turn.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = gate_events.recv() => match event {
                    Some(event) => self.on_gate_event(event).await,
                    None => break,
                },
                outcome = self.outcome_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.on_outcome(outcome).await;
                    }
                },
                event = synth_feedback.recv() => match event {
                    Some(event) => self.on_synth_event(event).await,
                    None => break,
                },
                event = transcripts.recv() => match event {
                    Some(event) => self.on_transcript_event(event).await,
                    None => break,
                },
            }
        }

        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            self.history.mark_cancelled(active.turn);
        }
        self.synth.close();
        tracing::info!(turns = self.history.len(), "dialogue manager stopped");
        Ok(self.history)
    }

    async fn on_gate_event(&mut self, event: GateEvent) {
        match event {
            GateEvent::SpeechStart { segment, .. } => {
                tracing::debug!(%segment, state = self.state.name(), "speech started");
                // A fallback line may still be playing while the state is
                // already idle; new speech silences it too.
                if matches!(self.state, DialogueState::Idle) {
                    if let Some(active) = self.active.take() {
                        active.cancel.cancel();
                        let _ = self.flushes.send(active.turn).await;
                    }
                }
                self.apply(DialogueEvent::SpeechStart { segment }).await;
            },
            GateEvent::SpeechEnd { segment, .. } => {
                self.apply(DialogueEvent::SpeechEnd { segment }).await;
            },
        }
    }

    async fn on_transcript_event(&mut self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::Partial(transcript) => {
                tracing::trace!(segment = %transcript.segment, text = %transcript.text, "partial");
            },
            TranscriptEvent::Final(transcript) => {
                self.apply(DialogueEvent::FinalTranscript {
                    segment: transcript.segment,
                    text: transcript.text,
                })
                .await;
            },
            TranscriptEvent::Discarded { segment } => {
                self.apply(DialogueEvent::SegmentDiscarded { segment }).await;
            },
            TranscriptEvent::Failed { segment, reason } => {
                tracing::warn!(%segment, %reason, "transcription failed; dropping segment");
                self.apply(DialogueEvent::SegmentDiscarded { segment }).await;
            },
        }
    }

    async fn on_synth_event(&mut self, event: SynthEvent) {
        match event {
            // Spoken text is recorded even if the turn was cancelled moments
            // later; what the user heard stays in history. Fallback turns
            // already carry their full text.
            SynthEvent::ChunkSent { turn, text, .. } => {
                let skip = self
                    .history
                    .get_mut(turn)
                    .map(|t| t.status == TurnStatus::Fallback)
                    .unwrap_or(true);
                if !skip {
                    self.history.record_spoken(turn, &text);
                }
            },
            SynthEvent::TurnComplete { turn } => {
                // A completed fallback line only needs its playback slot freed.
                let fallback_done = self.active.as_ref().map(|a| a.turn) == Some(turn)
                    && !matches!(self.state, DialogueState::Responding { turn: t } if t == turn);
                if fallback_done {
                    self.active = None;
                    return;
                }
                self.apply(DialogueEvent::ResponseComplete { turn }).await;
            },
            SynthEvent::Failed { turn, reason } => {
                self.apply(DialogueEvent::SynthesisFailed { turn, reason }).await;
            },
        }
    }

    async fn on_outcome(&mut self, outcome: TurnOutcome) {
        match outcome {
            TurnOutcome::CompletionFailed { turn, reason } => {
                self.apply(DialogueEvent::CompletionFailed { turn, reason }).await;
            },
        }
    }

    async fn apply(&mut self, event: DialogueEvent) {
        let (next_state, actions) = transition(&self.state, event, TurnId::new());
        if next_state != self.state {
            tracing::debug!(from = self.state.name(), to = next_state.name(), "state change");
        }
        self.state = next_state;
        for action in actions {
            self.perform(action).await;
        }
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::StartTurn { turn, user_text } => {
                self.start_turn(turn, user_text).await;
            },
            Action::CancelTurn { turn } => {
                if let Some(active) = self.active.take() {
                    active.cancel.cancel();
                }
                // Cancelling the token stops production; the flush clears
                // what was already produced but not yet played.
                let _ = self.flushes.send(turn).await;
                self.history.mark_cancelled(turn);
                tracing::info!(%turn, "response cancelled by barge-in");
            },
            Action::CompleteTurn { turn } => {
                self.history.mark_completed(turn);
                self.active = None;
                tracing::info!(%turn, "turn complete");
            },
            Action::TruncateTurn { turn, reason } => {
                tracing::warn!(%turn, %reason, "synthesis failed; turn truncated");
                self.history.mark_completed(turn);
                self.active = None;
            },
            Action::SpeakFallback { turn, reason } => {
                self.speak_fallback(turn, reason).await;
            },
        }
    }

    async fn start_turn(&mut self, turn: TurnId, user_text: String) {
        let mut entry = Turn::new(user_text);
        entry.id = turn;
        self.history.push(entry);

        let request = CompletionRequest::new(&self.settings.system_prompt)
            .with_history(self.history.turns())
            .with_max_tokens(self.settings.max_tokens)
            .with_temperature(self.settings.temperature);

        self.spawn_completion(turn, request);
        tracing::info!(%turn, model = self.llm.model_name(), "completion started");
    }

    /// Speak an unprompted opening line built from the system prompt alone.
    async fn start_greeting(&mut self) {
        let turn = TurnId::new();
        let mut entry = Turn::new("");
        entry.id = turn;
        self.history.push(entry);
        self.state = DialogueState::Responding { turn };

        let request = CompletionRequest::new(&self.settings.system_prompt)
            .with_max_tokens(self.settings.max_tokens)
            .with_temperature(self.settings.temperature);

        self.spawn_completion(turn, request);
        tracing::info!(%turn, "greeting turn started");
    }

    fn spawn_completion(&mut self, turn: TurnId, request: CompletionRequest) {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        self.active = Some(ActiveResponse {
            turn,
            cancel: cancel.clone(),
            chunk_counter: counter.clone(),
        });

        let llm = self.llm.clone();
        let synth = self.synth.clone();
        let outcomes = self.outcome_tx.clone();
        tokio::spawn(drive_completion(
            llm, request, turn, cancel, counter, synth, outcomes,
        ));
    }

    /// The model died mid-turn; apologize out loud and close the turn.
    async fn speak_fallback(&mut self, turn: TurnId, reason: String) {
        tracing::error!(%turn, %reason, "completion failed; speaking fallback");

        let counter = match self.active.take() {
            Some(active) if active.turn == turn => {
                active.cancel.cancel();
                active.chunk_counter
            },
            other => {
                self.active = other;
                Arc::new(AtomicU32::new(0))
            },
        };

        if let Some(entry) = self.history.get_mut(turn) {
            entry.status = TurnStatus::Fallback;
            entry.assistant_text = self.settings.fallback_text.clone();
        }

        // Fresh token so the fallback line itself survives the cancellation,
        // while remaining interruptible by new speech.
        let cancel = CancellationToken::new();
        let index = counter.fetch_add(1, Ordering::SeqCst);
        let chunk = ResponseChunk::final_chunk(turn, index, self.settings.fallback_text.clone());
        self.active = Some(ActiveResponse {
            turn,
            cancel: cancel.clone(),
            chunk_counter: counter,
        });
        if self.synth.send(SynthCommand { chunk, cancel }).await.is_err() {
            tracing::warn!(%turn, "synthesis bus closed; fallback not spoken");
            self.active = None;
        }
    }
}

/// Drives one completion stream into synthesis commands.
///
/// Success is not reported here; the turn completes only when synthesis has
/// played the final chunk. Only failures come back through `outcomes`.
async fn drive_completion(
    llm: Arc<dyn LlmCapability>,
    request: CompletionRequest,
    turn: TurnId,
    cancel: CancellationToken,
    counter: Arc<AtomicU32>,
    synth: FrameSender<SynthCommand>,
    outcomes: mpsc::Sender<TurnOutcome>,
) {
    let mut stream = llm.complete(request, cancel.clone());
    let mut chunker = SentenceChunker::new();

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = stream.next() => match item {
                Some(item) => item,
                None => break,
            },
        };
        match item {
            Ok(chunk) => {
                for sentence in chunker.push(&chunk.delta) {
                    let index = counter.fetch_add(1, Ordering::SeqCst);
                    let command = SynthCommand {
                        chunk: ResponseChunk::new(turn, index, sentence),
                        cancel: cancel.clone(),
                    };
                    if synth.send(command).await.is_err() {
                        return;
                    }
                }
                if chunk.is_final {
                    break;
                }
            },
            Err(e) => {
                tracing::warn!(%turn, error = %e, "completion stream failed");
                let _ = outcomes
                    .send(TurnOutcome::CompletionFailed {
                        turn,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            },
        }
    }

    // Remaining text rides on the turn-final marker chunk.
    let index = counter.fetch_add(1, Ordering::SeqCst);
    let command = SynthCommand {
        chunk: ResponseChunk::final_chunk(turn, index, chunker.finish()),
        cancel: cancel.clone(),
    };
    if synth.send(command).await.is_err() {
        tracing::debug!(%turn, "synthesis bus closed before turn-final chunk");
    }
}
