//! Dialogue state machine
//!
//! The machine itself is a pure function from (state, event) to (state,
//! actions); all side effects live in the manager. The turn id a transition
//! may need is passed in so transitions stay deterministic under test.
//!
//! Ordering rule: the manager polls gate events before transcript events,
//! so when a new utterance races the previous segment's final transcript,
//! the speech start always wins and the response it interrupts is cancelled
//! before the transcript is seen.

use voxloop_core::{SegmentId, TurnId};

/// Where the dialogue currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    /// No speech, no response in flight
    Idle,
    /// User is speaking; waiting for the final transcript
    Listening { segment: SegmentId },
    /// A response turn is streaming and being spoken
    Responding { turn: TurnId },
    /// User barged in; the old turn is cancelled, a new utterance is open
    Interrupted { cancelled: TurnId, segment: SegmentId },
}

impl DialogueState {
    pub fn name(&self) -> &'static str {
        match self {
            DialogueState::Idle => "idle",
            DialogueState::Listening { .. } => "listening",
            DialogueState::Responding { .. } => "responding",
            DialogueState::Interrupted { .. } => "interrupted",
        }
    }
}

/// Normalized input to the machine.
#[derive(Debug, Clone)]
pub enum DialogueEvent {
    SpeechStart { segment: SegmentId },
    SpeechEnd { segment: SegmentId },
    FinalTranscript { segment: SegmentId, text: String },
    /// Segment ended with no usable transcript
    SegmentDiscarded { segment: SegmentId },
    /// The turn's audio has fully played out
    ResponseComplete { turn: TurnId },
    CompletionFailed { turn: TurnId, reason: String },
    SynthesisFailed { turn: TurnId, reason: String },
}

/// Side effect the manager must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a turn and start streaming a completion for it
    StartTurn { turn: TurnId, user_text: String },
    /// Cancel a turn's completion and synthesis immediately
    CancelTurn { turn: TurnId },
    /// Mark a turn completed in history
    CompleteTurn { turn: TurnId },
    /// Synthesis died; keep the spoken prefix and close the turn
    TruncateTurn { turn: TurnId, reason: String },
    /// Completion died; speak the configured fallback line instead
    SpeakFallback { turn: TurnId, reason: String },
}

/// Apply one event. `next_turn` is used only when the event opens a turn.
pub fn transition(
    state: &DialogueState,
    event: DialogueEvent,
    next_turn: TurnId,
) -> (DialogueState, Vec<Action>) {
    use DialogueEvent as E;
    use DialogueState as S;

    match (state, event) {
        (S::Idle, E::SpeechStart { segment }) => (S::Listening { segment }, vec![]),

        // Overlap: the gate already force-closed the previous segment, so the
        // newest segment simply replaces it.
        (S::Listening { .. }, E::SpeechStart { segment }) => (S::Listening { segment }, vec![]),

        // Barge-in
        (S::Responding { turn }, E::SpeechStart { segment }) => (
            S::Interrupted {
                cancelled: *turn,
                segment,
            },
            vec![Action::CancelTurn { turn: *turn }],
        ),

        (S::Interrupted { cancelled, .. }, E::SpeechStart { segment }) => (
            S::Interrupted {
                cancelled: *cancelled,
                segment,
            },
            vec![],
        ),

        // The gate closing only matters once the transcript settles.
        (state, E::SpeechEnd { .. }) => (*state, vec![]),

        (S::Listening { segment }, E::FinalTranscript { segment: s, text }) if *segment == s => {
            open_turn(text, next_turn)
        },
        (S::Interrupted { segment, .. }, E::FinalTranscript { segment: s, text })
            if *segment == s =>
        {
            open_turn(text, next_turn)
        },
        // A final transcript with no preceding speech-start event still
        // deserves a response.
        (S::Idle, E::FinalTranscript { text, .. }) => open_turn(text, next_turn),
        (state, E::FinalTranscript { segment, .. }) => {
            tracing::warn!(%segment, state = state.name(), "stale final transcript ignored");
            (*state, vec![])
        },

        (S::Listening { segment }, E::SegmentDiscarded { segment: s }) if *segment == s => {
            (S::Idle, vec![])
        },
        (S::Interrupted { segment, .. }, E::SegmentDiscarded { segment: s }) if *segment == s => {
            (S::Idle, vec![])
        },
        (state, E::SegmentDiscarded { .. }) => (*state, vec![]),

        (S::Responding { turn }, E::ResponseComplete { turn: t }) if *turn == t => {
            (S::Idle, vec![Action::CompleteTurn { turn: t }])
        },
        (state, E::ResponseComplete { turn }) => {
            tracing::warn!(%turn, state = state.name(), "stale response completion ignored");
            (*state, vec![])
        },

        (S::Responding { turn }, E::CompletionFailed { turn: t, reason }) if *turn == t => {
            (S::Idle, vec![Action::SpeakFallback { turn: t, reason }])
        },
        (state, E::CompletionFailed { turn, .. }) => {
            tracing::warn!(%turn, state = state.name(), "stale completion failure ignored");
            (*state, vec![])
        },

        (S::Responding { turn }, E::SynthesisFailed { turn: t, reason }) if *turn == t => {
            (S::Idle, vec![Action::TruncateTurn { turn: t, reason }])
        },
        (state, E::SynthesisFailed { .. }) => (*state, vec![]),
    }
}

fn open_turn(text: String, turn: TurnId) -> (DialogueState, Vec<Action>) {
    if text.trim().is_empty() {
        return (DialogueState::Idle, vec![]);
    }
    (
        DialogueState::Responding { turn },
        vec![Action::StartTurn {
            turn,
            user_text: text,
        }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg() -> SegmentId {
        SegmentId::new()
    }

    #[test]
    fn idle_listens_then_responds() {
        let s = seg();
        let (state, actions) =
            transition(&DialogueState::Idle, DialogueEvent::SpeechStart { segment: s }, TurnId::new());
        assert_eq!(state, DialogueState::Listening { segment: s });
        assert!(actions.is_empty());

        let turn = TurnId::new();
        let (state, actions) = transition(
            &state,
            DialogueEvent::FinalTranscript {
                segment: s,
                text: "hello there".into(),
            },
            turn,
        );
        assert_eq!(state, DialogueState::Responding { turn });
        assert_eq!(
            actions,
            vec![Action::StartTurn {
                turn,
                user_text: "hello there".into()
            }]
        );
    }

    #[test]
    fn barge_in_cancels_and_interrupted_opens_next_turn() {
        let old_turn = TurnId::new();
        let s = seg();
        let (state, actions) = transition(
            &DialogueState::Responding { turn: old_turn },
            DialogueEvent::SpeechStart { segment: s },
            TurnId::new(),
        );
        assert_eq!(
            state,
            DialogueState::Interrupted {
                cancelled: old_turn,
                segment: s
            }
        );
        assert_eq!(actions, vec![Action::CancelTurn { turn: old_turn }]);

        let new_turn = TurnId::new();
        let (state, actions) = transition(
            &state,
            DialogueEvent::FinalTranscript {
                segment: s,
                text: "actually, stop".into(),
            },
            new_turn,
        );
        assert_eq!(state, DialogueState::Responding { turn: new_turn });
        assert_eq!(
            actions,
            vec![Action::StartTurn {
                turn: new_turn,
                user_text: "actually, stop".into()
            }]
        );
    }

    #[test]
    fn empty_transcript_returns_to_idle_without_turn() {
        let s = seg();
        let (state, actions) = transition(
            &DialogueState::Listening { segment: s },
            DialogueEvent::FinalTranscript {
                segment: s,
                text: "   ".into(),
            },
            TurnId::new(),
        );
        assert_eq!(state, DialogueState::Idle);
        assert!(actions.is_empty());
    }

    #[test]
    fn stale_transcript_for_old_segment_is_ignored() {
        let current = seg();
        let stale = seg();
        let (state, actions) = transition(
            &DialogueState::Listening { segment: current },
            DialogueEvent::FinalTranscript {
                segment: stale,
                text: "late arrival".into(),
            },
            TurnId::new(),
        );
        assert_eq!(state, DialogueState::Listening { segment: current });
        assert!(actions.is_empty());
    }

    #[test]
    fn completion_failure_yields_fallback_and_idle() {
        let turn = TurnId::new();
        let (state, actions) = transition(
            &DialogueState::Responding { turn },
            DialogueEvent::CompletionFailed {
                turn,
                reason: "backend down".into(),
            },
            TurnId::new(),
        );
        assert_eq!(state, DialogueState::Idle);
        assert_eq!(
            actions,
            vec![Action::SpeakFallback {
                turn,
                reason: "backend down".into()
            }]
        );
    }

    #[test]
    fn discarded_segment_resets_to_idle() {
        let s = seg();
        let (state, actions) = transition(
            &DialogueState::Interrupted {
                cancelled: TurnId::new(),
                segment: s,
            },
            DialogueEvent::SegmentDiscarded { segment: s },
            TurnId::new(),
        );
        assert_eq!(state, DialogueState::Idle);
        assert!(actions.is_empty());
    }

    #[test]
    fn stale_completion_events_do_not_disturb_new_turn() {
        let old_turn = TurnId::new();
        let current = TurnId::new();
        let state = DialogueState::Responding { turn: current };

        let (after, actions) = transition(
            &state,
            DialogueEvent::ResponseComplete { turn: old_turn },
            TurnId::new(),
        );
        assert_eq!(after, state);
        assert!(actions.is_empty());

        let (after, actions) = transition(
            &state,
            DialogueEvent::CompletionFailed {
                turn: old_turn,
                reason: "late".into(),
            },
            TurnId::new(),
        );
        assert_eq!(after, state);
        assert!(actions.is_empty());
    }
}
