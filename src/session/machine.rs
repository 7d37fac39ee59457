//! # Session State Machine
//!
//! Tracks the lifecycle of one voice conversation:
//!
//! ```text
//! Idle ──start/audio──▶ Listening ──stop/boundary──▶ Transcribing
//!  ▲  ╲                                                 │      │
//!  │   ╲──chat text──▶ Thinking ◀──transcript ready─────┘      │
//!  │                      │                          failure   │
//!  │                 first audio                               │
//!  │                      ▼                                    │
//!  └──synthesis ended── Speaking      Idle ◀───────────────────┘
//! ```
//!
//! `Error`, `Cancel` and `Disconnect` reset any state to `Idle`. Every other
//! event that does not match an edge above is *ignored*: the machine stays
//! where it is and reports its current state, so a client that retransmits
//! `start` never gets an error for it.
//!
//! ## Rust Concepts:
//! - **Pure transition function**: `next()` is a plain `match` on
//!   `(state, event)` with no side effects, so it is trivial to test
//!   exhaustively.
//! - **Copy enums**: states and events are small `Copy` values.

use serde::Serialize;

/// The five states a session moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No utterance in progress
    Idle,
    /// Microphone audio streaming in
    Listening,
    /// Awaiting the speech-to-text result
    Transcribing,
    /// Awaiting the response text
    Thinking,
    /// Streaming synthesized audio out
    Speaking,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Idle,
        SessionState::Listening,
        SessionState::Transcribing,
        SessionState::Thinking,
        SessionState::Speaking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Transcribing => "transcribing",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
        }
    }
}

/// Inputs that drive the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Control(Start) from the client
    Start,
    /// An audio chunk from the client
    Audio,
    /// Control(Stop) from the client
    Stop,
    /// The silence detector found the end of an utterance
    UtteranceBoundary,
    /// A typed chat message from the client
    ChatText,
    /// Speech-to-text returned a transcript
    TranscriptReady,
    /// Speech-to-text failed
    TranscriptFailed,
    /// The first synthesized chunk is ready
    FirstAudio,
    /// The synthesized stream finished
    SynthesisEnded,
    /// Control(Error) from the client, or a pipeline failure
    Error,
    /// The client stopped an in-flight call
    Cancel,
    /// The connection went away
    Disconnect,
}

impl Event {
    pub const ALL: [Event; 12] = [
        Event::Start,
        Event::Audio,
        Event::Stop,
        Event::UtteranceBoundary,
        Event::ChatText,
        Event::TranscriptReady,
        Event::TranscriptFailed,
        Event::FirstAudio,
        Event::SynthesisEnded,
        Event::Error,
        Event::Cancel,
        Event::Disconnect,
    ];
}

/// Outcome of feeding one event to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A legal edge was taken
    Moved { from: SessionState, to: SessionState },
    /// A legal self-loop (e.g. more audio while listening)
    Stayed(SessionState),
    /// Not legal from here; the current state is re-emitted
    Ignored(SessionState),
}

impl Transition {
    /// State after the transition.
    pub fn state(&self) -> SessionState {
        match self {
            Transition::Moved { to, .. } => *to,
            Transition::Stayed(state) | Transition::Ignored(state) => *state,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Transition::Ignored(_))
    }
}

/// Compute the transition for `event` in `state`.
pub fn next(state: SessionState, event: Event) -> Transition {
    use Event as E;
    use SessionState as S;

    let to = match (state, event) {
        // Cancellation is always legal
        (S::Idle, E::Error | E::Cancel | E::Disconnect) => return Transition::Stayed(S::Idle),
        (_, E::Error | E::Cancel | E::Disconnect) => S::Idle,

        (S::Idle, E::Start | E::Audio) => S::Listening,
        (S::Idle, E::ChatText) => S::Thinking,
        (S::Listening, E::Audio) => return Transition::Stayed(S::Listening),
        (S::Listening, E::Stop | E::UtteranceBoundary) => S::Transcribing,
        (S::Transcribing, E::TranscriptReady) => S::Thinking,
        (S::Transcribing, E::TranscriptFailed) => S::Idle,
        (S::Thinking, E::FirstAudio) => S::Speaking,
        (S::Speaking, E::SynthesisEnded) => S::Idle,

        (current, _) => return Transition::Ignored(current),
    };

    Transition::Moved { from: state, to }
}

/// Stateful wrapper around [`next`].
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
    transitions: u64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            transitions: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of edges taken so far (self-loops and ignored events excluded).
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn apply(&mut self, event: Event) -> Transition {
        let transition = next(self.state, event);
        if let Transition::Moved { to, .. } = transition {
            self.state = to;
            self.transitions += 1;
        }
        transition
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
