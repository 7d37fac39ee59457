//! # Voice Sessions
//!
//! One [`Session`] per client connection. It groups everything the relay
//! task mutates while a conversation is live:
//!
//! - **machine**: lifecycle state ([`machine::StateMachine`])
//! - **input**: bounded buffer of the utterance being recorded
//! - **output**: pending synthesized audio, debounced into batches
//! - **transcript**: append-only record of the conversation's turns
//! - **last_activity**: drives the idle timeout
//!
//! The registry only ever sees a read-only view of the state, published
//! through the session's `watch` channel.

pub mod batcher;
pub mod buffer;
pub mod machine;
pub mod registry;

use crate::session::batcher::OutputBatcher;
use crate::session::buffer::{AudioFormat, AudioRingBuffer};
use crate::session::machine::{Event, SessionState, StateMachine, Transition};
use crate::session::registry::{SessionId, SessionTicket};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Who produced a turn in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Append-only list of turns, discarded with the session.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.turns.push(Turn {
            speaker,
            text: text.into(),
            at: Utc::now(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Per-session tuning, taken from the relay and audio configuration when the
/// connection is accepted.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub format: AudioFormat,
    pub max_utterance_ms: u64,
    pub debounce: Duration,
    pub max_batch_delay: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            max_utterance_ms: 30_000,
            debounce: Duration::from_millis(300),
            max_batch_delay: Duration::from_millis(1000),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

pub struct Session {
    pub id: SessionId,
    pub cancel: CancellationToken,
    pub input: AudioRingBuffer,
    pub output: OutputBatcher,
    pub transcript: Transcript,
    machine: StateMachine,
    state_tx: watch::Sender<SessionState>,
    last_activity: Instant,
    idle_timeout: Duration,
}

impl Session {
    pub fn new(ticket: SessionTicket, settings: &SessionSettings) -> Self {
        Self {
            id: ticket.id,
            cancel: ticket.cancel,
            input: AudioRingBuffer::new(settings.format, settings.max_utterance_ms),
            output: OutputBatcher::new(settings.debounce, settings.max_batch_delay),
            transcript: Transcript::default(),
            machine: StateMachine::new(),
            state_tx: ticket.state_tx,
            last_activity: Instant::now(),
            idle_timeout: settings.idle_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// State changes taken over the session's lifetime.
    pub fn transitions(&self) -> u64 {
        self.machine.transitions()
    }

    /// Feed an event to the state machine and publish the result.
    ///
    /// Ignored events are logged and re-emit the current state.
    pub fn apply(&mut self, event: Event) -> Transition {
        let transition = self.machine.apply(event);
        match transition {
            Transition::Moved { from, to } => {
                debug!(session_id = %self.id, ?event, from = from.as_str(), to = to.as_str(), "Session transition");
                if to == SessionState::Idle {
                    self.input.clear();
                }
                self.state_tx.send_replace(to);
            }
            Transition::Ignored(current) => {
                debug!(session_id = %self.id, ?event, state = current.as_str(), "Ignoring event");
                self.state_tx.send_replace(current);
            }
            Transition::Stayed(_) => {}
        }
        transition
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Instant at which the session counts as idle.
    pub fn idle_deadline(&self) -> Instant {
        self.last_activity + self.idle_timeout
    }
}
