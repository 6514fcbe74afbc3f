// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session lifecycle state machine.
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─┬─► Reconnecting ─► Connected
//!                                          │         └─► FatallyFailed
//!                                          └─► ClosedAwaitingTransfer ─► Transferring ─► Connected
//!                                                                             └─► Connecting (fresh connect)
//! any non-terminal ─► Closed
//! ```
//!
//! Every transition is written to the [`OutputSink`] and traced with the
//! pre-state, post-state and triggering event.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{FatalError, SessionResult};
use crate::output::OutputSink;

// =============================================================================
// SessionState
// =============================================================================

/// State of a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No channel.
    #[default]
    Disconnected,

    /// Opening a channel.
    Connecting,

    /// Channel open and usable.
    Connected,

    /// Channel lost; retrying with backoff.
    Reconnecting,

    /// Channel closed on purpose; the subscription persists server-side.
    ClosedAwaitingTransfer,

    /// Binding the persisted subscription to a new channel.
    Transferring,

    /// Explicitly disconnected.
    Closed,

    /// Retry budget exhausted.
    FatallyFailed,
}

impl SessionState {
    /// Returns `true` if requests can be sent.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` for states the session never leaves.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::FatallyFailed)
    }

    /// Returns `true` while a channel change is in progress.
    #[inline]
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Reconnecting | Self::ClosedAwaitingTransfer | Self::Transferring
        )
    }

    /// Returns `true` if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Closed {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Connected, ClosedAwaitingTransfer)
                | (Reconnecting, Connected)
                | (Reconnecting, FatallyFailed)
                | (ClosedAwaitingTransfer, Transferring)
                | (Transferring, Connected)
                | (Transferring, Connecting)
                | (Transferring, Reconnecting)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::ClosedAwaitingTransfer => write!(f, "ClosedAwaitingTransfer"),
            Self::Transferring => write!(f, "Transferring"),
            Self::Closed => write!(f, "Closed"),
            Self::FatallyFailed => write!(f, "FatallyFailed"),
        }
    }
}

// =============================================================================
// SessionEvent
// =============================================================================

/// What triggered a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `connect` was called.
    ConnectRequested {
        /// Endpoint URL.
        endpoint: String,
    },
    /// A channel was opened.
    ChannelOpened {
        /// Channel description.
        channel: String,
    },
    /// Opening a channel failed.
    OpenFailed {
        /// Error message.
        reason: String,
    },
    /// The channel went down or stopped answering.
    ChannelLost {
        /// Reason.
        reason: String,
    },
    /// Every reconnect attempt failed.
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The durable close checkpoint was reached.
    CloseCheckpoint,
    /// The durable restart checkpoint was reached.
    RestartCheckpoint,
    /// The subscription now lives on the new channel.
    TransferSucceeded {
        /// Channel description.
        channel: String,
    },
    /// The server refused the transfer.
    TransferRejected {
        /// Error message.
        reason: String,
    },
    /// `disconnect` was called.
    DisconnectRequested,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectRequested { endpoint } => write!(f, "connect requested to {endpoint}"),
            Self::ChannelOpened { channel } => write!(f, "channel {channel} opened"),
            Self::OpenFailed { reason } => write!(f, "open failed: {reason}"),
            Self::ChannelLost { reason } => write!(f, "channel lost: {reason}"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "reconnect gave up after {attempts} attempts")
            }
            Self::CloseCheckpoint => write!(f, "close checkpoint"),
            Self::RestartCheckpoint => write!(f, "restart checkpoint"),
            Self::TransferSucceeded { channel } => write!(f, "subscription transferred to {channel}"),
            Self::TransferRejected { reason } => write!(f, "transfer rejected: {reason}"),
            Self::DisconnectRequested => write!(f, "disconnect requested"),
        }
    }
}

// =============================================================================
// StateTransition
// =============================================================================

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// Pre-state.
    pub from: SessionState,
    /// Post-state.
    pub to: SessionState,
    /// Triggering event.
    pub event: SessionEvent,
    /// Wall-clock time of the transition.
    pub at: DateTime<Utc>,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[session] {} -> {} ({})", self.from, self.to, self.event)
    }
}

// =============================================================================
// StateMachine
// =============================================================================

/// Holds the single [`SessionState`] of a session.
///
/// The state is only changed through [`StateMachine::transition`], which is
/// called by the controller alone.
pub struct StateMachine {
    state: RwLock<SessionState>,
    history: RwLock<Vec<StateTransition>>,
    output: Arc<dyn OutputSink>,
}

impl StateMachine {
    /// Creates a machine in [`SessionState::Disconnected`].
    pub fn new(output: Arc<dyn OutputSink>) -> Self {
        Self {
            state: RwLock::new(SessionState::Disconnected),
            history: RwLock::new(Vec::new()),
            output,
        }
    }

    /// Current state.
    pub fn current(&self) -> SessionState {
        *self.state.read()
    }

    /// All transitions so far, oldest first.
    pub fn history(&self) -> Vec<StateTransition> {
        self.history.read().clone()
    }

    /// Moves to `to`, logging the transition.
    ///
    /// # Errors
    ///
    /// `FatalError::ProtocolViolation` if the transition is not allowed.
    pub fn transition(&self, to: SessionState, event: SessionEvent) -> SessionResult<StateTransition> {
        let transition = {
            let mut state = self.state.write();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(FatalError::protocol_violation(format!(
                    "illegal session transition {from} -> {to} on {event}"
                ))
                .into());
            }
            *state = to;
            StateTransition {
                from,
                to,
                event,
                at: Utc::now(),
            }
        };

        self.output.write_line(&transition.to_string());
        tracing::info!(
            from = %transition.from,
            to = %transition.to,
            event = %transition.event,
            "Session state changed"
        );

        self.history.write().push(transition.clone());
        Ok(transition)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .field("transitions", &self.history.read().len())
            .finish()
    }
}

// =============================================================================
// TerminationReason / WaitBudget
// =============================================================================

/// Why a monitoring phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The quit signal was raised.
    QuitRequested,
    /// The deadline elapsed.
    DeadlineExceeded,
    /// The session failed and cannot continue.
    FatalError,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuitRequested => write!(f, "quit requested"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::FatalError => write!(f, "fatal error"),
        }
    }
}

/// Time budget of one monitoring phase.
///
/// Created when the phase starts and dropped when it ends.
#[derive(Debug, Clone, Copy)]
pub struct WaitBudget {
    started_at: Instant,
    deadline: Option<Duration>,
    poll_interval: Duration,
    ticks: u64,
}

impl WaitBudget {
    /// Starts a budget now.
    pub fn start(deadline: Option<Duration>, poll_interval: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            deadline,
            poll_interval,
            ticks: 0,
        }
    }

    /// Time since the phase started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Configured deadline.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Instant at which the deadline elapses.
    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline.map(|d| self.started_at + d)
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_sub(self.elapsed()))
    }

    /// Returns `true` once elapsed time reached the deadline.
    pub fn is_exhausted(&self) -> bool {
        self.deadline.is_some_and(|d| self.elapsed() >= d)
    }

    /// Counts a poll tick and returns the tick number (1-based).
    pub fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    /// Ticks counted so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;

    #[test]
    fn test_allowed_transitions() {
        use SessionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(ClosedAwaitingTransfer));
        assert!(Transferring.can_transition_to(Connecting));
        assert!(Reconnecting.can_transition_to(FatallyFailed));
        assert!(Connected.can_transition_to(Closed));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Transferring));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!FatallyFailed.can_transition_to(Closed));
    }

    #[test]
    fn test_state_flags() {
        assert!(SessionState::Connected.is_connected());
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::FatallyFailed.is_terminal());
        assert!(SessionState::Transferring.is_transitioning());
        assert!(!SessionState::Connected.is_transitioning());
    }

    #[test]
    fn test_transition_is_logged() {
        let sink = MemorySink::new();
        let machine = StateMachine::new(Arc::new(sink.clone()));

        machine
            .transition(
                SessionState::Connecting,
                SessionEvent::ConnectRequested {
                    endpoint: "opc.tcp://localhost:62541".into(),
                },
            )
            .unwrap();

        assert_eq!(machine.current(), SessionState::Connecting);
        assert_eq!(
            sink.lines(),
            vec!["[session] Disconnected -> Connecting (connect requested to opc.tcp://localhost:62541)"]
        );
        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let sink = MemorySink::new();
        let machine = StateMachine::new(Arc::new(sink.clone()));

        let err = machine
            .transition(SessionState::Transferring, SessionEvent::RestartCheckpoint)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(machine.current(), SessionState::Disconnected);
        assert!(sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_budget() {
        let mut budget = WaitBudget::start(Some(Duration::from_secs(3)), Duration::from_secs(1));
        assert!(!budget.is_exhausted());
        assert_eq!(budget.tick(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining(), Some(Duration::ZERO));

        let open = WaitBudget::start(None, Duration::from_secs(1));
        assert!(!open.is_exhausted());
        assert_eq!(open.deadline_at(), None);
    }
}
