//! Connection state machine for the RPC channel.
//!
//! This module provides a pure, side-effect-free state machine for the
//! channel lifecycle `Connecting → Open → (Reconnecting → Open)* → Closed`.
//! The state machine takes events as input and produces a new state plus a
//! list of actions to execute.
//!
//! The actual I/O (connecting, sending the handshake, replaying
//! subscriptions) is performed by sync-client, not by this module.

use std::time::Duration;

/// Channel state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, never connected.
    Idle,
    /// Transport connection attempt in progress.
    Connecting {
        /// True when this follows a lost connection.
        resumed: bool,
        /// Failed attempts since the channel was last open.
        attempt: u32,
    },
    /// Transport up, handshake (login + subscription replay) in progress.
    Handshaking {
        /// True when this follows a lost connection.
        resumed: bool,
        /// Failed attempts since the channel was last open.
        attempt: u32,
    },
    /// Ready: queued and new calls are released.
    Open,
    /// Connection lost, waiting to reconnect.
    Reconnecting {
        /// Number of reconnection attempts so far.
        attempt: u32,
    },
    /// Closed by the owner. Terminal.
    Closed,
}

impl ChannelState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // Close wins from every live state
            (Self::Closed, _) => (Self::Closed, vec![]),
            (Self::Reconnecting { .. }, Event::CloseRequested) => (
                Self::Closed,
                vec![
                    Action::CancelReconnect,
                    Action::RejectPending {
                        reason: "channel closed".into(),
                    },
                ],
            ),
            (_, Event::CloseRequested) => (
                Self::Closed,
                vec![
                    Action::CloseTransport,
                    Action::RejectPending {
                        reason: "channel closed".into(),
                    },
                ],
            ),

            // From Idle
            (Self::Idle, Event::ConnectRequested) => (
                Self::Connecting {
                    resumed: false,
                    attempt: 0,
                },
                vec![Action::Connect],
            ),

            // From Connecting
            (Self::Connecting { resumed, attempt }, Event::ConnectSucceeded) => (
                Self::Handshaking { resumed, attempt },
                vec![Action::StartHandshake { resumed }],
            ),
            (Self::Connecting { attempt, .. }, Event::ConnectFailed { .. }) => {
                let attempt = attempt.saturating_add(1);
                (
                    Self::Reconnecting { attempt },
                    vec![Action::StartReconnectTimer { attempt }],
                )
            }

            // From Handshaking
            (Self::Handshaking { .. }, Event::HandshakeCompleted) => (Self::Open, vec![]),
            (Self::Handshaking { attempt, .. }, Event::HandshakeFailed { error }) => {
                let attempt = attempt.saturating_add(1);
                (
                    Self::Reconnecting { attempt },
                    vec![
                        Action::CloseTransport,
                        Action::RejectPending { reason: error },
                        Action::StartReconnectTimer { attempt },
                    ],
                )
            }
            (Self::Handshaking { attempt, .. }, Event::Disconnected { reason }) => {
                let attempt = attempt.saturating_add(1);
                (
                    Self::Reconnecting { attempt },
                    vec![
                        Action::RejectPending { reason },
                        Action::StartReconnectTimer { attempt },
                    ],
                )
            }

            // From Open
            (Self::Open, Event::Disconnected { reason }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    Action::RejectPending { reason },
                    Action::StartReconnectTimer { attempt: 1 },
                ],
            ),

            // From Reconnecting
            (Self::Reconnecting { attempt }, Event::ReconnectTimer) => (
                Self::Connecting {
                    resumed: true,
                    attempt,
                },
                vec![Action::Connect],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if calls can be released.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if currently trying to (re)establish the connection.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Connecting { .. } | Self::Handshaking { .. } | Self::Reconnecting { .. }
        )
    }

    /// Check if the channel has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur in the channel lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Owner asked to connect.
    ConnectRequested,
    /// Transport connection succeeded.
    ConnectSucceeded,
    /// Transport connection failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Handshake and subscription replay finished.
    HandshakeCompleted,
    /// Handshake was rejected or failed.
    HandshakeFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Transport connection was lost.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Owner asked to close.
    CloseRequested,
    /// Reconnect timer fired.
    ReconnectTimer,
}

/// Actions to be executed by the channel.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport connection.
    Connect,
    /// Send the handshake; on `resumed`, also replay subscriptions and run
    /// the owner's reconnect hook.
    StartHandshake {
        /// True when this follows a lost connection.
        resumed: bool,
    },
    /// Reject every outstanding request with this reason.
    RejectPending {
        /// Why the requests failed.
        reason: String,
    },
    /// Wait before reconnecting (see [`BackoffPolicy::delay`]).
    StartReconnectTimer {
        /// Which attempt the timer is for.
        attempt: u32,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Close the transport.
    CloseTransport,
}

/// Reconnection backoff with jitter.
///
/// Uses exponential backoff with random jitter to prevent thundering herd
/// when many clients reconnect simultaneously after a server restart.
///
/// Formula: min(max, base * 2^(attempt-1)) + random(0..=jitter)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Cap on the exponential part.
    pub max: Duration,
    /// Upper bound of the random jitter.
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Delay before the given (1-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self.base.saturating_mul(1u32 << exponent);
        scaled.min(self.max) + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        let mut bytes = [0u8; 8];
        if getrandom::getrandom(&mut bytes).is_err() {
            return Duration::ZERO;
        }
        Duration::from_millis(u64::from_le_bytes(bytes) % (bound + 1))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(1000),
        }
    }
}
