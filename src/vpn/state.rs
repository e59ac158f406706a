//! Connection lifecycle state machine
//!
//! Pure state logic, independently testable: no knowledge of sockets or
//! processes. All concurrent event sources are serialized through the
//! single `apply` entry point by the session controller; redundant or
//! out-of-order events are no-ops so repeated signals from the monitor
//! tasks cannot corrupt the lifecycle.

use serde::{Deserialize, Serialize};

use super::types::DisconnectReason;

/// VPN connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected and not attempting to connect
    Disconnected,
    /// Currently attempting to connect
    Connecting,
    /// Tunnel established
    Connected,
    /// Graceful shutdown in progress
    Disconnecting,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl ConnectionState {
    /// Get a human-readable string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle events fed into the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connect attempt has started
    ConnectStarted,
    /// The tunnel is up (initialization sequence completed)
    Established,
    /// The user asked for a graceful disconnect
    DisconnectRequested,
    /// The subprocess is gone, with the reason it went away
    ProcessExited { reason: DisconnectReason },
}

/// A state change produced by applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Connection lifecycle state holder
///
/// Transitions are monotone along the cycle
/// disconnected → connecting → connected → disconnecting → disconnected;
/// the only permitted shortcuts are connecting → disconnected (failed
/// connect) and connected → disconnected (abrupt loss).
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply an event, returning the transition it caused
    ///
    /// Returns `None` when the event is redundant for the current state
    /// (duplicate `Established`, terminal event applied twice, and so on).
    pub fn apply(&mut self, event: &ConnectionEvent) -> Option<Transition> {
        use ConnectionState::*;

        let to = match (self.state, event) {
            (Disconnected, ConnectionEvent::ConnectStarted) => Connecting,
            (Connecting, ConnectionEvent::Established) => Connected,
            (Connecting | Connected, ConnectionEvent::DisconnectRequested) => Disconnecting,
            (Connecting | Connected | Disconnecting, ConnectionEvent::ProcessExited { .. }) => {
                Disconnected
            }
            _ => return None,
        };

        let from = self.state;
        self.state = to;
        Some(Transition { from, to })
    }
}
