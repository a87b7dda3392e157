//! Connection State Machine
//!
//! Defines the link states a single connection moves through and which
//! transitions between them are legal.

use std::fmt;

/// Why a link ended up disconnected
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// No link has been requested yet
    NeverConnected,
    /// Teardown was requested locally
    LocalRequest,
    /// The remote device closed the link
    PeerTerminated,
    /// Supervision timeout or radio link loss
    LinkLoss,
    /// Link establishment was rejected or failed
    ConnectFailed,
    /// The platform did not say
    Unknown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::NeverConnected => write!(f, "never connected"),
            DisconnectReason::LocalRequest => write!(f, "local request"),
            DisconnectReason::PeerTerminated => write!(f, "terminated by peer"),
            DisconnectReason::LinkLoss => write!(f, "link loss"),
            DisconnectReason::ConnectFailed => write!(f, "connection failed"),
            DisconnectReason::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// State of the link to one remote device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    /// Initial state of every connection
    pub fn initial() -> Self {
        ConnectionState::Disconnected(DisconnectReason::NeverConnected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
        }
    }
}

/// Result of feeding an observed state into the machine
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// State changed along a legal edge
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Same state observed again
    Unchanged(ConnectionState),
    /// Edge is not part of the lifecycle; the state is still applied
    Invalid {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Tracks the current state of one connection.
///
/// The platform is authoritative about the link, so an illegal edge is
/// reported but never refused.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    current: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            current: ConnectionState::initial(),
        }
    }

    /// Get current state
    pub fn state(&self) -> &ConnectionState {
        &self.current
    }

    /// Apply an observed state and report what kind of edge it was
    pub fn process(&mut self, next: ConnectionState) -> TransitionResult {
        if next == self.current {
            return TransitionResult::Unchanged(next);
        }

        let from = std::mem::replace(&mut self.current, next.clone());
        if is_valid_transition(&from, &next) {
            TransitionResult::Changed { from, to: next }
        } else {
            TransitionResult::Invalid { from, to: next }
        }
    }
}

/// Check if a transition from one state to another is part of the lifecycle
pub fn is_valid_transition(from: &ConnectionState, to: &ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        // Repeats are harmless; state sources may re-announce
        (a, b) if a == b => true,

        // Idle -> Connecting
        (Disconnected(_), Connecting) => true,

        // Platform auto-connect can skip the explicit Connecting step
        (Disconnected(_), Connected) => true,

        (Connecting, Connected) => true,
        (Connecting, Disconnecting) => true,
        (Connecting, Disconnected(_)) => true,

        (Connected, Disconnecting) => true,
        // Switching devices releases the old link without a teardown step
        (Connected, Connecting) => true,
        // Peer-initiated exit path
        (Connected, Disconnected(_)) => true,

        (Disconnecting, Disconnected(_)) => true,

        // Reason refinement while already down
        (Disconnected(_), Disconnected(_)) => true,

        _ => false,
    }
}
