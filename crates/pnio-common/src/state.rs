//! Connection state table for a single field device.
//!
//! Lifecycle:
//! OFFLINE → CONNECTING → DISCOVERY → RUNNING
//!
//! Failures while connecting or running land in ERROR; the only way out
//! of ERROR is an explicit reconnect or disconnect.

use crate::error::{PnioError, PnioResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection states for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No session; initial state.
    #[default]
    Offline,
    /// Connect request and handshake in flight.
    Connecting,
    /// Session established, cyclic exchange not yet running.
    Discovery,
    /// Cyclic exchange active.
    Running,
    /// Connect or communication failure recorded.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "OFFLINE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Discovery => write!(f, "DISCOVERY"),
            Self::Running => write!(f, "RUNNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl ConnectionState {
    /// All states, in lifecycle order.
    pub const ALL: [ConnectionState; 5] = [
        Self::Offline,
        Self::Connecting,
        Self::Discovery,
        Self::Running,
        Self::Error,
    ];

    /// Whether a device in this state may be removed.
    #[must_use]
    pub fn can_delete(&self) -> bool {
        matches!(self, Self::Offline | Self::Error)
    }

    /// Whether cyclic exchange is expected to be active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Transitions accepted by the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Begin a connection attempt.
    Connect,
    /// The connect exchange and handshake succeeded.
    SessionEstablished,
    /// Cyclic exchange started.
    DiscoveryComplete,
    /// Orderly shutdown of a running or failed device.
    Disconnect,
    /// The connection attempt failed.
    ConnectFailed,
    /// Communication with a running device failed.
    CommFailure,
    /// Abandon an attempt before cyclic exchange started.
    Abort,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::SessionEstablished => write!(f, "session_established"),
            Self::DiscoveryComplete => write!(f, "discovery_complete"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::CommFailure => write!(f, "comm_failure"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

impl ConnectionEvent {
    /// All events.
    pub const ALL: [ConnectionEvent; 7] = [
        Self::Connect,
        Self::SessionEstablished,
        Self::DiscoveryComplete,
        Self::Disconnect,
        Self::ConnectFailed,
        Self::CommFailure,
        Self::Abort,
    ];

    /// Target state when this event is applied in `from`, or `None` if the
    /// event is not defined there.
    #[must_use]
    pub fn target(&self, from: ConnectionState) -> Option<ConnectionState> {
        use ConnectionState::{Connecting, Discovery, Error, Offline, Running};

        match (self, from) {
            (Self::Connect, Offline | Error) => Some(Connecting),
            (Self::SessionEstablished, Connecting) => Some(Discovery),
            (Self::DiscoveryComplete, Discovery) => Some(Running),
            (Self::Disconnect, Running | Error) => Some(Offline),
            (Self::ConnectFailed, Connecting) => Some(Error),
            (Self::CommFailure, Running) => Some(Error),
            (Self::Abort, Connecting | Discovery) => Some(Offline),
            _ => None,
        }
    }

    /// Resolve the target state, returning `InvalidTransition` if undefined.
    pub fn apply(&self, from: ConnectionState) -> PnioResult<ConnectionState> {
        self.target(from).ok_or_else(|| PnioError::InvalidTransition {
            event: self.to_string(),
            from: from.to_string(),
        })
    }
}
