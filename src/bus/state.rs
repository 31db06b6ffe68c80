//! Connection lifecycle states shared by both transports.

use parking_lot::RwLock;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Closing or closed: inbound messages must not be acted on.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable connection state. Transitions are logged and mirrored
/// into the health registry under the connection's name.
#[derive(Debug)]
pub struct ConnectionStateCell {
    name: String,
    state: RwLock<ConnectionState>,
}

impl ConnectionStateCell {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous == next {
            return;
        }
        tracing::info!(
            connection = %self.name,
            from = %previous,
            to = %next,
            "Connection state changed"
        );
        crate::health::mark_component_status(&self.name, next.as_str());
    }
}
