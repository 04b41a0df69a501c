//! Observable connection state
//!
//! Platform-agnostic snapshot shared between the state machine, the runtime
//! shell and anything rendering status.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::events::ConnectionId;
use crate::ws_state::Phase;

/// Connection state exposed to consumers
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    /// True only between a successful open and the next close
    pub is_connected: bool,
    /// A send is in flight and no inbound message has arrived since
    pub is_sending_message: bool,
    pub connection_status: Phase,
    /// Last error description; cleared on every connect attempt and on open
    pub error_message: Option<String>,
    /// The single handle owned by the manager, if any
    pub active_connection: Option<ConnectionId>,
    pub last_connected_time: Option<DateTime<Utc>>,
}

impl ConnectionState {
    /// True when a handle is owned, whether or not it has opened yet
    pub fn has_active_connection(&self) -> bool {
        self.active_connection.is_some()
    }

    /// True when `send_message` would transmit
    pub fn can_send(&self) -> bool {
        self.is_connected && self.active_connection.is_some()
    }
}
