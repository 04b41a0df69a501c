//! Inputs and effects of the connection state machine
//!
//! Transport callbacks, public operations and timer fires are all expressed as
//! [`Input`]s. The machine answers with [`Effect`]s that the runtime executes.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Identity of one transport handle
///
/// Every connect attempt gets a fresh id; events from any other id are stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which delayed action a timer drives
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Automatic reconnect after a close
    Retry,
    /// Second half of `reconnect()`
    Restart,
}

/// A scheduled timer. The sequence number tells a re-armed timer from a stale one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub seq: u64,
}

/// Event reported by the transport for one handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    /// One inbound frame; no framing beyond what the transport delivers
    Message(String),
    Errored(String),
    Closed { code: u16, reason: String },
}

/// Outbound payload
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Passed through verbatim and echoed to the transcript
    Text(String),
    /// Serialized to compact JSON, never echoed
    Json(Value),
}

impl Payload {
    /// Serialize any `Serialize` value as a structured payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Payload::Json)
    }

    /// Wire text for this payload
    pub fn to_text(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Json(value) => value.to_string(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Payload::Text(_))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Everything that can drive the state machine
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Connect { initial: Option<Value> },
    Disconnect,
    Reconnect { initial: Option<Value> },
    Send(Payload),
    Transport { id: ConnectionId, event: TransportEvent },
    /// The transport could not even start opening
    OpenFailed { id: ConnectionId, detail: String },
    /// A user send was rejected by the transport
    SendFailed { id: ConnectionId, detail: String },
    TimerFired(TimerId),
}

/// Why a frame is transmitted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
    /// Initial payload sent right after open; failures are only logged
    Initial,
    /// `send_message`; `echo` appends the text to the transcript on success
    User { echo: bool },
}

/// Side effect requested by the state machine
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Open(ConnectionId),
    /// Request a transport close and drop the handle
    Close(ConnectionId),
    /// Drop a handle the transport already closed
    Release(ConnectionId),
    Transmit { id: ConnectionId, text: String, purpose: Purpose },
    Append { content: String, from_user: bool },
    Schedule { timer: TimerId, delay: Duration },
    Cancel(TimerId),
}
