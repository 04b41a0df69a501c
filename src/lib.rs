//! chat-link - managed WebSocket connection to a chat endpoint
//!
//! Owns a single connection at a time, classifies failures, reconnects after a
//! fixed delay and exposes connect / disconnect / reconnect / send plus an
//! observable [`ConnectionState`].
//!
//! - `core`: platform-agnostic state machine, no runtime required
//! - [`ConnectionManager`]: tokio shell driving the machine (feature `native`)
//! - [`TungsteniteTransport`]: tokio-tungstenite transport (feature `native`)

pub mod config;
pub mod core;
pub mod transcript;
pub mod ws_state;

#[cfg(feature = "native")]
pub mod manager;
#[cfg(feature = "native")]
pub mod transport;
#[cfg(feature = "native")]
pub mod websocket_native;

pub use crate::config::{ConfigError, Endpoint, ManagerConfig};
pub use crate::core::{ConnectionId, ConnectionMachine, ConnectionState, Payload, TransportEvent};
pub use crate::transcript::{ChatMessage, MemoryTranscript, Transcript};
pub use crate::ws_state::Phase;

#[cfg(feature = "native")]
pub use crate::manager::{ConnectionManager, ManagerError, SendOutcome};
#[cfg(feature = "native")]
pub use crate::transport::{EventSink, Transport, TransportError, TransportHandle};
#[cfg(feature = "native")]
pub use crate::websocket_native::TungsteniteTransport;
