//! Platform-agnostic core - the connection state machine and its data

pub mod data;
pub mod events;
pub mod machine;

pub use data::ConnectionState;
pub use events::{
    ConnectionId, Effect, Input, Payload, Purpose, TimerId, TimerKind, TransportEvent,
};
pub use machine::{classify_close, ConnectionMachine, Timing};
