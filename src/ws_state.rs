//! Connection phase labels
//!
//! Shared by the state machine and anything rendering connection status.

use serde::Serialize;
use std::fmt;

/// Current phase of the managed WebSocket connection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// A transport error was reported; the close event usually follows
    Error,
}

impl Phase {
    /// Human-readable status label
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Disconnected => "Disconnected",
            Phase::Connecting => "Connecting...",
            Phase::Connected => "Connected",
            Phase::Error => "Connection error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Phase::Connected)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(Phase::default(), Phase::Disconnected);
        assert!(!Phase::default().is_connected());
    }

    #[test]
    fn test_display_uses_label() {
        assert_eq!(Phase::Connecting.to_string(), "Connecting...");
        assert_eq!(Phase::Connected.to_string(), "Connected");
    }

    #[test]
    fn test_serializes_lowercase() {
        let json = serde_json::to_string(&Phase::Error).unwrap();
        assert_eq!(json, r#""error""#);
    }
}
