//! Transcript of chat messages seen on the connection
//!
//! The manager only ever appends; reading and persistence belong to the owner.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Append-only sink for inbound and outbound chat messages
///
/// `append` is called after the manager releases its state lock, so an
/// implementation may query or drive the manager from inside it.
pub trait Transcript: Send + Sync {
    fn append(&self, content: &str, from_user: bool);
}

/// One transcript entry
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatMessage {
    pub content: String,
    pub from_user: bool,
    pub at: DateTime<Utc>,
}

/// In-memory transcript, oldest entry first
#[derive(Debug, Default)]
pub struct MemoryTranscript {
    entries: Mutex<Vec<ChatMessage>>,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all entries in arrival order
    pub fn entries(&self) -> Vec<ChatMessage> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Transcript for MemoryTranscript {
    fn append(&self, content: &str, from_user: bool) {
        self.entries.lock().push(ChatMessage {
            content: content.to_string(),
            from_user,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_in_order() {
        let transcript = MemoryTranscript::new();
        assert!(transcript.is_empty());

        transcript.append("hi", true);
        transcript.append("hello", false);

        let entries = transcript.entries();
        assert_eq!(transcript.len(), 2);
        assert_eq!(entries[0].content, "hi");
        assert!(entries[0].from_user);
        assert_eq!(entries[1].content, "hello");
        assert!(!entries[1].from_user);
    }
}
