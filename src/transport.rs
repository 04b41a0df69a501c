//! Transport seam between the manager and a concrete WebSocket client

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::core::{ConnectionId, Input, TransportEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{0}")]
    Open(String),
    #[error("{0}")]
    Send(String),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Opens transport handles
///
/// `open` must not block: the outcome of the handshake is reported through
/// `events` as `Opened`, or `Errored` followed by `Closed`.
pub trait Transport: Send + Sync {
    fn open(&self, url: &str, events: EventSink) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// A live (or opening) connection
pub trait TransportHandle: Send + Sync {
    fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Request a close; the transport reports `Closed` when done
    fn close(&self);
}

/// Delivers events for one connection to the manager
#[derive(Clone, Debug)]
pub struct EventSink {
    id: ConnectionId,
    tx: UnboundedSender<Input>,
}

impl EventSink {
    pub(crate) fn new(id: ConnectionId, tx: UnboundedSender<Input>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn emit(&self, event: TransportEvent) {
        if self
            .tx
            .send(Input::Transport { id: self.id, event })
            .is_err()
        {
            // Manager dropped
            trace!(id = %self.id, "Event dropped, manager gone");
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Shared view of one opened connection
    #[derive(Default)]
    pub struct MockLink {
        pub sent: Mutex<Vec<String>>,
        pub closed: AtomicBool,
        pub fail_send: Mutex<Option<String>>,
    }

    impl MockLink {
        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    pub struct MockConnection {
        pub url: String,
        pub sink: EventSink,
        pub link: Arc<MockLink>,
    }

    struct MockHandle(Arc<MockLink>);

    impl TransportHandle for MockHandle {
        fn send(&self, text: &str) -> Result<(), TransportError> {
            if let Some(detail) = self.0.fail_send.lock().clone() {
                return Err(TransportError::Send(detail));
            }
            self.0.sent.lock().push(text.to_string());
            Ok(())
        }

        fn close(&self) {
            self.0.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Records every open; tests drive events through the recorded sinks
    #[derive(Default)]
    pub struct MockTransport {
        pub opened: Mutex<Vec<MockConnection>>,
        pub fail_open: Mutex<Option<String>>,
    }

    impl MockTransport {
        pub fn open_count(&self) -> usize {
            self.opened.lock().len()
        }

        pub fn sink(&self, index: usize) -> EventSink {
            self.opened.lock()[index].sink.clone()
        }

        pub fn link(&self, index: usize) -> Arc<MockLink> {
            self.opened.lock()[index].link.clone()
        }

        pub fn url(&self, index: usize) -> String {
            self.opened.lock()[index].url.clone()
        }
    }

    impl Transport for MockTransport {
        fn open(
            &self,
            url: &str,
            events: EventSink,
        ) -> Result<Box<dyn TransportHandle>, TransportError> {
            if let Some(detail) = self.fail_open.lock().clone() {
                return Err(TransportError::Open(detail));
            }
            let link = Arc::new(MockLink::default());
            self.opened.lock().push(MockConnection {
                url: url.to_string(),
                sink: events,
                link: link.clone(),
            });
            Ok(Box::new(MockHandle(link)))
        }
    }
}
