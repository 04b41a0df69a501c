//! Native WebSocket transport
//!
//! Uses tokio-tungstenite in a background task per connection. Outbound frames
//! go through a channel; inbound frames and lifecycle changes are reported
//! through the connection's [`EventSink`].

use futures_util::{SinkExt, StreamExt};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::UrlError;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::core::machine::{CLOSE_ABNORMAL, CLOSE_TLS_HANDSHAKE};
use crate::core::TransportEvent;
use crate::transport::{EventSink, Transport, TransportError, TransportHandle};

/// Close code reported when the peer sent a close frame without a body
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_NORMAL: u16 = 1000;
/// How long to wait for our close reply to reach the server
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static CRYPTO_PROVIDER: Once = Once::new();

/// Select ring as the process-wide rustls provider unless one is already set
fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider().install_default().is_err() {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Opens connections with tokio-tungstenite on the current runtime
///
/// `wss://` URLs use rustls with the webpki root store.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn open(&self, url: &str, events: EventSink) -> Result<Box<dyn TransportHandle>, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::Open(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Open(e.to_string()))?;
        install_crypto_provider();

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_connection(request, rx, events));

        Ok(Box::new(TungsteniteHandle { tx }))
    }
}

enum Outgoing {
    Text(String),
    Close,
}

/// Handle to one background connection task
///
/// Dropping the handle closes the connection.
pub struct TungsteniteHandle {
    tx: UnboundedSender<Outgoing>,
}

impl TransportHandle for TungsteniteHandle {
    fn send(&self, text: &str) -> Result<(), TransportError> {
        self.tx
            .send(Outgoing::Text(text.to_string()))
            .map_err(|_| TransportError::Send("connection is closed".to_string()))
    }

    fn close(&self) {
        // Task already gone means the connection is closed anyway
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// Close code to report for a failed handshake
fn handshake_close_code(error: &WsError) -> u16 {
    match error {
        WsError::Tls(_) | WsError::Url(UrlError::TlsFeatureNotEnabled) => CLOSE_TLS_HANDSHAKE,
        _ => CLOSE_ABNORMAL,
    }
}

fn closed(code: u16, reason: impl Into<String>) -> TransportEvent {
    TransportEvent::Closed {
        code,
        reason: reason.into(),
    }
}

async fn run_connection(
    request: Request,
    mut outgoing: UnboundedReceiver<Outgoing>,
    events: EventSink,
) {
    let id = events.id();
    info!(%id, uri = %request.uri(), "Connecting to WebSocket");

    let handshake = tokio::select! {
        result = connect_async(request) => result,
        _ = async { while let Some(Outgoing::Text(_)) = outgoing.recv().await {} } => {
            debug!(%id, "Closed before the handshake completed");
            events.emit(closed(CLOSE_NORMAL, ""));
            return;
        }
    };

    let ws_stream = match handshake {
        Ok((stream, _)) => {
            info!(%id, "WebSocket connected");
            events.emit(TransportEvent::Opened);
            stream
        }
        Err(e) => {
            error!(%id, error = %e, "Failed to connect");
            let code = handshake_close_code(&e);
            events.emit(TransportEvent::Errored(e.to_string()));
            events.emit(closed(code, ""));
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        error!(%id, error = %e, "Failed to write frame");
                        events.emit(TransportEvent::Errored(e.to_string()));
                        events.emit(closed(CLOSE_ABNORMAL, ""));
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    debug!(%id, "Closing WebSocket");
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(%id, error = %e, "Close frame not delivered");
                    }
                    events.emit(closed(CLOSE_NORMAL, ""));
                    return;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    events.emit(TransportEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    events.emit(TransportEvent::Message(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    warn!(%id, code, reason = %reason, "WebSocket closed by server");
                    // tungstenite queued the close reply; flush it before dropping the socket
                    match tokio::time::timeout(CLOSE_TIMEOUT, write.close()).await {
                        Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) => {}
                        Ok(Err(e)) => debug!(%id, error = %e, "Close reply not flushed"),
                        Err(_) => debug!(%id, "Timed out flushing close reply"),
                    }
                    events.emit(closed(code, reason));
                    return;
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(%id, error = %e, "WebSocket error");
                    events.emit(TransportEvent::Errored(e.to_string()));
                    events.emit(closed(CLOSE_ABNORMAL, ""));
                    return;
                }
                None => {
                    warn!(%id, "WebSocket stream ended");
                    events.emit(closed(CLOSE_ABNORMAL, ""));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, ManagerConfig};
    use crate::transcript::MemoryTranscript;
    use crate::ws_state::Phase;
    use crate::{ConnectionManager, ConnectionState, SendOutcome};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::{oneshot, watch};
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Loopback server that echoes text frames
    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });

        format!("ws://{addr}")
    }

    /// Loopback server that closes with `reason` and reports whether the
    /// client completed the closing handshake
    async fn spawn_closing_server(reason: &'static str) -> (String, oneshot::Receiver<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let frame = CloseFrame {
                code: CloseCode::Away,
                reason: reason.into(),
            };
            ws.close(Some(frame)).await.unwrap();

            let mut clean = true;
            while let Some(msg) = ws.next().await {
                if msg.is_err() {
                    clean = false;
                    break;
                }
            }
            let _ = done_tx.send(clean);
        });

        (format!("ws://{addr}"), done_rx)
    }

    fn manager(url: String) -> (ConnectionManager, Arc<MemoryTranscript>) {
        let transcript = Arc::new(MemoryTranscript::new());
        let manager = ConnectionManager::new(
            ManagerConfig::new(Endpoint::production(url)),
            Arc::new(TungsteniteTransport),
            transcript.clone(),
        )
        .unwrap();
        (manager, transcript)
    }

    async fn wait_for(
        states: &mut watch::Receiver<ConnectionState>,
        predicate: impl Fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        timeout(TIMEOUT, async {
            loop {
                {
                    let state = states.borrow_and_update();
                    if predicate(&state) {
                        return state.clone();
                    }
                }
                states.changed().await.unwrap();
            }
        })
        .await
        .expect("state not reached in time")
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let url = spawn_server().await;
        let (manager, transcript) = manager(url);
        let mut states = manager.subscribe();

        manager.connect(None);
        wait_for(&mut states, |s| s.is_connected).await;

        assert_eq!(manager.send_message("ping"), SendOutcome::Sent);
        wait_for(&mut states, |s| !s.is_sending_message).await;

        let entries = transcript.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].content.as_str(), entries[0].from_user), ("ping", true));
        assert_eq!((entries[1].content.as_str(), entries[1].from_user), ("ping", false));
    }

    #[tokio::test]
    async fn test_initial_payload_reaches_server() {
        let url = spawn_server().await;
        let (manager, transcript) = manager(url);
        let mut states = manager.subscribe();

        manager.connect(Some(serde_json::json!({"foo": "bar"})));
        wait_for(&mut states, |s| s.is_connected).await;

        // The echo of the initial payload is the first inbound message
        timeout(TIMEOUT, async {
            while transcript.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(transcript.entries()[0].content, r#"{"foo":"bar"}"#);
    }

    #[tokio::test]
    async fn test_server_close_reason_recorded() {
        let (url, _) = spawn_closing_server("maintenance").await;
        let (manager, _) = manager(url);
        let mut states = manager.subscribe();

        manager.connect(None);
        let state = wait_for(&mut states, |s| {
            s.connection_status == Phase::Disconnected && s.error_message.is_some()
        })
        .await;

        assert!(!state.is_connected);
        assert!(state.active_connection.is_none());
        assert_eq!(state.error_message.as_deref(), Some("Connection closed: maintenance"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_abnormal() {
        // Reserve a port, then free it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (manager, _) = manager(format!("ws://{addr}"));
        let mut states = manager.subscribe();

        manager.connect(None);
        let state = wait_for(&mut states, |s| {
            s.connection_status == Phase::Disconnected && s.error_message.is_some()
        })
        .await;

        assert!(state.error_message.unwrap().contains("abnormal"));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_to_open() {
        let (manager, _) = manager("not a url".to_string());

        manager.connect(None);
        let state = manager.state();
        assert_eq!(state.connection_status, Phase::Error);
        assert!(state
            .error_message
            .unwrap()
            .starts_with("Failed to create connection:"));
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket() {
        let url = spawn_server().await;
        let (manager, _) = manager(url);
        let mut states = manager.subscribe();

        manager.connect(None);
        wait_for(&mut states, |s| s.is_connected).await;

        manager.disconnect();
        let state = manager.state();
        assert!(!state.is_connected);
        assert_eq!(state.connection_status, Phase::Disconnected);
        assert_eq!(manager.send_message("late"), SendOutcome::NotConnected);
    }

    #[tokio::test]
    async fn test_server_close_is_acknowledged() {
        let (url, clean) = spawn_closing_server("bye").await;
        let (manager, _) = manager(url);
        let mut states = manager.subscribe();

        manager.connect(None);
        wait_for(&mut states, |s| s.error_message.is_some()).await;

        let clean = timeout(TIMEOUT, clean).await.unwrap().unwrap();
        assert!(clean, "server saw the socket drop without a close reply");
    }

    #[tokio::test]
    async fn test_secure_url_starts_tls_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (first_tx, first_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = first_tx.send(stream.read_u8().await.ok());
        });

        let (manager, _) = manager(format!("wss://{addr}/ws"));
        let mut states = manager.subscribe();
        manager.connect(None);

        // 0x16 is the TLS handshake record type that opens a ClientHello
        let first = timeout(TIMEOUT, first_rx).await.unwrap().unwrap();
        assert_eq!(first, Some(0x16));

        let state = wait_for(&mut states, |s| {
            s.connection_status == Phase::Disconnected && s.error_message.is_some()
        })
        .await;
        assert!(!state.is_connected);
    }
}
