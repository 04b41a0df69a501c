//! Interactive console client for a chat WebSocket endpoint
//!
//! Run with: cargo run --bin chat-cli --features cli
//!
//! Each stdin line is sent as a text message. Commands:
//! `/json <value>`, `/connect`, `/disconnect`, `/reconnect`, `/status`, `/quit`.

use chat_link::{
    ConnectionManager, ManagerConfig, SendOutcome, Transcript, TungsteniteTransport,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Prints inbound messages; outbound ones are already on screen
struct ConsoleTranscript;

impl Transcript for ConsoleTranscript {
    fn append(&self, content: &str, from_user: bool) {
        if !from_user {
            println!("<< {content}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chat_link=debug"));
    fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();

    let config = ManagerConfig::from_env()?;
    let initial: Option<Value> = std::env::var("CHAT_WS_INIT")
        .ok()
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    info!(endpoint = ?config.endpoint, retry = ?config.retry_delay, "Starting chat client");

    let manager = ConnectionManager::new(
        config,
        Arc::new(TungsteniteTransport),
        Arc::new(ConsoleTranscript),
    )?;
    let mut states = manager.subscribe();
    manager.connect(initial.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!(
                    status = %state.connection_status,
                    connected = state.is_connected,
                    error = ?state.error_message,
                    "Connection state"
                );
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();

                match line {
                    "" => {}
                    "/quit" => break,
                    "/connect" => manager.connect(initial.clone()),
                    "/disconnect" => manager.disconnect(),
                    "/reconnect" => manager.reconnect(initial.clone()),
                    "/status" => {
                        let state = manager.state();
                        println!("{}", serde_json::to_string_pretty(&state)?);
                    }
                    _ => {
                        let outcome = match line.strip_prefix("/json ") {
                            Some(raw) => match serde_json::from_str::<Value>(raw) {
                                Ok(value) => manager.send_message(value),
                                Err(e) => {
                                    warn!(error = %e, "Invalid JSON");
                                    continue;
                                }
                            },
                            None => manager.send_message(line),
                        };
                        if outcome != SendOutcome::Sent {
                            warn!(?outcome, error = ?manager.error_message(), "Message not sent");
                        }
                    }
                }
            }
        }
    }

    manager.disconnect();
    Ok(())
}
