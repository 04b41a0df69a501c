//! Connection state machine
//!
//! A pure transition function from (state, input) to (state, effects). The
//! runtime shell owns transport handles, timers and the transcript; this
//! module only decides what should happen to them.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::data::ConnectionState;
use super::events::{
    ConnectionId, Effect, Input, Payload, Purpose, TimerId, TimerKind, TransportEvent,
};
use crate::ws_state::Phase;

/// Delay before reconnecting after any close
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Delay between the two halves of `reconnect()`
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Close code for a connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code for a failed TLS handshake
pub const CLOSE_TLS_HANDSHAKE: u16 = 1015;

pub const CONNECTION_ERROR: &str = "WebSocket connection error";

/// Delays used by the machine when scheduling timers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub retry_delay: Duration,
    pub restart_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Human-readable error for a close event, or `None` to keep the previous one
pub fn classify_close(code: u16, reason: &str) -> Option<String> {
    match code {
        CLOSE_ABNORMAL => Some(
            "Connection closed abnormally (code 1006). This may indicate a network issue or a CORS problem."
                .to_string(),
        ),
        CLOSE_TLS_HANDSHAKE => Some(
            "Secure handshake failed (code 1015). The TLS connection could not be established."
                .to_string(),
        ),
        _ if !reason.is_empty() => Some(format!("Connection closed: {reason}")),
        _ => None,
    }
}

/// State machine for one logical connection
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    timing: Timing,
    next_connection: u64,
    next_timer: u64,
    /// Payload replayed on every open of the current logical connection
    initial: Option<Value>,
    retry: Option<TimerId>,
    restart: Option<(TimerId, Option<Value>)>,
}

impl ConnectionMachine {
    pub fn new(timing: Timing) -> Self {
        Self {
            state: ConnectionState::default(),
            timing,
            next_connection: 0,
            next_timer: 0,
            initial: None,
            retry: None,
            restart: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Whether an automatic reconnect is scheduled
    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    pub fn initial_payload(&self) -> Option<&Value> {
        self.initial.as_ref()
    }

    /// Apply an input, stamping opens with the current wall-clock time
    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        self.apply_at(input, Utc::now())
    }

    /// Apply an input and return the effects to execute, in order
    pub fn apply_at(&mut self, input: Input, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();

        match input {
            Input::Connect { initial } => self.connect(initial, &mut effects),
            Input::Disconnect => self.disconnect(&mut effects),
            Input::Reconnect { initial } => self.reconnect(initial, &mut effects),
            Input::Send(payload) => self.send(payload, &mut effects),
            Input::Transport { id, event } => {
                if self.state.active_connection == Some(id) {
                    self.on_transport(id, event, now, &mut effects);
                } else {
                    trace!(%id, ?event, "Ignoring event from stale connection");
                }
            }
            Input::OpenFailed { id, detail } => {
                if self.state.active_connection == Some(id) {
                    error!(%id, error = %detail, "Failed to create connection");
                    self.state.active_connection = None;
                    self.state.is_connected = false;
                    self.state.connection_status = Phase::Error;
                    self.state.error_message = Some(format!("Failed to create connection: {detail}"));
                }
            }
            Input::SendFailed { id, detail } => {
                if self.state.active_connection == Some(id) {
                    error!(%id, error = %detail, "Failed to send message");
                    self.state.is_sending_message = false;
                    self.state.error_message = Some(format!("Failed to send message: {detail}"));
                }
            }
            Input::TimerFired(timer) => self.on_timer(timer, &mut effects),
        }

        effects
    }

    fn connect(&mut self, initial: Option<Value>, effects: &mut Vec<Effect>) {
        self.cancel_timers(effects);

        if let Some(old) = self.state.active_connection.take() {
            debug!(%old, "Closing existing connection first");
            effects.push(Effect::Close(old));
        }

        let id = self.allocate_connection();
        self.state.is_connected = false;
        self.state.error_message = None;
        self.state.connection_status = Phase::Connecting;
        self.state.active_connection = Some(id);
        self.initial = initial;

        info!(%id, has_initial = self.initial.is_some(), "Connecting");
        effects.push(Effect::Open(id));
    }

    fn disconnect(&mut self, effects: &mut Vec<Effect>) {
        // A pending retry would undo the disconnect
        self.cancel_timers(effects);

        if let Some(id) = self.state.active_connection.take() {
            info!(%id, "Disconnecting");
            effects.push(Effect::Close(id));
            self.state.is_connected = false;
            self.state.connection_status = Phase::Disconnected;
        }
    }

    fn reconnect(&mut self, initial: Option<Value>, effects: &mut Vec<Effect>) {
        self.disconnect(effects);

        let timer = self.allocate_timer(TimerKind::Restart);
        debug!(delay = ?self.timing.restart_delay, "Reconnect scheduled");
        self.restart = Some((timer, initial));
        effects.push(Effect::Schedule {
            timer,
            delay: self.timing.restart_delay,
        });
    }

    fn send(&mut self, payload: Payload, effects: &mut Vec<Effect>) {
        let id = match self.state.active_connection {
            Some(id) if self.state.is_connected => id,
            _ => {
                debug!(status = %self.state.connection_status, "Not connected, message dropped");
                return;
            }
        };

        self.state.is_sending_message = true;
        effects.push(Effect::Transmit {
            id,
            text: payload.to_text(),
            purpose: Purpose::User {
                echo: payload.is_text(),
            },
        });
    }

    fn on_transport(
        &mut self,
        id: ConnectionId,
        event: TransportEvent,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        match event {
            TransportEvent::Opened => {
                info!(%id, "Connected");
                self.state.is_connected = true;
                self.state.is_sending_message = false;
                self.state.connection_status = Phase::Connected;
                self.state.error_message = None;
                self.state.last_connected_time = Some(now);

                if let Some(initial) = &self.initial {
                    effects.push(Effect::Transmit {
                        id,
                        text: initial.to_string(),
                        purpose: Purpose::Initial,
                    });
                }
            }
            TransportEvent::Message(text) => {
                trace!(%id, len = text.len(), "Inbound message");
                self.state.is_sending_message = false;
                effects.push(Effect::Append {
                    content: text,
                    from_user: false,
                });
            }
            TransportEvent::Errored(detail) => {
                warn!(%id, error = %detail, "Connection error");
                self.state.connection_status = Phase::Error;
                self.state.error_message = Some(CONNECTION_ERROR.to_string());
            }
            TransportEvent::Closed { code, reason } => {
                warn!(%id, code, reason = %reason, "Connection closed");
                self.state.is_connected = false;
                self.state.connection_status = Phase::Disconnected;
                self.state.active_connection = None;

                if let Some(message) = classify_close(code, &reason) {
                    self.state.error_message = Some(message);
                }

                effects.push(Effect::Release(id));
                self.schedule_retry(effects);
            }
        }
    }

    fn on_timer(&mut self, timer: TimerId, effects: &mut Vec<Effect>) {
        if self.retry == Some(timer) {
            self.retry = None;
            if self.state.is_connected {
                debug!("Already connected, retry skipped");
                return;
            }
            info!("Retrying connection");
            let initial = self.initial.clone();
            self.connect(initial, effects);
        } else if matches!(&self.restart, Some((pending, _)) if *pending == timer) {
            let initial = self.restart.take().and_then(|(_, initial)| initial);
            self.connect(initial, effects);
        } else {
            trace!(?timer, "Ignoring stale timer");
        }
    }

    fn schedule_retry(&mut self, effects: &mut Vec<Effect>) {
        if let Some(old) = self.retry.take() {
            effects.push(Effect::Cancel(old));
        }

        let timer = self.allocate_timer(TimerKind::Retry);
        debug!(delay = ?self.timing.retry_delay, "Retry scheduled");
        self.retry = Some(timer);
        effects.push(Effect::Schedule {
            timer,
            delay: self.timing.retry_delay,
        });
    }

    fn cancel_timers(&mut self, effects: &mut Vec<Effect>) {
        if let Some(timer) = self.retry.take() {
            effects.push(Effect::Cancel(timer));
        }
        if let Some((timer, _)) = self.restart.take() {
            effects.push(Effect::Cancel(timer));
        }
    }

    fn allocate_connection(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    fn allocate_timer(&mut self, kind: TimerKind) -> TimerId {
        self.next_timer += 1;
        TimerId {
            kind,
            seq: self.next_timer,
        }
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(Timing::default())
    }
}
