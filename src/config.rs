//! Endpoint and timing configuration
//!
//! Resolved once by the embedder and handed to the manager; the core never
//! inspects the environment itself.

use std::time::Duration;
use thiserror::Error;

use crate::core::machine::{Timing, DEFAULT_RESTART_DELAY, DEFAULT_RETRY_DELAY};

/// Default WebSocket URL for the chat endpoint
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws/chat";
/// Path the development server proxies to the chat endpoint
pub const DEFAULT_PROXY_PATH: &str = "/ws/chat";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported origin {0:?}, expected http:// or https://")]
    UnsupportedOrigin(String),
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

/// Where the manager connects to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Same-origin proxy in front of the chat endpoint
    Development { origin: String, proxy_path: String },
    /// Fixed endpoint URL
    Production { url: String },
}

impl Endpoint {
    pub fn production(url: impl Into<String>) -> Self {
        Endpoint::Production { url: url.into() }
    }

    /// Proxy endpoint under `origin` using [`DEFAULT_PROXY_PATH`]
    pub fn development(origin: impl Into<String>) -> Self {
        Endpoint::Development {
            origin: origin.into(),
            proxy_path: DEFAULT_PROXY_PATH.to_string(),
        }
    }

    /// Resolve the WebSocket URL
    ///
    /// A development origin `http://host` maps to `ws://host/<proxy_path>` and
    /// `https://host` to `wss://host/<proxy_path>`.
    pub fn url(&self) -> Result<String, ConfigError> {
        match self {
            Endpoint::Production { url } => Ok(url.clone()),
            Endpoint::Development { origin, proxy_path } => {
                let trimmed = origin.trim_end_matches('/');
                let (scheme, host) = if let Some(host) = trimmed.strip_prefix("https://") {
                    ("wss", host)
                } else if let Some(host) = trimmed.strip_prefix("http://") {
                    ("ws", host)
                } else {
                    return Err(ConfigError::UnsupportedOrigin(origin.clone()));
                };
                if host.is_empty() {
                    return Err(ConfigError::UnsupportedOrigin(origin.clone()));
                }

                let path = proxy_path.trim_start_matches('/');
                Ok(format!("{scheme}://{host}/{path}"))
            }
        }
    }
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    pub endpoint: Endpoint,
    /// Delay before reconnecting after a close
    pub retry_delay: Duration,
    /// Delay between disconnect and connect in `reconnect()`
    pub restart_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::production(DEFAULT_WS_URL),
            retry_delay: DEFAULT_RETRY_DELAY,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl ManagerConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn timing(&self) -> Timing {
        Timing {
            retry_delay: self.retry_delay,
            restart_delay: self.restart_delay,
        }
    }

    /// Read configuration from the process environment
    ///
    /// - `CHAT_WS_ORIGIN`: page origin; selects the development proxy endpoint
    /// - `CHAT_WS_PROXY_PATH`: proxy path under the origin
    /// - `CHAT_WS_URL`: fixed endpoint URL when no origin is set
    /// - `CHAT_WS_RETRY_SECS`: reconnect delay after a close
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let endpoint = match lookup("CHAT_WS_ORIGIN") {
            Some(origin) => Endpoint::Development {
                origin,
                proxy_path: lookup("CHAT_WS_PROXY_PATH")
                    .unwrap_or_else(|| DEFAULT_PROXY_PATH.to_string()),
            },
            None => Endpoint::production(
                lookup("CHAT_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            ),
        };
        // Fail at startup rather than on the first connect
        endpoint.url()?;

        let retry_delay = match lookup("CHAT_WS_RETRY_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidValue {
                    name: "CHAT_WS_RETRY_SECS",
                    value: raw,
                })?,
            None => DEFAULT_RETRY_DELAY,
        };

        Ok(Self {
            endpoint,
            retry_delay,
            restart_delay: DEFAULT_RESTART_DELAY,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_development_endpoint_from_origin() {
        let endpoint = Endpoint::development("http://localhost:3000");
        assert_eq!(endpoint.url().unwrap(), "ws://localhost:3000/ws/chat");

        let endpoint = Endpoint::Development {
            origin: "https://console.internal/".into(),
            proxy_path: "api/chat".into(),
        };
        assert_eq!(endpoint.url().unwrap(), "wss://console.internal/api/chat");
    }

    #[test]
    fn test_development_rejects_other_schemes() {
        let endpoint = Endpoint::development("file:///tmp/index.html");
        assert!(matches!(endpoint.url(), Err(ConfigError::UnsupportedOrigin(_))));

        let endpoint = Endpoint::development("http://");
        assert!(endpoint.url().is_err());
    }

    #[test]
    fn test_production_endpoint_is_literal() {
        let endpoint = Endpoint::production("wss://chat.example.org/socket");
        assert_eq!(endpoint.url().unwrap(), "wss://chat.example.org/socket");
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.timing().retry_delay, Duration::from_secs(30));
        assert_eq!(config.timing().restart_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_origin_takes_precedence() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("CHAT_WS_ORIGIN", "http://localhost:5173"),
            ("CHAT_WS_PROXY_PATH", "/proxy/ws"),
            ("CHAT_WS_URL", "ws://ignored"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint.url().unwrap(), "ws://localhost:5173/proxy/ws");
    }

    #[test]
    fn test_retry_delay_parsed() {
        let config = ManagerConfig::from_lookup(lookup(&[("CHAT_WS_RETRY_SECS", "5")])).unwrap();
        assert_eq!(config.retry_delay, Duration::from_secs(5));

        let err = ManagerConfig::from_lookup(lookup(&[("CHAT_WS_RETRY_SECS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "CHAT_WS_RETRY_SECS",
                value: "soon".into(),
            }
        );
    }

    #[test]
    fn test_bad_origin_fails_early() {
        let err = ManagerConfig::from_lookup(lookup(&[("CHAT_WS_ORIGIN", "localhost")])).unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedOrigin("localhost".into()));
    }
}
