use std::collections::HashMap;

use serde::Deserialize;

/// Top-level configuration settings for the broker.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub auth: AuthSettings,
    pub persistence: PersistenceSettings,
    pub log: LogSettings,
}

/// Listener addresses.
///
/// The WebSocket listener is only started when `websocket_port` is set.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub websocket_port: Option<u16>,
}

/// Delivery and session policy.
///
/// A limit of 0 for `max_inflight_messages` or `max_queued_messages` means
/// unlimited. `max_retries` of `None` retries until the session goes away.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub retry_interval_ms: u64,
    pub max_retries: Option<u32>,
    pub max_inflight_messages: usize,
    pub max_queued_messages: usize,
    pub queue_qos0_messages: bool,
    pub allow_zero_length_clientid: bool,
    pub auto_id_prefix: String,
    pub session_expiry_secs: Option<u64>,
    /// Keepalive, in seconds, applied to a connection until its CONNECT is
    /// accepted. 0 disables the limit.
    pub connect_keep_alive: u16,
}

/// Credentials accepted on CONNECT.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub allow_anonymous: bool,
    /// username -> password
    pub users: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub auth: Option<PartialAuthSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub websocket_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub retry_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub max_inflight_messages: Option<usize>,
    pub max_queued_messages: Option<usize>,
    pub queue_qos0_messages: Option<bool>,
    pub allow_zero_length_clientid: Option<bool>,
    pub auto_id_prefix: Option<String>,
    pub session_expiry_secs: Option<u64>,
    pub connect_keep_alive: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialAuthSettings {
    pub allow_anonymous: Option<bool>,
    pub users: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPersistenceSettings {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            websocket_port: None,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            retry_interval_ms: 5000,
            max_retries: None,
            max_inflight_messages: 20,
            max_queued_messages: 100,
            queue_qos0_messages: false,
            allow_zero_length_clientid: true,
            auto_id_prefix: "auto-".to_string(),
            session_expiry_secs: None,
            connect_keep_alive: 60,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            users: HashMap::new(),
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "mqbroker_db".to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl PartialSettings {
    /// Merges the loaded values over the defaults, field by field.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server;
        let broker = self.broker;
        let auth = self.auth;
        let persistence = self.persistence;
        let log = self.log;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(default.server.host),
                port: server
                    .as_ref()
                    .and_then(|s| s.port)
                    .unwrap_or(default.server.port),
                websocket_port: server
                    .as_ref()
                    .and_then(|s| s.websocket_port)
                    .or(default.server.websocket_port),
            },
            broker: BrokerSettings {
                retry_interval_ms: broker
                    .as_ref()
                    .and_then(|b| b.retry_interval_ms)
                    .unwrap_or(default.broker.retry_interval_ms),
                max_retries: broker
                    .as_ref()
                    .and_then(|b| b.max_retries)
                    .or(default.broker.max_retries),
                max_inflight_messages: broker
                    .as_ref()
                    .and_then(|b| b.max_inflight_messages)
                    .unwrap_or(default.broker.max_inflight_messages),
                max_queued_messages: broker
                    .as_ref()
                    .and_then(|b| b.max_queued_messages)
                    .unwrap_or(default.broker.max_queued_messages),
                queue_qos0_messages: broker
                    .as_ref()
                    .and_then(|b| b.queue_qos0_messages)
                    .unwrap_or(default.broker.queue_qos0_messages),
                allow_zero_length_clientid: broker
                    .as_ref()
                    .and_then(|b| b.allow_zero_length_clientid)
                    .unwrap_or(default.broker.allow_zero_length_clientid),
                auto_id_prefix: broker
                    .as_ref()
                    .and_then(|b| b.auto_id_prefix.clone())
                    .unwrap_or(default.broker.auto_id_prefix),
                session_expiry_secs: broker
                    .as_ref()
                    .and_then(|b| b.session_expiry_secs)
                    .or(default.broker.session_expiry_secs),
                connect_keep_alive: broker
                    .as_ref()
                    .and_then(|b| b.connect_keep_alive)
                    .unwrap_or(default.broker.connect_keep_alive),
            },
            auth: AuthSettings {
                allow_anonymous: auth
                    .as_ref()
                    .and_then(|a| a.allow_anonymous)
                    .unwrap_or(default.auth.allow_anonymous),
                users: auth
                    .and_then(|a| a.users)
                    .unwrap_or(default.auth.users),
            },
            persistence: PersistenceSettings {
                enabled: persistence
                    .as_ref()
                    .and_then(|p| p.enabled)
                    .unwrap_or(default.persistence.enabled),
                path: persistence
                    .and_then(|p| p.path)
                    .unwrap_or(default.persistence.path),
            },
            log: LogSettings {
                level: log
                    .and_then(|l| l.level)
                    .unwrap_or(default.log.level),
            },
        }
    }
}
