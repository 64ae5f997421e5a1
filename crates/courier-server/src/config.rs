//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database.
    /// Env: `DATABASE_PATH`
    /// Default: `./courier.db`
    pub database_path: PathBuf,

    /// Identifier for this service instance on the cross-instance bus.
    /// Env: `INSTANCE_ID`
    /// Default: a fresh UUID per process.
    pub instance_id: String,

    /// How long a presence record stays fresh without a heartbeat.
    /// Env: `PRESENCE_TTL_SECS`
    /// Default: `90`
    pub presence_ttl: Duration,

    /// How long a typing indicator lives without a refresh.
    /// Env: `TYPING_TTL_SECS`
    /// Default: `5`
    pub typing_ttl: Duration,

    /// Interval between server-initiated heartbeat frames.
    /// Env: `HEARTBEAT_INTERVAL_SECS`
    /// Default: `30`
    pub heartbeat_interval: Duration,

    /// Connections silent beyond this are forcibly unregistered.
    /// Env: `CONNECTION_TIMEOUT_SECS`
    /// Default: `90`
    pub connection_timeout: Duration,

    /// Maximum queued events per offline user; oldest are evicted first.
    /// Env: `OFFLINE_QUEUE_CAP`
    /// Default: `100`
    pub offline_queue_cap: usize,

    /// Lifetime of a queued event; expired entries are dropped, not delivered.
    /// Env: `OFFLINE_QUEUE_TTL_SECS`
    /// Default: `86400` (one day)
    pub offline_queue_ttl: Duration,

    /// Interval of the background sweep tasks (presence, typing, stale
    /// connections, expired queue entries).
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: `10`
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./courier.db"),
            instance_id: uuid::Uuid::new_v4().to_string(),
            presence_ttl: Duration::from_secs(90),
            typing_ttl: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(90),
            offline_queue_cap: 100,
            offline_queue_ttl: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(id) = std::env::var("INSTANCE_ID") {
            if !id.is_empty() {
                config.instance_id = id;
            }
        }

        if let Some(secs) = env_secs("PRESENCE_TTL_SECS") {
            config.presence_ttl = secs;
        }
        if let Some(secs) = env_secs("TYPING_TTL_SECS") {
            config.typing_ttl = secs;
        }
        if let Some(secs) = env_secs("HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = secs;
        }
        if let Some(secs) = env_secs("CONNECTION_TIMEOUT_SECS") {
            config.connection_timeout = secs;
        }
        if let Some(secs) = env_secs("OFFLINE_QUEUE_TTL_SECS") {
            config.offline_queue_ttl = secs;
        }
        if let Some(secs) = env_secs("SWEEP_INTERVAL_SECS") {
            config.sweep_interval = secs;
        }

        if let Ok(val) = std::env::var("OFFLINE_QUEUE_CAP") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.offline_queue_cap = n,
                _ => tracing::warn!(value = %val, "Invalid OFFLINE_QUEUE_CAP, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    let val = std::env::var(name).ok()?;
    match val.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!(var = name, value = %val, "Invalid duration, using default");
            None
        }
    }
}
