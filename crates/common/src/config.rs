use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Shared secret used to verify connection tokens
    pub jwt_secret: String,

    /// JWT token expiry in hours (used when minting tokens for producers and tests)
    pub jwt_expiry_hours: u64,

    /// Port the relay's WebSocket listener binds to (default: 4000)
    pub relay_port: u16,

    /// Name of the durable notification queue (Redis stream key)
    pub notification_queue: String,

    /// Consumer group the relay reads the queue through
    pub consumer_group: String,

    /// Consumer name inside the group. Must be stable across restarts so
    /// unacknowledged entries are picked up again.
    pub consumer_name: String,

    /// Maximum number of queue entries fetched per read (default: 16)
    pub queue_batch_size: usize,

    /// Number of delivery workers (default: 4)
    pub relay_workers: usize,

    /// Upper bound on a single push to a connection, in milliseconds (default: 5000)
    pub push_timeout_ms: u64,

    /// Per-connection outbound buffer, in events (default: 64)
    pub outbound_buffer: usize,

    /// Keepalive ping interval in seconds (default: 30)
    pub ping_interval_secs: u64,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Emit JSON log lines instead of human-readable text
    pub log_json: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: parse_var("JWT_EXPIRY_HOURS", "24")?,
            relay_port: parse_var("RELAY_PORT", "4000")?,
            notification_queue: std::env::var("NOTIFICATION_QUEUE")
                .unwrap_or_else(|_| "notifications".to_string()),
            consumer_group: std::env::var("RELAY_CONSUMER_GROUP")
                .unwrap_or_else(|_| "herald-relay".to_string()),
            consumer_name: std::env::var("RELAY_CONSUMER_NAME")
                .unwrap_or_else(|_| "relay-1".to_string()),
            queue_batch_size: parse_var("RELAY_BATCH_SIZE", "16")?,
            relay_workers: parse_var("RELAY_WORKERS", "4")?,
            push_timeout_ms: parse_var("RELAY_PUSH_TIMEOUT_MS", "5000")?,
            outbound_buffer: parse_var("RELAY_OUTBOUND_BUFFER", "64")?,
            ping_interval_secs: parse_var("RELAY_PING_INTERVAL_SECS", "30")?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

/// Read a numeric variable, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        })
}
