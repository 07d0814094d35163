use config::Config;
use config::ConfigError;
use config::FileFormat;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::PgConnectOptions;

/// Top-level configuration. Loaded once at startup and treated as immutable
/// for the lifetime of the process.
#[derive(Clone, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub redis_uri: Secret<String>,
    pub queue: QueueSettings,
    pub closer: CloserSettings,
}

#[derive(Clone, Deserialize)]
pub struct ApplicationSettings {
    pub host: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    /// Signs the session cookie
    pub hmac_secret: Secret<String>,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    /// Port for the postgres database. This will be different from that of the
    /// server.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
}

/// Ingress queue and worker thresholds.
#[derive(Clone, Deserialize)]
pub struct QueueSettings {
    /// Unprocessed registration intents allowed per session before the API
    /// starts rejecting with 429
    pub backlog_cap: i64,
    /// Repeated submissions with the same key within this window map to the
    /// same request
    pub idempotency_ttl_secs: u64,
    /// Request-status records are GC'd after this window
    pub request_ttl_secs: u64,
    /// XREADGROUP block timeout
    pub block_ms: u64,
    /// How often workers rescan the sessions table for new streams
    pub discover_interval_secs: u64,
    /// Serialization-failure retries before a request surfaces as rejected
    pub max_txn_retries: u32,
}

/// Auto-closer schedule.
#[derive(Clone, Deserialize)]
pub struct CloserSettings {
    pub interval_secs: u64,
    /// Sessions are closed once starts_at is this far in the past
    pub grace_hours: i64,
    /// Redis lock TTL; must stay below interval_secs so the lock expires
    /// between ticks
    pub lock_ttl_secs: u64,
    pub batch: i64,
}

impl DatabaseSettings {
    pub fn connection(&self) -> PgConnectOptions {
        self.connection_without_db().database(&self.database_name)
    }

    /// Connection to the postgres instance itself; used by the test harness to
    /// create throwaway databases.
    pub fn connection_without_db(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
    }
}

/// Loads `configuration.yaml`, then overlays environment variables prefixed
/// with `APP` (e.g. `APP__DATABASE__HOST=db` overrides `database.host`). All
/// fields must resolve, otherwise initialisation fails immediately and the
/// process will not start.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = Config::builder()
        .add_source(config::File::new("configuration.yaml", FileFormat::Yaml))
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;
    settings.try_deserialize()
}
