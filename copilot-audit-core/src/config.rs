use chrono::NaiveTime;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AuditError;

/// Environment overrides use `COPILOT_AUDIT__SECTION__KEY`.
const ENV_PREFIX: &str = "COPILOT_AUDIT";

/// Sweep time used when `retention.cleanup_time` cannot be parsed.
pub const DEFAULT_CLEANUP_TIME: &str = "03:00";

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_workers() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_queue_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_interval_ms() -> u64 {
    1000
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: default_workers(),
            queue_size: default_queue_size(),
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval_ms(),
            database: DatabaseConfig::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub sslmode: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub conn_max_lifetime_secs: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "copilot".to_string(),
            password: String::new(),
            dbname: "copilot_audit".to_string(),
            sslmode: "prefer".to_string(),
            max_connections: 10,
            min_connections: 0,
            conn_max_lifetime_secs: 3600,
            acquire_timeout_secs: 10,
        }
    }
}

// Hand-written so the password never reaches a log line.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("conn_max_lifetime_secs", &self.conn_max_lifetime_secs)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

impl DatabaseConfig {
    /// The single way this crate turns configuration into a Postgres target.
    pub fn connect_options(&self) -> Result<PgConnectOptions, AuditError> {
        let ssl_mode = self.ssl_mode()?;
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname)
            .ssl_mode(ssl_mode)
            .application_name("copilot-audit"))
    }

    pub fn ssl_mode(&self) -> Result<PgSslMode, AuditError> {
        PgSslMode::from_str(&self.sslmode).map_err(|_| {
            AuditError::InvalidConfig(format!("unknown database.sslmode '{}'", self.sslmode))
        })
    }

    /// `user@host:port/dbname`, safe for logs.
    pub fn describe(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.dbname)
    }

    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        match self.conn_max_lifetime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    /// 0 keeps interactions forever.
    pub days: u32,
    pub auto_cleanup: bool,
    /// Local time of day, `HH:MM` or `HH:MM:SS`.
    pub cleanup_time: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            auto_cleanup: true,
            cleanup_time: DEFAULT_CLEANUP_TIME.to_string(),
        }
    }
}

impl RetentionConfig {
    pub fn cleanup_time_of_day(&self) -> Result<NaiveTime, AuditError> {
        let raw = self.cleanup_time.trim();
        NaiveTime::parse_from_str(raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
            .map_err(|e| {
                AuditError::InvalidConfig(format!(
                    "retention.cleanup_time '{}' is not HH:MM: {}",
                    self.cleanup_time, e
                ))
            })
    }

    /// The configured sweep time, or 03:00 with an error log when it does
    /// not parse. A bad schedule never turns auditing off.
    pub fn effective_cleanup_time(&self) -> NaiveTime {
        match self.cleanup_time_of_day() {
            Ok(at) => at,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    fallback = DEFAULT_CLEANUP_TIME,
                    "Invalid retention.cleanup_time, using fallback"
                );
                NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN)
            }
        }
    }

    /// Whether the daily sweeper should run at all.
    pub fn sweeper_enabled(&self) -> bool {
        self.auto_cleanup && self.days > 0
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AuditConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        s.try_deserialize()
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Checks every value the pipeline relies on before anything is spawned.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.workers == 0 {
            return Err(AuditError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.queue_size == 0 {
            return Err(AuditError::InvalidConfig("queue_size must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(AuditError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.batch_interval_ms == 0 {
            return Err(AuditError::InvalidConfig(
                "batch_interval_ms must be at least 1".into(),
            ));
        }
        if self.database.host.trim().is_empty() {
            return Err(AuditError::InvalidConfig("database.host is empty".into()));
        }
        if self.database.dbname.trim().is_empty() {
            return Err(AuditError::InvalidConfig("database.dbname is empty".into()));
        }
        if self.database.port == 0 {
            return Err(AuditError::InvalidConfig("database.port is 0".into()));
        }
        if self.database.max_connections == 0 {
            return Err(AuditError::InvalidConfig(
                "database.max_connections must be at least 1".into(),
            ));
        }
        self.database.ssl_mode()?;
        Ok(())
    }
}
