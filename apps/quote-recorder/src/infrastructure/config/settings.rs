//! Recorder Configuration Settings
//!
//! Configuration types for the quote recorder, loaded from environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::subscription::{
    DEFAULT_RENEWAL_INTERVAL, DEFAULT_SUBSCRIPTION_GUID, GuidMode, MAX_RENEWAL_INTERVAL,
    SubscriptionSettings,
};
use crate::infrastructure::alor::DEFAULT_CONNECT_TIMEOUT;
use crate::infrastructure::storage::{DEFAULT_BUSY_TIMEOUT, MAX_BUSY_TIMEOUT, SqliteQuoteStore};

/// Default quote-dispatch endpoint.
pub const DEFAULT_WS_URL: &str = "wss://api.alor.ru/ws";

/// Bearer credential for the quote feed.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the raw token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// What to subscribe to, and how often to renew.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Instrument selector (`ALL` for every instrument).
    pub instrument: String,
    /// Venue identifier.
    pub exchange: String,
    /// Payload shape selector.
    pub format: String,
    /// Correlation id policy.
    pub guid: GuidMode,
    /// Renewal cadence.
    pub renewal_interval: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            instrument: "ALL".to_string(),
            exchange: "MOEX".to_string(),
            format: "Simple".to_string(),
            guid: GuidMode::default(),
            renewal_interval: DEFAULT_RENEWAL_INTERVAL,
        }
    }
}

/// WebSocket reconnection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Bound on one connection handshake.
    pub connect_timeout: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// SQLite storage settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Database file.
    pub db_path: PathBuf,
    /// Bounded writer queue size.
    pub queue_capacity: usize,
    /// How long a write waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("database.db"),
            queue_capacity: 10_000,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl StorageSettings {
    /// Build the store these settings describe.
    #[must_use]
    pub fn store(&self) -> SqliteQuoteStore {
        SqliteQuoteStore::new(&self.db_path).with_busy_timeout(self.busy_timeout)
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Complete recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Feed credential.
    pub token: AccessToken,
    /// Subscription settings.
    pub feed: FeedSettings,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Storage settings.
    pub storage: StorageSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl RecorderConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or a value is out
    /// of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource(lookup);

        let token = env
            .get("ALOR_ACCESS_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("ALOR_ACCESS_TOKEN".to_string()))?;
        if token.is_empty() {
            return Err(ConfigError::EmptyValue("ALOR_ACCESS_TOKEN".to_string()));
        }

        let defaults = FeedSettings::default();
        let renewal_interval =
            env.duration_secs("QUOTES_RENEWAL_INTERVAL_SECS", defaults.renewal_interval);
        if renewal_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "QUOTES_RENEWAL_INTERVAL_SECS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if renewal_interval > MAX_RENEWAL_INTERVAL {
            return Err(ConfigError::InvalidValue {
                key: "QUOTES_RENEWAL_INTERVAL_SECS".to_string(),
                reason: format!("must be at most {}", MAX_RENEWAL_INTERVAL.as_secs()),
            });
        }

        let guid = match env.get("QUOTES_GUID_MODE").as_deref().map(str::to_lowercase) {
            None => env.fixed_guid(),
            Some(mode) => match mode.as_str() {
                "" | "fixed" => env.fixed_guid(),
                "per-request" | "per_request" => GuidMode::PerRequest,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "QUOTES_GUID_MODE".to_string(),
                        reason: format!("expected `fixed` or `per-request`, got `{other}`"),
                    });
                }
            },
        };

        let feed = FeedSettings {
            url: env.string("ALOR_WS_URL", defaults.url),
            instrument: env.string("QUOTES_INSTRUMENT", defaults.instrument),
            exchange: env.string("QUOTES_EXCHANGE", defaults.exchange),
            format: env.string("QUOTES_FORMAT", defaults.format),
            guid,
            renewal_interval,
        };

        let ws_defaults = WebSocketSettings::default();
        let connect_timeout =
            env.duration_secs("QUOTES_CONNECT_TIMEOUT_SECS", ws_defaults.connect_timeout);
        if connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "QUOTES_CONNECT_TIMEOUT_SECS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let websocket = WebSocketSettings {
            reconnect_delay_initial: env.duration_millis(
                "QUOTES_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env
                .duration_secs("QUOTES_RECONNECT_DELAY_MAX_SECS", ws_defaults.reconnect_delay_max),
            reconnect_delay_multiplier: env.parse(
                "QUOTES_RECONNECT_DELAY_MULTIPLIER",
                ws_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse(
                "QUOTES_MAX_RECONNECT_ATTEMPTS",
                ws_defaults.max_reconnect_attempts,
            ),
            connect_timeout,
        };

        let storage_defaults = StorageSettings::default();
        let queue_capacity =
            env.parse("QUOTES_WRITER_QUEUE_CAPACITY", storage_defaults.queue_capacity);
        if queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUOTES_WRITER_QUEUE_CAPACITY".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let busy_timeout =
            env.duration_millis("QUOTES_DB_BUSY_TIMEOUT_MS", storage_defaults.busy_timeout);
        if busy_timeout > MAX_BUSY_TIMEOUT {
            return Err(ConfigError::InvalidValue {
                key: "QUOTES_DB_BUSY_TIMEOUT_MS".to_string(),
                reason: format!("must be at most {}", MAX_BUSY_TIMEOUT.as_millis()),
            });
        }
        let storage = StorageSettings {
            db_path: env
                .get("QUOTES_DB_PATH")
                .filter(|p| !p.is_empty())
                .map_or(storage_defaults.db_path, PathBuf::from),
            queue_capacity,
            busy_timeout,
        };

        let server = ServerSettings {
            health_port: env.parse("QUOTES_HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            token: AccessToken::new(token),
            feed,
            websocket,
            storage,
            server,
        })
    }

    /// Subscription settings for the controller.
    #[must_use]
    pub fn subscription(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            code: self.feed.instrument.clone(),
            exchange: self.feed.exchange.clone(),
            format: self.feed.format.clone(),
            token: self.token.expose().to_string(),
            guid: self.feed.guid.clone(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

struct EnvSource<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).filter(|v| !v.is_empty()).unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn fixed_guid(&self) -> GuidMode {
        GuidMode::Fixed(self.string(
            "QUOTES_SUBSCRIPTION_GUID",
            DEFAULT_SUBSCRIPTION_GUID.to_string(),
        ))
    }
}
