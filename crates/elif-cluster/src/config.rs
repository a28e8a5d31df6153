//! Cluster and endpoint configuration
//!
//! `ClusterConfig` holds the cluster-wide knobs; `ConnectionOptions` describes one
//! endpoint (primary or replica).

use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_CONN_ATTEMPTS: u32 = 3;
pub const DEFAULT_CONN_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_CONN_CHECK_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_POSTGRES_PORT: u16 = 5432;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Cluster-wide configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// How many times to try opening an endpoint before giving up
    pub max_conn_attempts: u32,
    /// Pause between two failed attempts to open an endpoint
    pub conn_retry_delay: Duration,
    /// Interval of both the per-connection probe loop and the replica recompute loop
    pub conn_check_delay: Duration,
    /// Upper bound on a single liveness probe
    pub ping_timeout: Duration,
    /// Prefix outgoing statements with a comment naming the routed endpoint
    pub prepend_caller: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_conn_attempts: DEFAULT_MAX_CONN_ATTEMPTS,
            conn_retry_delay: DEFAULT_CONN_RETRY_DELAY,
            conn_check_delay: DEFAULT_CONN_CHECK_DELAY,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            prepend_caller: false,
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_conn_attempts(mut self, attempts: u32) -> Self {
        self.max_conn_attempts = attempts;
        self
    }

    pub fn with_conn_retry_delay(mut self, delay: Duration) -> Self {
        self.conn_retry_delay = delay;
        self
    }

    pub fn with_conn_check_delay(mut self, delay: Duration) -> Self {
        self.conn_check_delay = delay;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_prepend_caller(mut self, enabled: bool) -> Self {
        self.prepend_caller = enabled;
        self
    }

    /// Load configuration from environment variables, falling back to defaults
    ///
    /// Recognized variables:
    /// - `ELIF_CLUSTER_MAX_CONN_ATTEMPTS`
    /// - `ELIF_CLUSTER_CONN_RETRY_DELAY_MS`
    /// - `ELIF_CLUSTER_CONN_CHECK_DELAY_MS`
    /// - `ELIF_CLUSTER_PING_TIMEOUT_MS`
    /// - `ELIF_CLUSTER_PREPEND_CALLER`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(attempts) = parse_env::<u32>(
            "ELIF_CLUSTER_MAX_CONN_ATTEMPTS",
            "max_conn_attempts",
            "positive integer",
        )? {
            config.max_conn_attempts = attempts;
        }

        if let Some(ms) = parse_env::<u64>(
            "ELIF_CLUSTER_CONN_RETRY_DELAY_MS",
            "conn_retry_delay",
            "duration in milliseconds",
        )? {
            config.conn_retry_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_env::<u64>(
            "ELIF_CLUSTER_CONN_CHECK_DELAY_MS",
            "conn_check_delay",
            "duration in milliseconds",
        )? {
            config.conn_check_delay = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_env::<u64>(
            "ELIF_CLUSTER_PING_TIMEOUT_MS",
            "ping_timeout",
            "duration in milliseconds",
        )? {
            config.ping_timeout = Duration::from_millis(ms);
        }

        if let Some(enabled) =
            parse_env::<bool>("ELIF_CLUSTER_PREPEND_CALLER", "prepend_caller", "true or false")?
        {
            config.prepend_caller = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_conn_attempts == 0 {
            return Err(ConfigError::ValidationFailed {
                message: "max_conn_attempts must be at least 1".to_string(),
            });
        }

        if self.conn_check_delay.is_zero() {
            return Err(ConfigError::ValidationFailed {
                message: "conn_check_delay must be greater than zero".to_string(),
            });
        }

        if self.ping_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed {
                message: "ping_timeout must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(var: &str, field: &str, expected: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: field.to_string(),
                value: raw,
                expected: expected.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Options describing how to reach a single database endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    url: String,
    host: String,
    port: u16,
    /// Maximum physical connections the driver may open for this endpoint
    pub max_connections: u32,
    /// `application_name` reported to the server
    pub application_name: Option<String>,
    /// Prefix statements with a comment naming this endpoint
    pub prepend_caller: bool,
}

impl ConnectionOptions {
    /// Build options from a `postgres://` URL
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
            field: "url".to_string(),
            value: redact(url),
            expected: format!("valid database URL ({})", e),
        })?;

        if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
            return Err(ConfigError::InvalidValue {
                field: "url".to_string(),
                value: redact(url),
                expected: "postgres:// or postgresql:// scheme".to_string(),
            });
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "url".to_string(),
                value: redact(url),
                expected: "URL with a host".to_string(),
            })?
            .to_string();

        Ok(Self {
            url: url.to_string(),
            host,
            port: parsed.port().unwrap_or(DEFAULT_POSTGRES_PORT),
            max_connections: 10,
            application_name: None,
            prepend_caller: false,
        })
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn with_prepend_caller(mut self, enabled: bool) -> Self {
        self.prepend_caller = enabled;
        self
    }

    /// Full connection URL, credentials included
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `host:port` identity used in logs and status reports
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("url", &redact(&self.url))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("application_name", &self.application_name)
            .field("prepend_caller", &self.prepend_caller)
            .finish()
    }
}

impl FromStr for ConnectionOptions {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}

fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("****"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}
