// common/src/config.rs
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use ::config::{Config as ConfigFile, Environment, File};

use crate::error::ConfigError;

/// Placeholder secret the old deployment fell back to. Never accepted.
const PLACEHOLDER_SECRET: &str = "DEBUG";

/// Longest accepted session lifetime (one year)
const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;

/// Process-wide proxy configuration, read once at startup
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Number of actix workers; 0 lets actix pick one per core
    pub workers: usize,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub websocket: WebSocketConfig,
    pub database: DatabaseConfig,
}

/// The single IDE backend every connection is forwarded to
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub body_idle_timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Verify and log, but forward regardless of the outcome
    Permissive,
    /// Reject missing or invalid tokens before forwarding
    Enforce,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub secret_key: String,
    pub cookie_name: String,
    /// Mark the issued session cookie `Secure`
    pub secure_cookie: bool,
    pub mode: AuthMode,
    pub leeway_secs: u64,
    pub session_ttl_hours: i64,
    pub landing_path: String,
    pub failure_redirect: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_frame_size: usize,
    /// Client messages queued for the upstream before the session is
    /// closed as overloaded
    pub max_pending_messages: usize,
}

/// Connection parameters of the relational store shared with sibling
/// services. Loaded and validated here, not used on the request path.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".to_string(),
            workers: 0,
            upstream: UpstreamConfig::default(),
            auth: AuthConfig::default(),
            websocket: WebSocketConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "theia".to_string(),
            port: 5000,
            connect_timeout_secs: 5,
            response_timeout_secs: 60,
            body_idle_timeout_secs: 300,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            cookie_name: "token".to_string(),
            secure_cookie: true,
            mode: AuthMode::Permissive,
            leeway_secs: 0,
            session_ttl_hours: 6,
            landing_path: "/ide/".to_string(),
            failure_redirect: "https://anubis-lms.io/error".to_string(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            idle_timeout_secs: 30,
            max_frame_size: 16 * 1024 * 1024,
            max_pending_messages: 1024,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "anubis".to_string(),
            password: "anubis".to_string(),
            name: "anubis".to_string(),
        }
    }
}

// Keep the secret out of debug output and logs.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_key", &"<redacted>")
            .field("cookie_name", &self.cookie_name)
            .field("secure_cookie", &self.secure_cookie)
            .field("mode", &self.mode)
            .field("leeway_secs", &self.leeway_secs)
            .field("session_ttl_hours", &self.session_ttl_hours)
            .field("landing_path", &self.landing_path)
            .field("failure_redirect", &self.failure_redirect)
            .finish()
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Permissive => write!(f, "permissive"),
            AuthMode::Enforce => write!(f, "enforce"),
        }
    }
}

impl UpstreamConfig {
    /// `host:port` of the upstream
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn body_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.body_idle_timeout_secs)
    }
}

impl WebSocketConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Load configuration from files and environment, then validate it.
    ///
    /// Sources, lowest precedence first: built-in defaults,
    /// `config/default.toml`, `config/{RUN_MODE}.toml`, `config/local.toml`,
    /// `PROXY__*` environment variables, and finally the legacy variables
    /// (`SECRET_KEY`, `DB_HOST`, ...) the IDE deployment already sets.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config"));

        tracing::info!("Loading configuration from {}", config_dir.display());
        tracing::info!("Using run mode: {}", run_mode);

        let mut config: Config = ConfigFile::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", run_mode))).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(Environment::with_prefix("PROXY").separator("__"))
            .build()?
            .try_deserialize()?;

        config.apply_legacy_env(|key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Overlay the unprefixed variables used by the original deployment
    pub fn apply_legacy_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("SECRET_KEY") {
            self.auth.secret_key = secret;
        }
        if let Some(host) = lookup("DB_HOST") {
            self.database.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            self.database.port = port.parse().map_err(|_| ConfigError::Invalid {
                key: "DB_PORT",
                reason: format!("`{}` is not a port number", port),
            })?;
        }
        if let Some(user) = lookup("DB_USER") {
            self.database.user = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            self.database.password = password;
        }
        if let Some(name) = lookup("DB_DATABASE") {
            self.database.name = name;
        }
        Ok(())
    }

    /// Refuse to run with missing or insecure values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secret = self.auth.secret_key.trim();
        if secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if secret == PLACEHOLDER_SECRET {
            return Err(ConfigError::Invalid {
                key: "auth.secret_key",
                reason: "the placeholder debug secret is not allowed".to_string(),
            });
        }
        if self.auth.cookie_name.is_empty() {
            return Err(ConfigError::Invalid {
                key: "auth.cookie_name",
                reason: "must not be empty".to_string(),
            });
        }
        if !(1..=MAX_SESSION_TTL_HOURS).contains(&self.auth.session_ttl_hours) {
            return Err(ConfigError::Invalid {
                key: "auth.session_ttl_hours",
                reason: format!("must be between 1 and {}", MAX_SESSION_TTL_HOURS),
            });
        }
        if self.upstream.host.is_empty() {
            return Err(ConfigError::Invalid {
                key: "upstream.host",
                reason: "must not be empty".to_string(),
            });
        }
        if self.upstream.port == 0 {
            return Err(ConfigError::Invalid {
                key: "upstream.port",
                reason: "must not be zero".to_string(),
            });
        }

        let timeouts = [
            ("upstream.connect_timeout_secs", self.upstream.connect_timeout_secs),
            ("upstream.response_timeout_secs", self.upstream.response_timeout_secs),
            ("upstream.body_idle_timeout_secs", self.upstream.body_idle_timeout_secs),
            ("websocket.heartbeat_interval_secs", self.websocket.heartbeat_interval_secs),
            ("websocket.idle_timeout_secs", self.websocket.idle_timeout_secs),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be at least one second".to_string(),
                });
            }
        }

        if self.websocket.max_pending_messages == 0 {
            return Err(ConfigError::Invalid {
                key: "websocket.max_pending_messages",
                reason: "must not be zero".to_string(),
            });
        }

        if self.websocket.idle_timeout_secs <= self.websocket.heartbeat_interval_secs {
            return Err(ConfigError::Invalid {
                key: "websocket.idle_timeout_secs",
                reason: "must be longer than the heartbeat interval".to_string(),
            });
        }

        Ok(())
    }
}
