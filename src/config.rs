//! Runtime configuration for the proxy.
//!
//! A [`Config`] is assembled once at startup from the process environment,
//! optionally layered over a TOML file that uses the same variable names as
//! its keys, validated, and then shared read-only (behind an `Arc`) by every
//! session for the lifetime of the process.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    path::Path,
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::metadata::LevelFilter;

use crate::auth::Credentials;

pub const DEFAULT_LISTEN_ADDR: &str = ":2525";
pub const DEFAULT_SERVER_DOMAIN: &str = "localhost";
pub const DEFAULT_DEST_PORT: u16 = 587;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

pub const LISTEN_ADDR: &str = "SMTP_LISTEN_ADDR";
pub const SERVER_DOMAIN: &str = "SMTP_SERVER_DOMAIN";
pub const PROXY_USERNAME: &str = "SMTP_PROXY_USERNAME";
pub const PROXY_PASSWORD: &str = "SMTP_PROXY_PASSWORD";
pub const DEST_HOST: &str = "SMTP_DEST_HOST";
pub const DEST_PORT: &str = "SMTP_DEST_PORT";
pub const DEST_USERNAME: &str = "SMTP_DEST_USERNAME";
pub const DEST_PASSWORD: &str = "SMTP_DEST_PASSWORD";
pub const DEST_FROM: &str = "SMTP_DEST_FROM";
pub const MAX_MESSAGE_SIZE: &str = "SMTP_MAX_MESSAGE_SIZE";
pub const LOG_LEVEL: &str = "LOG_LEVEL";

/// Reported in this order when absent.
const REQUIRED: [&str; 5] = [
    PROXY_USERNAME,
    PROXY_PASSWORD,
    DEST_HOST,
    DEST_USERNAME,
    DEST_PASSWORD,
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variables not set: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid SMTP_DEST_PORT: {0}")]
    InvalidPort(String),

    #[error("SMTP_DEST_FROM must be a valid email address: {0}")]
    InvalidSender(String),

    #[error("invalid SMTP_MAX_MESSAGE_SIZE: {0}")]
    InvalidMaxMessageSize(String),

    #[error("invalid LOG_LEVEL: {0} (must be debug, info, warn, or error)")]
    InvalidLogLevel(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ConfigError::InvalidLogLevel(value.to_string())),
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// The single submission endpoint every message is relayed to.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl Upstream {
    /// `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    /// Announced in the greeting and EHLO reply.
    pub server_domain: String,
    /// The pair local clients must authenticate with.
    pub proxy: Credentials,
    pub upstream: Upstream,
    /// Envelope sender used for every relayed message, whatever the client declared.
    pub envelope_from: String,
    /// Right-hand side of generated Message-IDs.
    pub identifier_domain: String,
    pub max_message_size: usize,
    pub log_level: LogLevel,
}

impl Config {
    /// Build a configuration from the process environment alone.
    ///
    /// # Errors
    ///
    /// See [`Config::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_value)
    }

    /// Build a configuration from the environment, falling back to the
    /// values in the TOML file at `path` for anything the environment leaves
    /// unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged values fail validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => FileValues::read(path)?,
            None => FileValues::default(),
        };

        Self::from_lookup(|key| env_value(key).or_else(|| file.get(key)))
    }

    /// Build and validate a configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated exactly like missing ones.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] naming every absent required key, or
    /// the first validation failure among the optional keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let missing = REQUIRED
            .into_iter()
            .filter(|key| value(key).is_none())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let required = |key: &str| value(key).unwrap_or_default();

        let port = match value(DEST_PORT) {
            None => DEFAULT_DEST_PORT,
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => return Err(ConfigError::InvalidPort(raw)),
            },
        };

        let upstream = Upstream {
            host: required(DEST_HOST),
            port,
            credentials: Credentials::new(required(DEST_USERNAME), required(DEST_PASSWORD)),
        };

        let envelope_from =
            value(DEST_FROM).unwrap_or_else(|| upstream.credentials.username().to_string());
        if !envelope_from.contains('@') {
            return Err(ConfigError::InvalidSender(envelope_from));
        }

        let server_domain =
            value(SERVER_DOMAIN).unwrap_or_else(|| DEFAULT_SERVER_DOMAIN.to_string());

        let identifier_domain = envelope_from
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .unwrap_or(&server_domain)
            .to_string();

        let max_message_size = match value(MAX_MESSAGE_SIZE) {
            None => DEFAULT_MAX_MESSAGE_SIZE,
            Some(raw) => match raw.parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => return Err(ConfigError::InvalidMaxMessageSize(raw)),
            },
        };

        let log_level = value(LOG_LEVEL)
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or_default();

        let listen_addr = value(LISTEN_ADDR).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

        Ok(Self {
            listen_addr: normalise_listen_addr(listen_addr),
            server_domain,
            proxy: Credentials::new(required(PROXY_USERNAME), required(PROXY_PASSWORD)),
            upstream,
            envelope_from,
            identifier_domain,
            max_message_size,
            log_level,
        })
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn sample() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            server_domain: "proxy.local".to_string(),
            proxy: Credentials::new("testuser", "testpass"),
            upstream: Upstream {
                host: "smtp.example.com".to_string(),
                port: DEFAULT_DEST_PORT,
                credentials: Credentials::new("user@example.com", "destpass"),
            },
            envelope_from: "relay@example.com".to_string(),
            identifier_domain: "example.com".to_string(),
            max_message_size: 1024,
            log_level: LogLevel::Debug,
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// `:2525` binds every interface.
fn normalise_listen_addr(addr: String) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileValue {
    Text(String),
    Integer(i64),
}

#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct FileValues(HashMap<String, FileValue>);

impl FileValues {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|value| match value {
            FileValue::Text(text) => text.clone(),
            FileValue::Integer(number) => number.to_string(),
        })
    }
}
