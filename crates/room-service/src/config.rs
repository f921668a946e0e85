//! Room Service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use base64::{engine::general_purpose::STANDARD, Engine};
use common::secret::{ExposeSecret, SecretBox, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default signaling + lifecycle API bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default bounded wait on media engine calls.
pub const DEFAULT_ENGINE_TIMEOUT_MS: u64 = 10_000;

/// Default maximum inbound signaling frame size.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default per-connection outbound frame queue.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Default drain period on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 30;

/// Minimum decoded length of the token signing secret.
pub const MIN_JWT_SECRET_BYTES: usize = 32;

/// Room Service configuration.
#[derive(Clone)]
pub struct Config {
    /// Signaling WebSocket and lifecycle API bind address.
    pub bind_address: String,

    /// Health endpoint bind address.
    pub health_bind_address: String,

    /// Redis URL. When absent the in-memory store and in-process bus are used.
    pub redis_url: Option<SecretString>,

    /// Decoded HMAC secret for validating access tokens (HS256).
    pub jwt_secret: std::sync::Arc<SecretBox<Vec<u8>>>,

    /// Bounded wait on every media engine call.
    pub engine_timeout: Duration,

    /// Maximum inbound signaling frame size in bytes.
    pub max_message_bytes: usize,

    /// Per-connection outbound frame queue capacity.
    pub outbound_buffer: usize,

    /// Drain period after a shutdown signal.
    pub shutdown_grace: Duration,

    /// Whether connections without a token get a generated guest identity.
    pub allow_guests: bool,

    /// Emit JSON logs.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("jwt_secret", &"[REDACTED]")
            .field("engine_timeout", &self.engine_timeout)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("allow_guests", &self.allow_guests)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let encoded_secret = SecretString::from(
            vars.get("ROOM_JWT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("ROOM_JWT_SECRET".to_string()))?
                .clone(),
        );
        let decoded = STANDARD
            .decode(encoded_secret.expose_secret().as_bytes())
            .map_err(|_| {
                ConfigError::InvalidValue("ROOM_JWT_SECRET must be valid base64".to_string())
            })?;
        if decoded.len() < MIN_JWT_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "ROOM_JWT_SECRET must decode to at least {MIN_JWT_SECRET_BYTES} bytes"
            )));
        }
        let jwt_secret = std::sync::Arc::new(SecretBox::new(Box::new(decoded)));

        let bind_address = vars
            .get("ROOM_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("ROOM_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|url| !url.is_empty())
            .map(|url| SecretString::from(url.clone()));

        let engine_timeout_ms = parse_or(vars, "ROOM_ENGINE_TIMEOUT_MS", DEFAULT_ENGINE_TIMEOUT_MS)?;
        if engine_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "ROOM_ENGINE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let max_message_bytes =
            parse_or(vars, "ROOM_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?;

        let outbound_buffer = parse_or(vars, "ROOM_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        if outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "ROOM_OUTBOUND_BUFFER must be greater than zero".to_string(),
            ));
        }

        let shutdown_grace_seconds = parse_or(
            vars,
            "ROOM_SHUTDOWN_GRACE_SECONDS",
            DEFAULT_SHUTDOWN_GRACE_SECONDS,
        )?;

        let allow_guests = parse_or(vars, "ROOM_ALLOW_GUESTS", true)?;
        let log_json = parse_or(vars, "ROOM_LOG_JSON", false)?;

        Ok(Config {
            bind_address,
            health_bind_address,
            redis_url,
            jwt_secret,
            engine_timeout: Duration::from_millis(engine_timeout_ms),
            max_message_bytes,
            outbound_buffer,
            shutdown_grace: Duration::from_secs(shutdown_grace_seconds),
            allow_guests,
            log_json,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw} could not be parsed"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // 32 bytes of "k", base64 encoded
    const TEST_SECRET: &str = "a2tra2tra2tra2tra2tra2tra2tra2tra2tra2tra2s=";

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([("ROOM_JWT_SECRET".to_string(), TEST_SECRET.to_string())])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.redis_url.is_none());
        assert_eq!(config.jwt_secret.expose_secret().len(), 32);
        assert_eq!(
            config.engine_timeout,
            Duration::from_millis(DEFAULT_ENGINE_TIMEOUT_MS)
        );
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(config.outbound_buffer, DEFAULT_OUTBOUND_BUFFER);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert!(config.allow_guests);
        assert!(!config.log_json);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("ROOM_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert(
            "ROOM_HEALTH_BIND_ADDRESS".to_string(),
            "127.0.0.1:9001".to_string(),
        );
        vars.insert("REDIS_URL".to_string(), "redis://redis:6379".to_string());
        vars.insert("ROOM_ENGINE_TIMEOUT_MS".to_string(), "2500".to_string());
        vars.insert("ROOM_MAX_MESSAGE_BYTES".to_string(), "1024".to_string());
        vars.insert("ROOM_OUTBOUND_BUFFER".to_string(), "16".to_string());
        vars.insert("ROOM_SHUTDOWN_GRACE_SECONDS".to_string(), "5".to_string());
        vars.insert("ROOM_ALLOW_GUESTS".to_string(), "false".to_string());
        vars.insert("ROOM_LOG_JSON".to_string(), "true".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.health_bind_address, "127.0.0.1:9001");
        assert_eq!(
            config.redis_url.as_ref().map(|u| u.expose_secret().to_string()),
            Some("redis://redis:6379".to_string())
        );
        assert_eq!(config.engine_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_message_bytes, 1024);
        assert_eq!(config.outbound_buffer, 16);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(!config.allow_guests);
        assert!(config.log_json);
    }

    #[test]
    fn test_from_vars_missing_jwt_secret() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "ROOM_JWT_SECRET"));
    }

    #[test]
    fn test_from_vars_short_jwt_secret() {
        let mut vars = base_vars();
        vars.insert("ROOM_JWT_SECRET".to_string(), "c2hvcnQ=".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_rejects_unparseable_numbers() {
        let mut vars = base_vars();
        vars.insert("ROOM_ENGINE_TIMEOUT_MS".to_string(), "soon".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("ROOM_ENGINE_TIMEOUT_MS")));
    }

    #[test]
    fn test_from_vars_rejects_zero_timeout() {
        let mut vars = base_vars();
        vars.insert("ROOM_ENGINE_TIMEOUT_MS".to_string(), "0".to_string());

        assert!(Config::from_vars(&vars).is_err());
    }

    #[test]
    fn test_empty_redis_url_means_in_memory() {
        let mut vars = base_vars();
        vars.insert("REDIS_URL".to_string(), String::new());

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let mut vars = base_vars();
        vars.insert("REDIS_URL".to_string(), "redis://:pw@redis:6379".to_string());
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("redis://"));
        assert!(!debug_output.contains(TEST_SECRET));
    }
}
