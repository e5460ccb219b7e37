//! Room Controller configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default SFU sidecar base URL.
pub const DEFAULT_MEDIA_ENGINE_URL: &str = "http://127.0.0.1:3016";

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:4000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default maximum number of concurrently active rooms.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default whiteboard debounce window in milliseconds.
pub const DEFAULT_WHITEBOARD_FLUSH_MS: u64 = 2000;

/// Default bounded undo history per whiteboard.
pub const DEFAULT_WHITEBOARD_UNDO_LIMIT: usize = 500;

/// Default directory for recording output and stream descriptions.
pub const DEFAULT_RECORDING_DIR: &str = "/tmp/recordings";

/// Default transcoder binary.
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// First UDP port handed to recording consumers.
pub const DEFAULT_RECORDING_RTP_BASE_PORT: u16 = 20000;

/// Seconds the transcoder gets to finalize output before being killed.
pub const DEFAULT_RECORDING_STOP_GRACE_SECONDS: u64 = 5;

/// Default address the transcoder listens on for RTP.
pub const DEFAULT_RECORDING_LISTEN_IP: &str = "127.0.0.1";

/// Default listen address for WebRTC transports.
pub const DEFAULT_RTC_LISTEN_IP: &str = "0.0.0.0";

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "rc";

/// Room Controller configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// HMAC key for user access tokens.
    pub jwt_secret: SecretString,

    /// Base URL of the platform REST API.
    pub platform_url: String,

    /// Service bearer token for the platform REST API.
    pub platform_token: SecretString,

    /// SFU sidecar base URL.
    pub media_engine_url: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:4000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// Maximum concurrently active rooms.
    pub max_rooms: usize,

    /// Whiteboard debounce window.
    pub whiteboard_flush_ms: u64,

    /// Bounded undo history per whiteboard.
    pub whiteboard_undo_limit: usize,

    /// Directory for recording output.
    pub recording_dir: PathBuf,

    /// Transcoder binary path.
    pub ffmpeg_path: PathBuf,

    /// First UDP port handed to recording consumers.
    pub recording_rtp_base_port: u16,

    /// Transcoder shutdown grace period.
    pub recording_stop_grace_seconds: u64,

    /// Address the transcoder listens on.
    pub recording_listen_ip: String,

    /// Listen address for WebRTC transports.
    pub rtc_listen_ip: String,

    /// Public address announced in ICE candidates, if behind NAT.
    pub rtc_announced_ip: Option<String>,

    /// Also emit partial `participant_updated` deltas next to snapshots.
    pub legacy_delta_updates: bool,

    /// Redis URL for the presence mirror. Disabled when unset.
    pub redis_url: Option<SecretString>,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field("platform_url", &self.platform_url)
            .field("platform_token", &"[REDACTED]")
            .field("media_engine_url", &self.media_engine_url)
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("max_rooms", &self.max_rooms)
            .field("whiteboard_flush_ms", &self.whiteboard_flush_ms)
            .field("whiteboard_undo_limit", &self.whiteboard_undo_limit)
            .field("recording_dir", &self.recording_dir)
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("recording_rtp_base_port", &self.recording_rtp_base_port)
            .field(
                "recording_stop_grace_seconds",
                &self.recording_stop_grace_seconds,
            )
            .field("recording_listen_ip", &self.recording_listen_ip)
            .field("rtc_listen_ip", &self.rtc_listen_ip)
            .field("rtc_announced_ip", &self.rtc_announced_ip)
            .field("legacy_delta_updates", &self.legacy_delta_updates)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
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

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn parsed<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = SecretString::from(required(vars, "RC_JWT_SECRET")?);
        let platform_url = required(vars, "RC_PLATFORM_URL")?;
        let platform_token = SecretString::from(required(vars, "RC_PLATFORM_TOKEN")?);

        let media_engine_url = vars
            .get("RC_MEDIA_ENGINE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MEDIA_ENGINE_URL.to_string());

        let signaling_bind_address = vars
            .get("RC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let max_rooms = parsed(vars, "RC_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        let whiteboard_flush_ms =
            parsed(vars, "RC_WHITEBOARD_FLUSH_MS", DEFAULT_WHITEBOARD_FLUSH_MS)?;
        let whiteboard_undo_limit = parsed(
            vars,
            "RC_WHITEBOARD_UNDO_LIMIT",
            DEFAULT_WHITEBOARD_UNDO_LIMIT,
        )?;
        if whiteboard_undo_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_WHITEBOARD_UNDO_LIMIT must be positive".to_string(),
            ));
        }

        let recording_dir = PathBuf::from(
            vars.get("RC_RECORDING_DIR")
                .map_or(DEFAULT_RECORDING_DIR, String::as_str),
        );
        let ffmpeg_path = PathBuf::from(
            vars.get("RC_FFMPEG_PATH")
                .map_or(DEFAULT_FFMPEG_PATH, String::as_str),
        );
        let recording_rtp_base_port = parsed(
            vars,
            "RC_RECORDING_RTP_BASE_PORT",
            DEFAULT_RECORDING_RTP_BASE_PORT,
        )?;
        let recording_stop_grace_seconds = parsed(
            vars,
            "RC_RECORDING_STOP_GRACE_SECONDS",
            DEFAULT_RECORDING_STOP_GRACE_SECONDS,
        )?;
        let recording_listen_ip = vars
            .get("RC_RECORDING_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RECORDING_LISTEN_IP.to_string());

        let rtc_listen_ip = vars
            .get("RC_RTC_LISTEN_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RTC_LISTEN_IP.to_string());
        let rtc_announced_ip = vars
            .get("RC_RTC_ANNOUNCED_IP")
            .filter(|v| !v.is_empty())
            .cloned();

        let legacy_delta_updates = parsed(vars, "RC_LEGACY_DELTA_UPDATES", true)?;

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|v| !v.is_empty())
            .map(|v| SecretString::from(v.clone()));

        // Generate instance ID
        let instance_id = vars.get("RC_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            jwt_secret,
            platform_url,
            platform_token,
            media_engine_url,
            signaling_bind_address,
            health_bind_address,
            instance_id,
            max_rooms,
            whiteboard_flush_ms,
            whiteboard_undo_limit,
            recording_dir,
            ffmpeg_path,
            recording_rtp_base_port,
            recording_stop_grace_seconds,
            recording_listen_ip,
            rtc_listen_ip,
            rtc_announced_ip,
            legacy_delta_updates,
            redis_url,
        })
    }

    #[must_use]
    pub fn whiteboard_flush_interval(&self) -> Duration {
        Duration::from_millis(self.whiteboard_flush_ms)
    }

    #[must_use]
    pub fn recording_stop_grace(&self) -> Duration {
        Duration::from_secs(self.recording_stop_grace_seconds)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("RC_JWT_SECRET".to_string(), "jwt-signing-secret".to_string()),
            (
                "RC_PLATFORM_URL".to_string(),
                "http://platform.internal".to_string(),
            ),
            (
                "RC_PLATFORM_TOKEN".to_string(),
                "svc-platform-token".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.jwt_secret.expose_secret(), "jwt-signing-secret");
        assert_eq!(config.platform_url, "http://platform.internal");
        assert_eq!(config.media_engine_url, DEFAULT_MEDIA_ENGINE_URL);
        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.max_rooms, DEFAULT_MAX_ROOMS);
        assert_eq!(config.whiteboard_flush_ms, DEFAULT_WHITEBOARD_FLUSH_MS);
        assert_eq!(config.whiteboard_undo_limit, DEFAULT_WHITEBOARD_UNDO_LIMIT);
        assert_eq!(config.recording_dir, PathBuf::from(DEFAULT_RECORDING_DIR));
        assert_eq!(config.ffmpeg_path, PathBuf::from(DEFAULT_FFMPEG_PATH));
        assert_eq!(
            config.recording_rtp_base_port,
            DEFAULT_RECORDING_RTP_BASE_PORT
        );
        assert_eq!(config.recording_stop_grace(), Duration::from_secs(5));
        assert_eq!(config.rtc_announced_ip, None);
        assert!(config.legacy_delta_updates);
        assert!(config.redis_url.is_none());
        // Instance ID should be auto-generated
        assert!(config.instance_id.starts_with("rc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert(
            "RC_SIGNALING_BIND_ADDRESS".to_string(),
            "127.0.0.1:4001".to_string(),
        );
        vars.insert("RC_MAX_ROOMS".to_string(), "25".to_string());
        vars.insert("RC_WHITEBOARD_FLUSH_MS".to_string(), "500".to_string());
        vars.insert("RC_WHITEBOARD_UNDO_LIMIT".to_string(), "50".to_string());
        vars.insert("RC_RECORDING_RTP_BASE_PORT".to_string(), "30000".to_string());
        vars.insert("RC_RTC_ANNOUNCED_IP".to_string(), "203.0.113.7".to_string());
        vars.insert("RC_LEGACY_DELTA_UPDATES".to_string(), "false".to_string());
        vars.insert("REDIS_URL".to_string(), "redis://cache:6379".to_string());
        vars.insert("RC_INSTANCE_ID".to_string(), "rc-custom-001".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.signaling_bind_address, "127.0.0.1:4001");
        assert_eq!(config.max_rooms, 25);
        assert_eq!(
            config.whiteboard_flush_interval(),
            Duration::from_millis(500)
        );
        assert_eq!(config.whiteboard_undo_limit, 50);
        assert_eq!(config.recording_rtp_base_port, 30000);
        assert_eq!(config.rtc_announced_ip.as_deref(), Some("203.0.113.7"));
        assert!(!config.legacy_delta_updates);
        assert_eq!(
            config.redis_url.as_ref().map(|u| u.expose_secret().to_string()),
            Some("redis://cache:6379".to_string())
        );
        assert_eq!(config.instance_id, "rc-custom-001");
    }

    #[test]
    fn test_from_vars_missing_jwt_secret() {
        let mut vars = base_vars();
        vars.remove("RC_JWT_SECRET");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "RC_JWT_SECRET"));
    }

    #[test]
    fn test_from_vars_empty_platform_url_is_missing() {
        let mut vars = base_vars();
        vars.insert("RC_PLATFORM_URL".to_string(), String::new());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "RC_PLATFORM_URL"));
    }

    #[test]
    fn test_from_vars_invalid_number() {
        let mut vars = base_vars();
        vars.insert("RC_MAX_ROOMS".to_string(), "lots".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("RC_MAX_ROOMS")));
    }

    #[test]
    fn test_from_vars_rejects_zero_undo_limit() {
        let mut vars = base_vars();
        vars.insert("RC_WHITEBOARD_UNDO_LIMIT".to_string(), "0".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let mut vars = base_vars();
        vars.insert(
            "REDIS_URL".to_string(),
            "redis://:hunter2@cache:6379".to_string(),
        );
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("jwt-signing-secret"));
        assert!(!debug_output.contains("svc-platform-token"));
        assert!(!debug_output.contains("hunter2"));
    }
}
