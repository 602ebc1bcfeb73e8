//! Call Controller configuration.
//!
//! Configuration is loaded from environment variables and validated once at
//! startup. Media settings (worker pool size, port range, bitrates) have no
//! defaults: a missing or malformed value fails startup.

use crate::media::{CodecCapability, MediaKind};
use common::config::ObservabilityConfig;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8082";

/// Default per-worker router cap.
pub const DEFAULT_MAX_ROUTERS_PER_WORKER: usize = 500;

/// Default seconds a worker whose router creation failed stays out of placement.
pub const DEFAULT_WORKER_RETRY_SECONDS: u64 = 10;

/// Default time a call may ring before it is ended as missed.
pub const DEFAULT_RING_TIMEOUT_SECONDS: u64 = 45;

/// Default maximum concurrent calls per controller instance.
pub const DEFAULT_MAX_ACTIVE_CALLS: usize = 10_000;

/// Default controller instance ID prefix.
pub const DEFAULT_CONTROLLER_ID_PREFIX: &str = "cc";

/// Lowest port a media transport may bind.
pub const MIN_ALLOWED_RTC_PORT: u16 = 1024;

/// Default audio codec set (`kind/mime/clock[/channels]`).
pub const DEFAULT_AUDIO_CODECS: &str = "audio/opus/48000/2";

/// Default video codec set (`kind/mime/clock[/channels]`).
pub const DEFAULT_VIDEO_CODECS: &str = "audio/opus/48000/2,video/VP8/90000";

/// Call Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this controller instance.
    pub controller_id: String,

    /// Health/metrics endpoint bind address (default: "0.0.0.0:8082").
    pub health_bind_address: String,

    /// Number of media workers in the pool.
    pub worker_pool_size: usize,

    /// Maximum routers a single worker may host.
    pub max_routers_per_worker: usize,

    /// Seconds an unreachable worker sits out before placement retries it.
    pub worker_retry_seconds: u64,

    /// Lowest port for media transports (inclusive).
    pub rtc_min_port: u16,

    /// Highest port for media transports (inclusive).
    pub rtc_max_port: u16,

    /// Initial outgoing bitrate for new transports, in bits per second.
    pub initial_outgoing_bitrate: u32,

    /// Minimum outgoing bitrate, in bits per second.
    pub min_outgoing_bitrate: u32,

    /// Codecs offered by routers of audio calls.
    pub audio_codecs: Vec<CodecCapability>,

    /// Codecs offered by routers of video calls.
    pub video_codecs: Vec<CodecCapability>,

    /// Seconds a call may stay ringing before it is force-ended with reason `timeout`.
    pub ring_timeout_seconds: u64,

    /// Maximum concurrent calls on this instance.
    pub max_active_calls: usize,

    /// Logging configuration.
    pub observability: ObservabilityConfig,
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
        let worker_pool_size: usize = parse_required(vars, "MEDIA_WORKER_POOL_SIZE")?;
        if worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "MEDIA_WORKER_POOL_SIZE must be at least 1".to_string(),
            ));
        }

        let rtc_min_port: u16 = parse_required(vars, "MEDIA_RTC_MIN_PORT")?;
        let rtc_max_port: u16 = parse_required(vars, "MEDIA_RTC_MAX_PORT")?;
        if rtc_min_port < MIN_ALLOWED_RTC_PORT {
            return Err(ConfigError::InvalidValue(format!(
                "MEDIA_RTC_MIN_PORT must be >= {MIN_ALLOWED_RTC_PORT}"
            )));
        }
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(
                "MEDIA_RTC_MIN_PORT must not exceed MEDIA_RTC_MAX_PORT".to_string(),
            ));
        }

        let initial_outgoing_bitrate: u32 =
            parse_required(vars, "MEDIA_INITIAL_OUTGOING_BITRATE")?;
        let min_outgoing_bitrate: u32 = parse_required(vars, "MEDIA_MIN_OUTGOING_BITRATE")?;
        if min_outgoing_bitrate == 0 || min_outgoing_bitrate > initial_outgoing_bitrate {
            return Err(ConfigError::InvalidValue(
                "MEDIA_MIN_OUTGOING_BITRATE must be positive and not exceed MEDIA_INITIAL_OUTGOING_BITRATE"
                    .to_string(),
            ));
        }

        let max_routers_per_worker =
            parse_optional(vars, "MEDIA_MAX_ROUTERS_PER_WORKER")?.unwrap_or(DEFAULT_MAX_ROUTERS_PER_WORKER);
        if max_routers_per_worker == 0 {
            return Err(ConfigError::InvalidValue(
                "MEDIA_MAX_ROUTERS_PER_WORKER must be at least 1".to_string(),
            ));
        }

        let worker_retry_seconds =
            parse_optional(vars, "MEDIA_WORKER_RETRY_SECONDS")?.unwrap_or(DEFAULT_WORKER_RETRY_SECONDS);

        let audio_codecs = parse_codec_list(
            "MEDIA_AUDIO_CODECS",
            vars.get("MEDIA_AUDIO_CODECS")
                .map_or(DEFAULT_AUDIO_CODECS, String::as_str),
        )?;
        if audio_codecs.iter().any(|c| c.kind != MediaKind::Audio) {
            return Err(ConfigError::InvalidValue(
                "MEDIA_AUDIO_CODECS may only contain audio codecs".to_string(),
            ));
        }

        let video_codecs = parse_codec_list(
            "MEDIA_VIDEO_CODECS",
            vars.get("MEDIA_VIDEO_CODECS")
                .map_or(DEFAULT_VIDEO_CODECS, String::as_str),
        )?;
        if !video_codecs.iter().any(|c| c.kind == MediaKind::Video) {
            return Err(ConfigError::InvalidValue(
                "MEDIA_VIDEO_CODECS must contain at least one video codec".to_string(),
            ));
        }

        let ring_timeout_seconds =
            parse_optional(vars, "CALL_RING_TIMEOUT_SECONDS")?.unwrap_or(DEFAULT_RING_TIMEOUT_SECONDS);
        if ring_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_RING_TIMEOUT_SECONDS must be at least 1".to_string(),
            ));
        }

        let max_active_calls =
            parse_optional(vars, "CALL_MAX_ACTIVE_CALLS")?.unwrap_or(DEFAULT_MAX_ACTIVE_CALLS);

        let health_bind_address = vars
            .get("CALL_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let controller_id = vars.get("CALL_CONTROLLER_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_CONTROLLER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            controller_id,
            health_bind_address,
            worker_pool_size,
            max_routers_per_worker,
            worker_retry_seconds,
            rtc_min_port,
            rtc_max_port,
            initial_outgoing_bitrate,
            min_outgoing_bitrate,
            audio_codecs,
            video_codecs,
            ring_timeout_seconds,
            max_active_calls,
            observability: ObservabilityConfig::from_vars(vars),
        })
    }
}

fn parse_required<T: FromStr>(vars: &HashMap<String, String>, key: &str) -> Result<T, ConfigError> {
    let raw = vars
        .get(key)
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key} is not a valid value")))
}

fn parse_optional<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("{key} is not a valid value"))),
    }
}

/// Parse a comma-separated codec list such as `audio/opus/48000/2,video/VP8/90000`.
fn parse_codec_list(key: &str, raw: &str) -> Result<Vec<CodecCapability>, ConfigError> {
    let codecs = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            CodecCapability::parse(entry)
                .ok_or_else(|| ConfigError::InvalidValue(format!("{key}: bad codec entry '{entry}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if codecs.is_empty() {
        return Err(ConfigError::InvalidValue(format!("{key} must not be empty")));
    }
    Ok(codecs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("MEDIA_WORKER_POOL_SIZE".to_string(), "4".to_string()),
            ("MEDIA_RTC_MIN_PORT".to_string(), "40000".to_string()),
            ("MEDIA_RTC_MAX_PORT".to_string(), "49999".to_string()),
            (
                "MEDIA_INITIAL_OUTGOING_BITRATE".to_string(),
                "1000000".to_string(),
            ),
            (
                "MEDIA_MIN_OUTGOING_BITRATE".to_string(),
                "600000".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.rtc_min_port, 40000);
        assert_eq!(config.rtc_max_port, 49999);
        assert_eq!(config.initial_outgoing_bitrate, 1_000_000);
        assert_eq!(config.min_outgoing_bitrate, 600_000);
        assert_eq!(config.max_routers_per_worker, DEFAULT_MAX_ROUTERS_PER_WORKER);
        assert_eq!(config.worker_retry_seconds, DEFAULT_WORKER_RETRY_SECONDS);
        assert_eq!(config.ring_timeout_seconds, DEFAULT_RING_TIMEOUT_SECONDS);
        assert_eq!(config.max_active_calls, DEFAULT_MAX_ACTIVE_CALLS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.audio_codecs.len(), 1);
        assert_eq!(config.audio_codecs[0].mime_type, "audio/opus");
        assert_eq!(config.video_codecs.len(), 2);
        assert!(config.controller_id.starts_with("cc-"));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("MEDIA_MAX_ROUTERS_PER_WORKER".to_string(), "20".to_string());
        vars.insert("MEDIA_WORKER_RETRY_SECONDS".to_string(), "3".to_string());
        vars.insert("CALL_RING_TIMEOUT_SECONDS".to_string(), "30".to_string());
        vars.insert("CALL_MAX_ACTIVE_CALLS".to_string(), "100".to_string());
        vars.insert("CALL_CONTROLLER_ID".to_string(), "cc-custom-001".to_string());
        vars.insert(
            "MEDIA_VIDEO_CODECS".to_string(),
            "video/H264/90000, audio/opus/48000/2".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.max_routers_per_worker, 20);
        assert_eq!(config.ring_timeout_seconds, 30);
        assert_eq!(config.max_active_calls, 100);
        assert_eq!(config.controller_id, "cc-custom-001");
        assert_eq!(config.worker_retry_seconds, 3);
        assert_eq!(config.video_codecs[0].mime_type, "video/H264");
        assert_eq!(config.audio_codecs[0].mime_type, "audio/opus");
    }

    #[test]
    fn test_missing_required_values_fail_fast() {
        for key in [
            "MEDIA_WORKER_POOL_SIZE",
            "MEDIA_RTC_MIN_PORT",
            "MEDIA_RTC_MAX_PORT",
            "MEDIA_INITIAL_OUTGOING_BITRATE",
            "MEDIA_MIN_OUTGOING_BITRATE",
        ] {
            let mut vars = base_vars();
            vars.remove(key);
            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == key),
                "expected missing {key}"
            );
        }
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let mut vars = base_vars();
        vars.insert("MEDIA_WORKER_POOL_SIZE".to_string(), "four".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("MEDIA_WORKER_POOL_SIZE".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("MEDIA_RTC_MIN_PORT".to_string(), "50000".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("MEDIA_RTC_MIN_PORT".to_string(), "80".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("MEDIA_MIN_OUTGOING_BITRATE".to_string(), "2000000".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("CALL_RING_TIMEOUT_SECONDS".to_string(), "soon".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_codec_sets_validated() {
        let mut vars = base_vars();
        vars.insert("MEDIA_AUDIO_CODECS".to_string(), "video/VP8/90000".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("MEDIA_VIDEO_CODECS".to_string(), "audio/opus/48000/2".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("MEDIA_AUDIO_CODECS".to_string(), "opus".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_log_format_picked_up() {
        let mut vars = base_vars();
        vars.insert("LOG_FORMAT".to_string(), "json".to_string());
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.observability.json_logs);
    }
}
