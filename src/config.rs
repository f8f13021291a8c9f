use std::{str::FromStr, time::Duration};

use serde::Deserialize;
use vidlink_codec::{encoder::EncoderSettings, DEFAULT_MAX_CONSECUTIVE_ERRORS};

use crate::{error::ConfigError, queue::DEFAULT_QUEUE_CAPACITY, transport::retry::RetryPolicy};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/video";

/// Connection and stream parameters, owned by the embedding application.
///
/// Every field has a default so a partial JSON document is enough.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub endpoint: String,
    pub reconnect_delay_secs: f64,
    /// `-1` retries forever.
    pub max_retries: i64,
    pub backoff: bool,
    pub max_reconnect_delay_secs: f64,
    /// Frames of any other size are rescaled before encode.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: u32,
    pub bitrate: usize,
    pub hardware_encoder: bool,
    pub heartbeat_secs: f64,
    pub timeout_secs: f64,
    pub queue_capacity: usize,
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
    pub decode_error_threshold: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect_delay_secs: 3.0,
            max_retries: -1,
            backoff: false,
            max_reconnect_delay_secs: 30.0,
            width: None,
            height: None,
            fps: 30,
            bitrate: 10 << 20,
            hardware_encoder: false,
            heartbeat_secs: 10.0,
            timeout_secs: 10.0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            grace_period_ms: 1000,
            poll_interval_ms: 200,
            decode_error_threshold: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

impl StreamConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `VIDLINK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(endpoint) = lookup("VIDLINK_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_RECONNECT_DELAY")? {
            self.reconnect_delay_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_BACKOFF")? {
            self.backoff = v;
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_WIDTH")? {
            self.width = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_HEIGHT")? {
            self.height = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_FPS")? {
            self.fps = v;
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_BITRATE")? {
            self.bitrate = v;
        }
        if let Some(v) = parse_var(&lookup, "VIDLINK_QUEUE_CAPACITY")? {
            self.queue_capacity = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("endpoint is empty".to_string()));
        }
        if self.fps == 0 {
            return Err(ConfigError::Invalid("fps must be positive".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 1000 {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms must be within 1..=1000, got {}",
                self.poll_interval_ms
            )));
        }
        if self.max_retries < -1 {
            return Err(ConfigError::Invalid(format!(
                "max_retries must be -1 or non-negative, got {}",
                self.max_retries
            )));
        }
        match (self.width, self.height) {
            (Some(w), Some(h)) if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 => {
                Err(ConfigError::Invalid(format!(
                    "target size must be even and non-zero, got {}x{}",
                    w, h
                )))
            }
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::Invalid(
                "width and height must be set together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn target_size(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }

    pub fn reconnect_delay(&self) -> Duration {
        secs(self.reconnect_delay_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        secs(self.heartbeat_secs)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, 1000))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            reconnect_delay: self.reconnect_delay(),
            backoff: self.backoff,
            max_delay: secs(self.max_reconnect_delay_secs),
        }
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            bitrate: self.bitrate,
            hardware: self.hardware_encoder,
            ..Default::default()
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                key: key.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_reference_client() {
        let config = StreamConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.max_retries, -1);
        assert_eq!(config.retry_policy().max_retries, -1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{"endpoint": "ws://10.0.0.2:8000/ws/video", "max_retries": 3}"#;
        let config = StreamConfig::from_json(json).unwrap();
        assert_eq!(config.endpoint, "ws://10.0.0.2:8000/ws/video");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.fps, 30);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(StreamConfig::from_json(r#"{"poll_interval_ms": 5000}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"width": 641, "height": 480}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"width": 640}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"max_retries": -2}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"fps": "thirty"}"#).is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VIDLINK_ENDPOINT", "ws://relay:9000/ws/video"),
            ("VIDLINK_MAX_RETRIES", "5"),
            ("VIDLINK_WIDTH", "320"),
            ("VIDLINK_HEIGHT", " 240 "),
        ]);
        let config = StreamConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.endpoint, "ws://relay:9000/ws/video");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.target_size(), Some((320, 240)));
    }

    #[test]
    fn env_override_reports_bad_value() {
        let err = StreamConfig::default()
            .with_overrides(|k| (k == "VIDLINK_FPS").then(|| "fast".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Env {
                key: "VIDLINK_FPS".to_string(),
                value: "fast".to_string()
            }
        );
    }

    #[test]
    fn negative_seconds_clamp_to_zero() {
        let config = StreamConfig {
            reconnect_delay_secs: -1.0,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(), Duration::ZERO);
    }
}
