use std::time::Duration;

use serde::Deserialize;

use crate::drop_policy::{DropThresholds, DEFAULT_DROP_THRESHOLD, DEFAULT_PFRAME_DROP_THRESHOLD};
use crate::error::OutputError;
use crate::transport::{ConnectTarget, Credentials};

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_MAX_SHUTDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfigInput {
    pub version: u32,
    pub destination: String,
    pub stream_key: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub encoder_name: String,
    pub drop_threshold_ms: Option<u64>,
    pub pframe_drop_threshold_ms: Option<u64>,
    pub max_shutdown_seconds: Option<u64>,
    pub autotune_enabled: bool,
    pub target_bitrate: Option<u32>,
    pub buffered_socket_mode: bool,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub version: u32,
    pub destination: String,
    pub stream_key: String,
    pub credentials: Option<Credentials>,
    pub encoder_name: String,
    pub thresholds: DropThresholds,
    pub max_shutdown: Duration,
    pub autotune_enabled: bool,
    /// kbps; `None` falls back to the encoder's own bitrate.
    pub target_bitrate: Option<u32>,
    pub buffered_socket_mode: bool,
    pub connect_timeout: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            destination: String::new(),
            stream_key: String::new(),
            credentials: None,
            encoder_name: String::new(),
            thresholds: DropThresholds::default(),
            max_shutdown: DEFAULT_MAX_SHUTDOWN,
            autotune_enabled: false,
            target_bitrate: None,
            buffered_socket_mode: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl OutputConfigInput {
    pub fn resolve(self) -> Result<OutputConfig, OutputError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(OutputError::ConfigInvalid(format!(
                "unsupported config version {}",
                version
            )));
        }

        let drop = self
            .drop_threshold_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DROP_THRESHOLD);
        let pframe = self
            .pframe_drop_threshold_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PFRAME_DROP_THRESHOLD);

        // Credentials only count when both halves are present.
        let credentials = match (self.username, self.password) {
            (Some(username), Some(password)) if !username.trim().is_empty() => Some(Credentials {
                username: username.trim().to_string(),
                password,
            }),
            _ => None,
        };

        Ok(OutputConfig {
            version,
            destination: self.destination.trim().to_string(),
            stream_key: self.stream_key.trim().to_string(),
            credentials,
            encoder_name: self.encoder_name.trim().to_string(),
            thresholds: DropThresholds::new(drop, pframe),
            max_shutdown: self
                .max_shutdown_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_MAX_SHUTDOWN),
            autotune_enabled: self.autotune_enabled,
            target_bitrate: self.target_bitrate.filter(|&kbps| kbps > 0),
            buffered_socket_mode: self.buffered_socket_mode,
            connect_timeout: self
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }
}

impl OutputConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, OutputError> {
        if input.trim().is_empty() {
            return Ok(OutputConfig::default());
        }
        let parsed: OutputConfigInput = toml::from_str(input)
            .map_err(|e| OutputError::ConfigInvalid(format!("invalid config TOML: {}", e)))?;
        parsed.resolve()
    }

    /// Checked at `start()`, before any connect attempt.
    pub fn validate(&self) -> Result<(), OutputError> {
        if self.destination.is_empty() {
            return Err(OutputError::ConfigInvalid("destination is empty".into()));
        }
        Ok(())
    }

    pub fn connect_target(&self) -> ConnectTarget {
        let mut client_name = format!("outflow/{}", env!("CARGO_PKG_VERSION"));
        if !self.encoder_name.is_empty() {
            client_name.push_str(&format!(" ({})", self.encoder_name));
        }
        ConnectTarget {
            uri: self.destination.clone(),
            stream_key: self.stream_key.clone(),
            credentials: self.credentials.clone(),
            client_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1
            destination = "tcp://127.0.0.1:1935/live"
            stream_key = "abc"
            username = "user"
            password = "secret"
            encoder_name = "x264"
            drop_threshold_ms = 700
            pframe_drop_threshold_ms = 1200
            max_shutdown_seconds = 3
            autotune_enabled = true
            target_bitrate = 6000
            buffered_socket_mode = true
            connect_timeout_ms = 2500
        "#;

        let cfg = OutputConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.destination, "tcp://127.0.0.1:1935/live");
        assert_eq!(cfg.credentials.as_ref().unwrap().username, "user");
        assert_eq!(cfg.thresholds.drop(), Duration::from_millis(700));
        assert_eq!(cfg.thresholds.pframe(), Duration::from_millis(1200));
        assert_eq!(cfg.max_shutdown, Duration::from_secs(3));
        assert!(cfg.autotune_enabled);
        assert_eq!(cfg.target_bitrate, Some(6000));
        assert!(cfg.buffered_socket_mode);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.connect_target().client_name, format!("outflow/{} (x264)", env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn defaults_match_stream_output_defaults() {
        let cfg = OutputConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.thresholds.drop(), Duration::from_millis(500));
        assert_eq!(cfg.thresholds.pframe(), Duration::from_millis(800));
        assert_eq!(cfg.max_shutdown, Duration::from_secs(5));
        assert!(!cfg.autotune_enabled);
        assert!(!cfg.buffered_socket_mode);
        assert!(cfg.target_bitrate.is_none());
    }

    #[test]
    fn pframe_threshold_is_raised() {
        let cfg = OutputConfig::from_toml_str("drop_threshold_ms = 900\npframe_drop_threshold_ms = 800").unwrap();
        assert_eq!(cfg.thresholds.pframe(), Duration::from_millis(1100));
    }

    #[test]
    fn half_credentials_are_ignored() {
        let cfg = OutputConfig::from_toml_str("username = \"only\"").unwrap();
        assert!(cfg.credentials.is_none());
    }

    #[test]
    fn empty_destination_fails_validation() {
        let cfg = OutputConfig::default();
        assert!(matches!(cfg.validate(), Err(OutputError::ConfigInvalid(_))));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = OutputConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, OutputError::ConfigInvalid(_)));
    }
}
