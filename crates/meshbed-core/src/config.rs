//! Harness configuration.
//!
//! Two layers live here: the harness's own TOML configuration (logging,
//! topology defaults, wait tuning) and the per-device configuration file
//! fetched from the device itself, which names its control port and log
//! directory.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Output format for harness logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unknown log format {other:?} (expected \"pretty\" or \"json\")"
            ))),
        }
    }
}

/// Top-level harness configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub general: GeneralConfig,
    pub topology: TopologyConfig,
    pub wait: WaitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Tracing filter directive, e.g. `info` or `meshbed_core=debug`.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Optional log file; stderr when absent.
    pub log_file: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologyConfig {
    /// Container network the entities attach to.
    pub network: String,
    /// Install prefix of the mesh stack inside each device.
    pub installdir: String,
    /// Directory holding the per-process log files.
    pub log_dir: String,
    /// Log file name prefix, `<prefix>_controller.log` and friends.
    pub log_prefix: String,
    /// Treat log files as pointer records naming the real file.
    pub pointer_records: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            network: "mesh-net".to_string(),
            installdir: "/opt/mesh".to_string(),
            log_dir: "/tmp/logs".to_string(),
            log_prefix: "mesh".to_string(),
            pointer_records: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitConfig {
    /// Poll interval for file-backed log waits, in milliseconds.
    pub poll_interval_ms: u64,
    /// Timeout for a single backend command, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300,
            command_timeout_secs: crate::backend::DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl HarnessConfig {
    /// Load and validate a configuration file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        if self.topology.network.is_empty() {
            return Err(ConfigError::Validation("topology.network must not be empty".into()).into());
        }
        if self.topology.log_prefix.is_empty() {
            return Err(
                ConfigError::Validation("topology.log_prefix must not be empty".into()).into(),
            );
        }
        if self.wait.poll_interval_ms == 0 {
            return Err(
                ConfigError::Validation("wait.poll_interval_ms must be positive".into()).into(),
            );
        }
        if self.wait.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "wait.command_timeout_secs must be positive".into(),
            )
            .into());
        }
        Ok(())
    }
}

/// Configuration fetched from a device's own config file.
///
/// The file is a flat `key=value` listing; only the keys the harness needs
/// are extracted. Both required keys must be present and well-formed or the
/// device cannot be attached at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// TCP port of the device's control listener.
    pub ucc_listener_port: u16,
    /// Directory the device writes its log files to.
    pub log_folder: String,
}

impl RemoteConfig {
    /// Parse the device config `content`. `path_label` names the source file
    /// in errors.
    pub fn parse(path_label: &str, content: &str) -> Result<Self> {
        let port_raw = value_of(content, "ucc_listener_port").ok_or_else(|| {
            ConfigError::MissingKey {
                key: "ucc_listener_port".to_string(),
                path: path_label.to_string(),
            }
        })?;
        let ucc_listener_port =
            port_raw
                .parse::<u16>()
                .map_err(|_| ConfigError::MalformedValue {
                    key: "ucc_listener_port".to_string(),
                    path: path_label.to_string(),
                    value: port_raw.to_string(),
                })?;

        let log_folder = value_of(content, "log_files_path")
            .ok_or_else(|| ConfigError::MissingKey {
                key: "log_files_path".to_string(),
                path: path_label.to_string(),
            })?
            .to_string();

        Ok(Self {
            ucc_listener_port,
            log_folder,
        })
    }
}

/// First `key=value` assignment of `key` in a flat config listing.
fn value_of<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let line = line.trim();
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.topology.log_prefix, "mesh");
        assert_eq!(config.wait.poll_interval_ms, 300);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: HarnessConfig = toml::from_str(
            r#"
            [topology]
            network = "mesh-net-7"

            [wait]
            poll_interval_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.topology.network, "mesh-net-7");
        assert_eq!(config.topology.installdir, "/opt/mesh");
        assert_eq!(config.wait.poll_interval_ms, 100);
        assert_eq!(config.wait.command_timeout_secs, 30);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: std::result::Result<HarnessConfig, _> = toml::from_str(
            r#"
            [general]
            log_levle = "debug"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn zero_poll_interval_fails_validation() {
        let mut config = HarnessConfig::default();
        config.wait.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_format_round_trips_through_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn remote_config_extracts_both_keys() {
        let content = "\
            # device config\n\
            management_mode=Multi-AP-Controller-and-Agent\n\
            ucc_listener_port=8002\n\
            log_files_path=/var/log/mesh\n";
        let config = RemoteConfig::parse("beerocks_agent.conf", content).unwrap();
        assert_eq!(config.ucc_listener_port, 8002);
        assert_eq!(config.log_folder, "/var/log/mesh");
    }

    #[test]
    fn remote_config_missing_port_names_key_and_file() {
        let err = RemoteConfig::parse("agent.conf", "log_files_path=/tmp").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("ucc_listener_port"), "got: {message}");
        assert!(message.contains("agent.conf"), "got: {message}");
    }

    #[test]
    fn remote_config_rejects_non_numeric_port() {
        let content = "ucc_listener_port=eight\nlog_files_path=/tmp\n";
        let err = RemoteConfig::parse("agent.conf", content).unwrap_err();
        assert!(err.to_string().contains("eight"));
    }

    #[test]
    fn value_of_takes_first_assignment_and_trims() {
        let content = "  key = first \nkey=second\n";
        assert_eq!(value_of(content, "key"), Some("first"));
        assert_eq!(value_of(content, "absent"), None);
    }
}
