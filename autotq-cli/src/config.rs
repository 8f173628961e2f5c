//! Configuration file support for autotq.
//!
//! Configuration is loaded from multiple sources with the following priority
//! (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (AUTOTQ_*)
//! 3. Local config file (./autotq.toml)
//! 4. Global config file (~/.config/autotq/config.toml)

use {
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g. "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate override for the device protocol.
    pub baud: Option<u32>,
}

/// Production session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductionConfig {
    /// Stage label recorded with backend registrations.
    pub stage: Option<String>,
    /// Extra log-line substrings that count as battery faults.
    #[serde(default)]
    pub fault_patterns: Vec<String>,
    /// Matching lines before a device is paused.
    pub fault_threshold: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Production session settings.
    #[serde(default)]
    pub production: ProductionConfig,
    /// Audio directory override.
    pub audio_dir: Option<PathBuf>,
    /// Firmware directory override.
    pub firmware_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global_config) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global_config);
                }
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new("autotq.toml")) {
            debug!("Loaded local config from autotq.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "autotq").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.production.stage.is_some() {
            self.production.stage = other.production.stage;
        }
        if other.production.fault_threshold.is_some() {
            self.production.fault_threshold = other.production.fault_threshold;
        }
        self.production
            .fault_patterns
            .extend(other.production.fault_patterns);
        if other.audio_dir.is_some() {
            self.audio_dir = other.audio_dir;
        }
        if other.firmware_dir.is_some() {
            self.firmware_dir = other.firmware_dir;
        }
    }

    /// Baud rate after applying the config override. The CLI default of
    /// 115200 yields to a configured rate; an explicit CLI value wins.
    pub fn effective_baud(&self, cli_baud: u32) -> u32 {
        if cli_baud != 115200 {
            return cli_baud;
        }
        self.connection.baud.unwrap_or(cli_baud)
    }

    /// Missing-battery fault signature with config overrides applied.
    pub fn fault_config(&self) -> autotq::production::FaultConfig {
        let mut fault = autotq::production::FaultConfig::default();
        fault
            .substrings
            .extend(self.production.fault_patterns.iter().cloned());
        if let Some(threshold) = self.production.fault_threshold {
            fault.threshold = threshold;
        }
        fault
    }

    /// Stage label with the config override applied.
    pub fn stage(&self) -> autotq::backend::StageLabel {
        match self.production.stage.as_deref() {
            Some("post_thermal") => autotq::backend::StageLabel::PostThermal,
            _ => autotq::backend::StageLabel::Factory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_empty() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.production.stage.is_none());
        assert!(config.production.fault_patterns.is_empty());
        assert!(config.audio_dir.is_none());
    }

    #[test]
    fn merge_prefers_other_when_set() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyACM0".to_string());
        base.connection.baud = Some(115200);

        let mut other = Config::default();
        other.connection.baud = Some(921600);
        other.audio_dir = Some(PathBuf::from("/srv/audio"));

        base.merge(other);
        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.connection.baud, Some(921600));
        assert_eq!(base.audio_dir, Some(PathBuf::from("/srv/audio")));
    }

    #[test]
    fn merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.serial = Some("COM3".to_string());

        base.merge(Config::default());
        assert_eq!(base.connection.serial.as_deref(), Some("COM3"));
    }

    #[test]
    fn merge_extends_fault_patterns() {
        let mut base = Config::default();
        base.production.fault_patterns.push("brownout".to_string());

        let mut other = Config::default();
        other
            .production
            .fault_patterns
            .push("watchdog reset".to_string());

        base.merge(other);
        assert_eq!(base.production.fault_patterns.len(), 2);
    }

    #[test]
    fn effective_baud_prefers_explicit_cli() {
        let mut config = Config::default();
        config.connection.baud = Some(921600);
        assert_eq!(config.effective_baud(230400), 230400);
        assert_eq!(config.effective_baud(115200), 921600);

        let empty = Config::default();
        assert_eq!(empty.effective_baud(115200), 115200);
    }

    #[test]
    fn fault_config_applies_overrides() {
        let mut config = Config::default();
        config.production.fault_patterns.push("brownout".to_string());
        config.production.fault_threshold = Some(5);

        let fault = config.fault_config();
        assert_eq!(fault.threshold, 5);
        assert!(fault.substrings.iter().any(|p| p == "brownout"));
        // Defaults are kept, overrides extend them.
        assert!(fault.substrings.len() > 1);
    }

    #[test]
    fn stage_parses_post_thermal() {
        let mut config = Config::default();
        assert_eq!(config.stage(), autotq::backend::StageLabel::Factory);

        config.production.stage = Some("post_thermal".to_string());
        assert_eq!(config.stage(), autotq::backend::StageLabel::PostThermal);
    }

    #[test]
    fn config_from_toml() {
        let toml_str = r#"
audio_dir = "sounds"

[connection]
serial = "/dev/ttyACM0"
baud = 921600

[production]
stage = "post_thermal"
fault_patterns = ["brownout"]
fault_threshold = 4
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(921600));
        assert_eq!(config.production.stage.as_deref(), Some("post_thermal"));
        assert_eq!(config.production.fault_patterns, vec!["brownout"]);
        assert_eq!(config.production.fault_threshold, Some(4));
        assert_eq!(config.audio_dir, Some(PathBuf::from("sounds")));
    }

    #[test]
    fn config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.serial.is_none());
        assert!(config.production.fault_patterns.is_empty());
    }

    #[test]
    fn config_roundtrip_toml() {
        let mut config = Config::default();
        config.connection.serial = Some("COM3".to_string());
        config.connection.baud = Some(460800);
        config.firmware_dir = Some(PathBuf::from("fw"));

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.connection.serial.as_deref(), Some("COM3"));
        assert_eq!(deserialized.connection.baud, Some(460800));
        assert_eq!(deserialized.firmware_dir, Some(PathBuf::from("fw")));
    }

    #[test]
    fn load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        fs::write(
            &path,
            r#"
[connection]
serial = "/dev/ttyUSB1"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn load_from_path_nonexistent_returns_default() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn global_config_path_names_autotq() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("autotq"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
