//! Configuration file support for flashpilot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FLASHPILOT_*)
//! 3. Local config file (./flashpilot.toml)
//! 4. Global config file (~/.config/flashpilot/config.toml)
//!
//! An explicit `--config PATH` replaces 3 and 4.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use flashpilot::BoardFamily;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "flashpilot.toml";

/// Board selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board family (e.g. "serial-reset", "dfu-coprocessor").
    pub family: Option<BoardFamily>,
}

/// Port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
}

/// Uploader tool location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directory holding the uploader binaries and `firmwares/`.
    pub dir: Option<PathBuf>,
}

/// Version check settings for one firmware domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComplianceConfig {
    /// Marker expected in an up-to-date firmware.
    pub marker: Option<String>,
    /// Number of bytes to read back.
    pub offset: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Board configuration.
    #[serde(default)]
    pub board: BoardConfig,
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Tool configuration.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Per-domain version checks, keyed by domain name.
    #[serde(default)]
    pub compliance: BTreeMap<String, ComplianceConfig>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        Self::load_layered(Self::global_config_path().as_deref(), Path::new(LOCAL_CONFIG_FILE))
    }

    fn load_layered(global: Option<&Path>, local: &Path) -> Self {
        let mut config = Self::default();

        if let Some(global_path) = global {
            if let Some(global_config) = Self::load_from_file(global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(local) {
            debug!("Loaded local config from {}", local.display());
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike the implicit locations, a file named explicitly must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific file, if present and valid.
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
        ProjectDirs::from("", "", "flashpilot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.board.family.is_some() {
            self.board.family = other.board.family;
        }
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.tools.dir.is_some() {
            self.tools.dir = other.tools.dir;
        }

        for (domain, check) in other.compliance {
            let entry = self.compliance.entry(domain).or_default();
            if check.marker.is_some() {
                entry.marker = check.marker;
            }
            if check.offset.is_some() {
                entry.offset = check.offset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.board.family.is_none());
        assert!(config.port.serial.is_none());
        assert!(config.tools.dir.is_none());
        assert!(config.compliance.is_empty());
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides_set_fields() {
        let mut base = Config::default();
        base.port.serial = Some("/dev/ttyACM0".to_string());

        let mut other = Config::default();
        other.port.serial = Some("/dev/ttyACM1".to_string());
        other.board.family = Some(BoardFamily::DfuCoprocessor);

        base.merge(other);

        assert_eq!(base.port.serial.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(base.board.family, Some(BoardFamily::DfuCoprocessor));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.port.serial = Some("COM3".to_string());
        base.tools.dir = Some(PathBuf::from("/opt/tools"));

        base.merge(Config::default());

        assert_eq!(base.port.serial.as_deref(), Some("COM3"));
        assert_eq!(base.tools.dir.as_deref(), Some(Path::new("/opt/tools")));
    }

    #[test]
    fn test_config_merge_compliance_per_field() {
        let mut base = Config::default();
        base.compliance.insert(
            "radio".to_string(),
            ComplianceConfig {
                marker: Some("v2.2".to_string()),
                offset: Some(1024),
            },
        );

        let mut other = Config::default();
        other.compliance.insert(
            "radio".to_string(),
            ComplianceConfig {
                marker: Some("v2.3".to_string()),
                offset: None,
            },
        );
        other
            .compliance
            .insert("real-time-core".to_string(), ComplianceConfig::default());

        base.merge(other);

        assert_eq!(
            base.compliance["radio"],
            ComplianceConfig {
                marker: Some("v2.3".to_string()),
                offset: Some(1024),
            }
        );
        assert!(base.compliance.contains_key("real-time-core"));
    }

    // ---- TOML deserialization ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[board]
family = "dfu-coprocessor"

[port]
serial = "/dev/ttyACM0"

[tools]
dir = "/opt/flashpilot"

[compliance.radio]
marker = "ATP1BLE00R-1631C4439"
offset = 1024
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.board.family, Some(BoardFamily::DfuCoprocessor));
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.tools.dir.as_deref(), Some(Path::new("/opt/flashpilot")));
        assert_eq!(
            config.compliance["radio"].marker.as_deref(),
            Some("ATP1BLE00R-1631C4439")
        );
        assert_eq!(config.compliance["radio"].offset, Some(1024));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.board.family.is_none());
        assert!(config.compliance.is_empty());
    }

    #[test]
    fn test_config_rejects_unknown_family() {
        let result: std::result::Result<Config, _> = toml::from_str("[board]\nfamily = \"esp32\"\n");
        assert!(result.is_err());
    }

    // ---- Loading from disk ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[port]\nserial = \"/dev/ttyACM3\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyACM3"));
    }

    #[test]
    fn test_load_from_path_missing_is_error() {
        let dir = tempdir().unwrap();
        assert!(Config::load_from_path(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_load_from_path_invalid_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[port\nserial = ").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }

    #[test]
    fn test_local_overrides_global() {
        let dir = tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let local = dir.path().join("local.toml");
        fs::write(
            &global,
            "[board]\nfamily = \"adb-sketch\"\n[port]\nserial = \"COM1\"\n",
        )
        .unwrap();
        fs::write(&local, "[port]\nserial = \"COM7\"\n").unwrap();

        let config = Config::load_layered(Some(&global), &local);
        assert_eq!(config.board.family, Some(BoardFamily::AdbSketch));
        assert_eq!(config.port.serial.as_deref(), Some("COM7"));
    }

    #[test]
    fn test_broken_implicit_file_is_skipped() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("local.toml");
        fs::write(&local, "not = [valid").unwrap();

        let config = Config::load_layered(None, &local);
        assert!(config.port.serial.is_none());
    }

    // ---- global_config_path ----

    #[test]
    fn test_global_config_path_is_some() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("flashpilot"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
