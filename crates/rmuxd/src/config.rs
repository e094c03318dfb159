//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Mode requested from devices during negotiation (1..=5). The
    /// USBMUXD_DEFAULT_DEVICE_MODE environment variable overrides this at
    /// decision time.
    #[serde(default = "UsbSettings::default_desired_mode")]
    pub desired_mode: u8,
    /// Gates both the device polling loop and hotplug add handling
    #[serde(default = "UsbSettings::default_auto_discover")]
    pub auto_discover: bool,
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl UsbSettings {
    fn default_desired_mode() -> u8 {
        1
    }

    fn default_auto_discover() -> bool {
        true
    }
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            desired_mode: Self::default_desired_mode(),
            auto_discover: Self::default_auto_discover(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings::default(),
            usb: UsbSettings::default(),
        }
    }
}

impl DaemonConfig {
    /// Default per-user config location, with a system-wide fallback.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rmuxd").join("rmuxd.toml")
        } else {
            PathBuf::from("/etc/rmuxd/rmuxd.toml")
        }
    }

    /// Load from an explicit path or the default location.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(Self::default_path);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default locations, falling back to built-in defaults.
    pub fn load_or_default() -> Self {
        for path in [Self::default_path(), PathBuf::from("/etc/rmuxd/rmuxd.toml")] {
            if path.exists() {
                match Self::load(Some(path.clone())) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Ignoring config at {}: {:#}", path.display(), e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Write the configuration out as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.usb.desired_mode) {
            return Err(anyhow!(
                "usb.desired_mode must be between 1 and 5, got {}",
                self.usb.desired_mode
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.usb.desired_mode, 1);
        assert!(config.usb.auto_discover);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_mode() {
        let mut config = DaemonConfig::default();
        config.usb.desired_mode = 0;
        assert!(config.validate().is_err());
        config.usb.desired_mode = 6;
        assert!(config.validate().is_err());
        config.usb.desired_mode = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_roundtrip() {
        let config = DaemonConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.usb.desired_mode, config.usb.desired_mode);
        assert_eq!(parsed.daemon.log_level, config.daemon.log_level);
    }
}
