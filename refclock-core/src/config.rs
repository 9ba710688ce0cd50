//! Clock configuration
//!
//! Loaded from `<config_dir>/refclock/config.json`. Every field has a
//! default, so a missing file or a partial file are both fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::clock::MAX_DELAY_PERCENT;

/// Which vblank source to track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// DRM on Linux, nothing elsewhere
    Auto,
    Drm,
    Timer,
    /// Raw counter only
    None,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "drm" => Ok(Self::Drm),
            "timer" => Ok(Self::Timer),
            "none" | "off" => Ok(Self::None),
            other => Err(ConfigError::Invalid(format!("unknown backend {:?}", other))),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub backend: Backend,
    /// DRM card node
    pub drm_device: PathBuf,
    /// CRTC index to track; first active one when unset
    pub drm_crtc: Option<u32>,
    /// Refresh rate of the timer backend
    pub timer_refresh_hz: u32,
    /// How long `wait()` blocks for a vblank, in percent of one interval
    pub max_delay_percent: u32,
    /// Source considered dead after this long without a vblank
    pub stall_timeout_ms: u64,
    /// Default bound for `wait_started`
    pub start_timeout_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            drm_device: PathBuf::from("/dev/dri/card0"),
            drm_crtc: None,
            timer_refresh_hz: 60,
            max_delay_percent: MAX_DELAY_PERCENT,
            stall_timeout_ms: 1000,
            start_timeout_ms: 2000,
        }
    }
}

impl ClockConfig {
    /// Load from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the user config directory, defaults if there is no file
    pub fn load_default() -> Result<Self, ConfigError> {
        match config_file_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_refresh_hz == 0 {
            return Err(ConfigError::Invalid("timer_refresh_hz must be positive".into()));
        }
        if self.max_delay_percent < 100 {
            return Err(ConfigError::Invalid(
                "max_delay_percent must be at least 100".into(),
            ));
        }
        if self.stall_timeout_ms == 0 {
            return Err(ConfigError::Invalid("stall_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// `<config_dir>/refclock/config.json`
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("refclock").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "backend": "timer", "timer_refresh_hz": 50 }"#).unwrap();

        let config = ClockConfig::load(&path).unwrap();
        assert_eq!(config.backend, Backend::Timer);
        assert_eq!(config.timer_refresh_hz, 50);
        assert_eq!(config.max_delay_percent, 120);
        assert_eq!(config.drm_device, PathBuf::from("/dev/dri/card0"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = ClockConfig {
            backend: Backend::Drm,
            drm_crtc: Some(1),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ClockConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{ "max_delay_percent": 80 }"#).unwrap();
        assert!(matches!(ClockConfig::load(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, r#"{ "backend": "vulkan" }"#).unwrap();
        assert!(matches!(ClockConfig::load(&path), Err(ConfigError::Parse(_))));

        let missing = dir.path().join("missing.json");
        assert!(matches!(ClockConfig::load(&missing), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("DRM".parse::<Backend>().unwrap(), Backend::Drm);
        assert_eq!("off".parse::<Backend>().unwrap(), Backend::None);
        assert!("glx".parse::<Backend>().is_err());
    }
}
