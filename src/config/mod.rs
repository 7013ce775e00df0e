//! Configuration file management
//!
//! Loads TOML configuration and provides launcher settings.
//! Config path: /etc/vtlaunch/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Launcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session settings
    pub session: SessionConfig,
    /// Compositor settings
    pub compositor: CompositorConfig,
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// PAM service name for the session bracket
    pub pam_service: String,
    /// Seat name used when picking the primary GPU
    pub seat: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pam_service: "login".to_string(),
            seat: "seat0".to_string(),
        }
    }
}

/// Compositor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Default compositor command line (program + arguments).
    /// Used when no command is given on the launcher command line.
    pub command: Vec<String>,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self { command: vec![] }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            compositor: CompositorConfig::default(),
        }
    }
}

impl Config {
    /// System-wide config path
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/vtlaunch/config.toml";

    /// Load configuration from the system path, falling back to built-in
    /// defaults. The binary may run setuid, so user-writable override paths
    /// (env vars, $HOME) are never consulted.
    pub fn load() -> Self {
        let system_config = std::path::Path::new(Self::SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            match Self::load_from_file(Self::SYSTEM_CONFIG_PATH) {
                Ok(config) => {
                    info!("Loaded config: {}", Self::SYSTEM_CONFIG_PATH);
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {}", Self::SYSTEM_CONFIG_PATH, e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from specified path
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.pam_service, "login");
        assert_eq!(config.session.seat, "seat0");
        assert!(config.compositor.command.is_empty());
    }

    #[test]
    fn test_parse_partial() {
        let config: Config = toml::from_str(
            r#"
[session]
pam_service = "greeter"

[compositor]
command = ["my-compositor", "--fullscreen"]
"#,
        )
        .unwrap();
        assert_eq!(config.session.pam_service, "greeter");
        // Unspecified keys keep their defaults
        assert_eq!(config.session.seat, "seat0");
        assert_eq!(config.compositor.command.len(), 2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nseat = \"seat1\"").unwrap();
        let config = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.session.seat, "seat1");
    }

    #[test]
    fn test_load_from_file_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session").unwrap();
        assert!(Config::load_from_file(file.path().to_str().unwrap()).is_err());
    }
}
