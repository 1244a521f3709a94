//! Configuration file management
//!
//! Loads TOML configuration files and provides application settings.
//! Default config path: ~/.config/termlay/config.toml

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::command::codec::CodecKind;
use crate::loading::LoaderKind;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Overlay routine settings
    pub layer: LayerConfig,
}

/// Overlay routine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Command stream format: "json", "simple" or "bash"
    pub parser: String,
    /// Image loading strategy: "synchronous", "thread" or "process"
    pub loader: String,
    /// Suppress error records on stderr
    pub silent: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            parser: CodecKind::default().name().to_string(),
            loader: LoaderKind::default().name().to_string(),
            silent: false,
        }
    }
}

impl LayerConfig {
    /// The configured codec, falling back to the default on an unknown
    /// name.
    pub fn codec(&self) -> CodecKind {
        CodecKind::parse(&self.parser).unwrap_or_else(|| {
            warn!("unknown parser '{}' in config, using default", self.parser);
            CodecKind::default()
        })
    }

    pub fn loader_kind(&self) -> LoaderKind {
        LoaderKind::parse(&self.loader).unwrap_or_else(|| {
            warn!("unknown loader '{}' in config, using default", self.loader);
            LoaderKind::default()
        })
    }
}

impl Config {
    const SYSTEM_CONFIG_PATH: &'static str = "/etc/termlay/config.toml";

    /// Path the config would be loaded from, or None when only built-in
    /// defaults apply.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("TERMLAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("termlay").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        let system = PathBuf::from(Self::SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Some(system);
        }
        None
    }

    /// Load configuration with priority:
    /// 1. TERMLAY_CONFIG environment variable
    /// 2. ~/.config/termlay/config.toml (user config)
    /// 3. /etc/termlay/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(error) => {
                    warn!("Failed to load config {}: {error:#}", path.display());
                }
            }
        }
        Self::default()
    }

    fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_name_valid_choices() {
        let config = Config::default();
        assert_eq!(config.layer.codec(), CodecKind::Json);
        assert_eq!(config.layer.loader_kind(), LoaderKind::Thread);
        assert!(!config.layer.silent);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str("[layer]\nparser = \"bash\"\n").expect("valid toml");
        assert_eq!(config.layer.codec(), CodecKind::Bash);
        assert_eq!(config.layer.loader_kind(), LoaderKind::Thread);
    }

    #[test]
    fn unknown_names_fall_back() {
        let config: Config =
            toml::from_str("[layer]\nparser = \"xml\"\nloader = \"gpu\"\n").expect("valid toml");
        assert_eq!(config.layer.codec(), CodecKind::Json);
        assert_eq!(config.layer.loader_kind(), LoaderKind::Thread);
    }
}
