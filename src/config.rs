//! Configuration for the input core
//!
//! Loads configuration from TOML file at `~/.config/area-dix/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::dix::CoreOptions;
use crate::dix::resource::MAX_CLIENTS;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location, or use defaults if the
    /// file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from `path`, writing a default file there first if
    /// it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            if let Err(e) = Self::save_default(path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("area-dix");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(1..=MAX_CLIENTS).contains(&self.limits.max_clients) {
            anyhow::bail!(
                "limits.max_clients must be between 1 and {}, got {}",
                MAX_CLIENTS,
                self.limits.max_clients
            );
        }
        Ok(())
    }

    /// Core tunables derived from the `limits` and `input` sections
    pub fn core_options(&self) -> CoreOptions {
        CoreOptions {
            max_clients: self.limits.max_clients,
            max_queued_events: self.limits.max_queued_events,
            implicit_grabs: self.input.implicit_grabs,
            focus_pointer_root: self.input.focus_follows_pointer_root,
        }
    }
}

/// Client and queue ceilings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Connectable clients, not counting the server
    pub max_clients: usize,
    /// Runs a frozen device may hold before new ones are dropped
    pub max_queued_events: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: 255,
            max_queued_events: 1024,
        }
    }
}

/// Input behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Grab the pointer for the client that receives a button press
    pub implicit_grabs: bool,
    /// Keyboards start with focus following the pointer
    pub focus_follows_pointer_root: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            implicit_grabs: true,
            focus_follows_pointer_root: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "area_dix=debug,info".into(),
        }
    }
}
