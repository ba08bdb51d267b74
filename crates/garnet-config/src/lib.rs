//! Garnet Configuration System
//!
//! Provides configuration management for the garnet translator and VM:
//! - Configuration files (`garnet.toml`, `~/.garnet/config.toml`)
//! - Environment overrides (`GARNET_*`)
//! - Resolution into the effective [`Settings`]
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.garnet/config.toml)
//! 2. Project config (./garnet.toml, searched upwards)
//! 3. Environment variables (GARNET_<SECTION>_<KEY>)
//! 4. CLI flags (applied by the caller on the resolved [`Settings`])
//!
//! # Example
//!
//! ```no_run
//! use garnet_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! let settings = config.settings();
//! assert!(settings.translator.max_insns > 0);
//! ```

pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use loader::{Config, ConfigLoader};
pub use settings::{
    GarnetConfig, LogConfig, Settings, TranslatorConfig, TranslatorSettings, VmConfig, VmSettings,
};
