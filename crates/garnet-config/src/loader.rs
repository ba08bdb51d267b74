//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::settings::{GarnetConfig, LogConfig, Settings, TranslatorConfig, VmConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const PROJECT_CONFIG_FILE: &str = "garnet.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.garnet/config.toml) - lowest priority
/// 2. Project config (./garnet.toml) - overrides global
/// 3. Environment variables (GARNET_*) - overrides project
/// 4. CLI flags - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Merged file and environment configuration
    pub file: GarnetConfig,

    /// Directory where garnet.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use `path` instead of ~/.garnet/config.toml
    pub fn with_global_config_path(path: impl Into<PathBuf>) -> Self {
        Self {
            global_config_path: Some(path.into()),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find garnet.toml and layers it over
    /// the global config, then applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        self.layer(project_config, project_root)
    }

    /// Load configuration from a specific config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = GarnetConfig::load_from_file(config_path)?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.layer(project_config, project_root)
    }

    fn layer(
        &mut self,
        project_config: GarnetConfig,
        project_root: Option<PathBuf>,
    ) -> ConfigResult<Config> {
        // Global config is optional
        let mut file = self.load_global_config().unwrap_or_default();
        file.merge(&project_config);

        let overrides = env_overrides()?;
        file.merge(&overrides);
        file.validate()?;

        Ok(Config { file, project_root })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, GarnetConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let config = GarnetConfig::load_from_file(&config_path)?;
                return Ok((Some(current), config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, GarnetConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.garnet/config.toml
    fn load_global_config(&mut self) -> ConfigResult<GarnetConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = Self::global_config_dir()?.join("config.toml");
                self.global_config_path = Some(path.clone());
                path
            }
        };

        if !path.exists() {
            return Ok(GarnetConfig::default());
        }

        GarnetConfig::load_from_file(&path)
    }

    /// Get the global configuration directory (~/.garnet)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".garnet"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Resolved settings with defaults filled in
    pub fn settings(&self) -> Settings {
        self.file.resolve()
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a garnet.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

/// Collect overrides from the environment.
///
/// Variables follow the pattern GARNET_<SECTION>_<KEY>, e.g.
/// `GARNET_VM_MAX_FRAMES=500`. `GARNET_LOG` sets the log filter.
fn env_overrides() -> ConfigResult<GarnetConfig> {
    let mut translator = TranslatorConfig::default();
    let mut vm = VmConfig::default();

    translator.max_insns = env_parse("GARNET_TRANSLATOR_MAX_INSNS")?;
    translator.max_temps = env_parse("GARNET_TRANSLATOR_MAX_TEMPS")?;
    translator.fuse_compare_branch = env_bool("GARNET_TRANSLATOR_FUSE_COMPARE_BRANCH");
    translator.immediate_operands = env_bool("GARNET_TRANSLATOR_IMMEDIATE_OPERANDS");
    vm.max_frames = env_parse("GARNET_VM_MAX_FRAMES")?;
    vm.specialize = env_bool("GARNET_VM_SPECIALIZE");
    vm.profile = env_bool("GARNET_VM_PROFILE");
    vm.check_interrupts = env_bool("GARNET_VM_CHECK_INTERRUPTS");

    let filter = env::var("GARNET_LOG").ok();

    Ok(GarnetConfig {
        translator: (translator != TranslatorConfig::default()).then_some(translator),
        vm: (vm != VmConfig::default()).then_some(vm),
        log: filter.map(|filter| LogConfig {
            filter: Some(filter),
        }),
    })
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> ConfigResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                reason: format!("'{}' is not a number", raw),
            }),
        Err(_) => Ok(None),
    }
}
