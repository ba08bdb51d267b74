//! Configuration file contents and the resolved settings
//!
//! [`GarnetConfig`] mirrors the TOML file: every field is optional so
//! several files can be layered with [`GarnetConfig::merge`]. Resolution
//! fills the gaps with defaults and yields [`Settings`].

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Contents of a `garnet.toml` or global config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GarnetConfig {
    /// Stack-to-register translation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translator: Option<TranslatorConfig>,

    /// Dispatch loop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmConfig>,

    /// Diagnostics output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
}

/// `[translator]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct TranslatorConfig {
    /// Refuse routines with more stack instructions than this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_insns: Option<usize>,

    /// Refuse routines needing more temporaries than this
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_temps: Option<u32>,

    /// Fuse compares with a following conditional branch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuse_compare_branch: Option<bool>,

    /// Use immediate-operand instruction forms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate_operands: Option<bool>,
}

/// `[vm]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct VmConfig {
    /// Frame-stack depth limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frames: Option<usize>,

    /// Let generic instructions rewrite themselves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialize: Option<bool>,

    /// Collect an execution profile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<bool>,

    /// Poll the interrupt token at branches and calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_interrupts: Option<bool>,
}

/// `[log]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `"warn"` or `"garnet_runtime=debug"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Effective translator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorSettings {
    pub max_insns: usize,
    pub max_temps: u32,
    pub fuse_compare_branch: bool,
    pub immediate_operands: bool,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            max_insns: 1_000_000,
            max_temps: 65_535,
            fuse_compare_branch: true,
            immediate_operands: true,
        }
    }
}

/// Effective VM settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmSettings {
    pub max_frames: usize,
    pub specialize: bool,
    pub profile: bool,
    pub check_interrupts: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            max_frames: 10_000,
            specialize: true,
            profile: false,
            check_interrupts: true,
        }
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub translator: TranslatorSettings,
    pub vm: VmSettings,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            translator: TranslatorSettings::default(),
            vm: VmSettings::default(),
            log_filter: "warn".to_string(),
        }
    }
}

impl GarnetConfig {
    /// Load a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject zero limits and unparsable log filters
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(translator) = &self.translator {
            if translator.max_insns == Some(0) {
                return Err(zero_limit("translator.max_insns"));
            }
            if translator.max_temps == Some(0) {
                return Err(zero_limit("translator.max_temps"));
            }
        }

        if let Some(vm) = &self.vm {
            if vm.max_frames == Some(0) {
                return Err(zero_limit("vm.max_frames"));
            }
        }

        if let Some(filter) = self.log.as_ref().and_then(|l| l.filter.as_deref()) {
            if let Err(e) = EnvFilter::try_new(filter) {
                return Err(ConfigError::InvalidValue {
                    field: "log.filter".to_string(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Merge another config into this one.
    /// Other config takes precedence for every field it sets.
    pub fn merge(&mut self, other: &GarnetConfig) {
        if let Some(theirs) = &other.translator {
            let ours = self.translator.get_or_insert_with(Default::default);
            merge_field(&mut ours.max_insns, theirs.max_insns);
            merge_field(&mut ours.max_temps, theirs.max_temps);
            merge_field(&mut ours.fuse_compare_branch, theirs.fuse_compare_branch);
            merge_field(&mut ours.immediate_operands, theirs.immediate_operands);
        }
        if let Some(theirs) = &other.vm {
            let ours = self.vm.get_or_insert_with(Default::default);
            merge_field(&mut ours.max_frames, theirs.max_frames);
            merge_field(&mut ours.specialize, theirs.specialize);
            merge_field(&mut ours.profile, theirs.profile);
            merge_field(&mut ours.check_interrupts, theirs.check_interrupts);
        }
        if let Some(theirs) = &other.log {
            let ours = self.log.get_or_insert_with(Default::default);
            if theirs.filter.is_some() {
                ours.filter = theirs.filter.clone();
            }
        }
    }

    /// Fill every unset field with its default
    pub fn resolve(&self) -> Settings {
        let defaults = Settings::default();
        let translator = self.translator.clone().unwrap_or_default();
        let vm = self.vm.clone().unwrap_or_default();
        Settings {
            translator: TranslatorSettings {
                max_insns: translator
                    .max_insns
                    .unwrap_or(defaults.translator.max_insns),
                max_temps: translator
                    .max_temps
                    .unwrap_or(defaults.translator.max_temps),
                fuse_compare_branch: translator
                    .fuse_compare_branch
                    .unwrap_or(defaults.translator.fuse_compare_branch),
                immediate_operands: translator
                    .immediate_operands
                    .unwrap_or(defaults.translator.immediate_operands),
            },
            vm: VmSettings {
                max_frames: vm.max_frames.unwrap_or(defaults.vm.max_frames),
                specialize: vm.specialize.unwrap_or(defaults.vm.specialize),
                profile: vm.profile.unwrap_or(defaults.vm.profile),
                check_interrupts: vm
                    .check_interrupts
                    .unwrap_or(defaults.vm.check_interrupts),
            },
            log_filter: self
                .log
                .as_ref()
                .and_then(|l| l.filter.clone())
                .unwrap_or(defaults.log_filter),
        }
    }
}

fn merge_field<T: Copy>(ours: &mut Option<T>, theirs: Option<T>) {
    if theirs.is_some() {
        *ours = theirs;
    }
}

fn zero_limit(field: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: "must be greater than zero".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[translator]
max_insns = 5000
max_temps = 256
fuse_compare_branch = false
immediate_operands = true

[vm]
max_frames = 100
specialize = false
profile = true
check_interrupts = false

[log]
filter = "garnet_runtime=debug"
"#;

        let config: GarnetConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        let settings = config.resolve();
        assert_eq!(settings.translator.max_insns, 5000);
        assert!(!settings.translator.fuse_compare_branch);
        assert_eq!(settings.vm.max_frames, 100);
        assert!(settings.vm.profile);
        assert_eq!(settings.log_filter, "garnet_runtime=debug");
    }

    #[test]
    fn test_empty_config_resolves_to_defaults() {
        let config: GarnetConfig = toml::from_str("").unwrap();
        assert_eq!(config.resolve(), Settings::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<GarnetConfig, _> = toml::from_str("[vm]\nturbo = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = GarnetConfig {
            vm: Some(VmConfig {
                max_frames: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("vm.max_frames"));
    }

    #[test]
    fn test_bad_filter_rejected() {
        let config = GarnetConfig {
            log: Some(LogConfig {
                filter: Some("garnet_runtime=loud".to_string()),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_is_per_field() {
        let mut base = GarnetConfig {
            translator: Some(TranslatorConfig {
                max_insns: Some(10),
                max_temps: Some(20),
                ..Default::default()
            }),
            ..Default::default()
        };
        let other = GarnetConfig {
            translator: Some(TranslatorConfig {
                max_temps: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        };

        base.merge(&other);
        let translator = base.translator.unwrap();
        assert_eq!(translator.max_insns, Some(10));
        assert_eq!(translator.max_temps, Some(30));
    }
}
