//! Settings resolution and logging setup for the CLI
//!
//! Precedence, lowest first: global config, project `garnet.toml` (or the
//! `--config` file), `GARNET_*` environment, command-line flags. The log
//! filter comes from `RUST_LOG` when set, otherwise `-v`, otherwise the
//! config.

use anyhow::{Context, Result};
use garnet_config::{ConfigLoader, Settings};
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub fn load(explicit: Option<&Path>) -> Result<Settings> {
    let mut loader = ConfigLoader::new();
    let config = match explicit {
        Some(path) => loader
            .load_from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            loader
                .load_from_directory(&cwd)
                .context("Failed to load project configuration")?
        }
    };
    if let Some(root) = &config.project_root {
        debug!(root = %root.display(), "Found project configuration");
    }
    Ok(config.settings())
}

/// Filter directive for the given verbosity, `None` leaves the config's.
fn verbosity_filter(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

pub fn log_filter(settings: &Settings, verbose: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directive = verbosity_filter(verbose).unwrap_or(&settings.log_filter);
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("warn"))
}

pub fn init_logging(settings: &Settings, verbose: u8) {
    // Logs go to stderr so program output stays clean
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(settings, verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_filter(0), None);
        assert_eq!(verbosity_filter(1), Some("info"));
        assert_eq!(verbosity_filter(2), Some("debug"));
        assert_eq!(verbosity_filter(9), Some("trace"));
    }

    #[test]
    fn test_explicit_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[vm]\nspecialize = false\nmax_frames = 64\n").unwrap();

        let settings = load(Some(&path)).unwrap();
        assert!(!settings.vm.specialize);
        assert_eq!(settings.vm.max_frames, 64);
        assert!(settings.translator.fuse_compare_branch);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
