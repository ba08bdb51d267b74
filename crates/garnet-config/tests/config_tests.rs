//! Configuration loading and precedence tests

use garnet_config::{ConfigError, ConfigLoader, GarnetConfig, Settings};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

// ============================================================================
// Precedence
// ============================================================================

#[test]
#[serial]
fn test_project_overrides_global_per_field() {
    let temp_dir = TempDir::new().unwrap();
    let global = write(
        temp_dir.path(),
        "global.toml",
        "[translator]\nmax_insns = 100\nmax_temps = 50\n\n[log]\nfilter = \"info\"\n",
    );
    let project_dir = temp_dir.path().join("project");
    fs::create_dir(&project_dir).unwrap();
    write(&project_dir, "garnet.toml", "[translator]\nmax_temps = 60\n");

    let mut loader = ConfigLoader::with_global_config_path(global);
    let settings = loader.load_from_directory(&project_dir).unwrap().settings();

    assert_eq!(settings.translator.max_insns, 100);
    assert_eq!(settings.translator.max_temps, 60);
    assert_eq!(settings.log_filter, "info");
}

#[test]
#[serial]
fn test_no_config_anywhere_gives_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("missing.toml"));
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(!config.is_project());
    assert_eq!(config.settings(), Settings::default());
}

#[test]
#[serial]
fn test_load_from_specific_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = write(temp_dir.path(), "custom.toml", "[vm]\nprofile = true\n");

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("missing.toml"));
    let config = loader.load_from_file(&path).unwrap();

    assert!(config.settings().vm.profile);
    assert_eq!(config.project_root(), Some(temp_dir.path()));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_missing_file_is_not_found() {
    let err = GarnetConfig::load_from_file(Path::new("/nonexistent/garnet.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound(_)));
}

#[rstest]
#[case("[translator\nmax_insns = 1\n")]
#[case("[translator]\nmax_insns = \"many\"\n")]
#[case("[vm]\nmax_frames = -1\n")]
fn test_parse_errors(#[case] content: &str) {
    let temp_dir = TempDir::new().unwrap();
    let path = write(temp_dir.path(), "garnet.toml", content);
    let err = GarnetConfig::load_from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::TomlParseError { .. }));
}

#[rstest]
#[case("[translator]\nmax_insns = 0\n", "translator.max_insns")]
#[case("[translator]\nmax_temps = 0\n", "translator.max_temps")]
#[case("[vm]\nmax_frames = 0\n", "vm.max_frames")]
fn test_zero_limits(#[case] content: &str, #[case] field: &str) {
    let temp_dir = TempDir::new().unwrap();
    let path = write(temp_dir.path(), "garnet.toml", content);
    let err = GarnetConfig::load_from_file(&path).unwrap_err();
    match err {
        ConfigError::InvalidValue { field: f, .. } => assert_eq!(f, field),
        other => panic!("unexpected error: {other}"),
    }
}
