//! Tests for config file resolution and TOML loading

use serde::Deserialize;
use serial_test::serial;
use sonance_common::config::{load_toml_file, resolve_config_path};
use sonance_common::Error;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

const ENV_VAR: &str = "SONANCE_TEST_CONFIG";

#[derive(Debug, Deserialize, PartialEq)]
struct Sample {
    rate: u32,
    #[serde(default)]
    name: Option<String>,
}

#[test]
#[serial]
fn test_cli_argument_wins() {
    std::env::set_var(ENV_VAR, "/from/env.toml");
    let resolved = resolve_config_path(Some(Path::new("/from/cli.toml")), ENV_VAR, "sonance-test");
    std::env::remove_var(ENV_VAR);

    assert_eq!(resolved.unwrap(), Path::new("/from/cli.toml"));
}

#[test]
#[serial]
fn test_environment_variable_used_without_cli() {
    std::env::set_var(ENV_VAR, "/from/env.toml");
    let resolved = resolve_config_path(None, ENV_VAR, "sonance-test");
    std::env::remove_var(ENV_VAR);

    assert_eq!(resolved.unwrap(), Path::new("/from/env.toml"));
}

#[test]
#[serial]
fn test_empty_environment_variable_ignored() {
    std::env::set_var(ENV_VAR, "");
    let resolved = resolve_config_path(None, ENV_VAR, "sonance-test-app-that-does-not-exist");
    std::env::remove_var(ENV_VAR);

    assert!(resolved.is_none());
}

#[test]
fn test_load_toml_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "rate = 48000\nname = \"studio\"").unwrap();

    let sample: Sample = load_toml_file(file.path()).unwrap();
    assert_eq!(
        sample,
        Sample {
            rate: 48000,
            name: Some("studio".to_string())
        }
    );
}

#[test]
fn test_load_toml_file_parse_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "rate = \"not a number\"").unwrap();

    let result: Result<Sample, Error> = load_toml_file(file.path());
    assert!(matches!(result, Err(Error::Toml(_))));
}

#[test]
fn test_load_toml_file_missing() {
    let result: Result<Sample, Error> = load_toml_file(Path::new("/nonexistent/sonance.toml"));
    assert!(matches!(result, Err(Error::Config(_))));
}
