//! Layered configuration loading: defaults, TOML file, environment.

use nomic_ops::config::{ObservingConfig, DEFAULT_CONFIG_PATH};
use nomic_ops::device::simulated::FluxModel;
use nomic_ops::instruments::PztSource;
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
#[serial]
fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ObservingConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.setpoint.n_points, 5);
    assert_eq!(config.setpoint.half_range_deg, 360.0);
    assert_eq!(config.telescope.nod_throw, 2.3);
    assert_eq!(config.sequence.nod_positions, 4);
}

#[test]
#[serial]
fn test_file_overrides_only_given_keys() {
    let file = write_config(
        r#"
[setpoint]
n_img = 7
pzt = "NAC"

[telescope]
nod_throw = 1.5

[simulator.flux_model]
type = "quadratic"
null_setpoint = -40.0
curvature = 0.5
floor = 10.0
"#,
    );

    let config = ObservingConfig::load_from(file.path()).unwrap();
    assert_eq!(config.setpoint.n_img, 7);
    assert_eq!(config.setpoint.pzt, PztSource::Nac);
    assert_eq!(config.setpoint.n_points, 5);
    assert_eq!(config.telescope.nod_throw, 1.5);
    assert_eq!(config.telescope.off_throw, 5.0);
    assert_eq!(
        config.simulator.flux_model,
        FluxModel::Quadratic {
            null_setpoint: -40.0,
            curvature: 0.5,
            floor: 10.0,
        }
    );
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config("[camera]\nn_sequences_dark = 10\n");
    std::env::set_var("NOMIC_OPS_CAMERA__N_SEQUENCES_DARK", "42");
    let config = ObservingConfig::load_from(file.path());
    std::env::remove_var("NOMIC_OPS_CAMERA__N_SEQUENCES_DARK");
    assert_eq!(config.unwrap().camera.n_sequences_dark, 42);
}

#[test]
#[serial]
fn test_invalid_values_fail_validation() {
    let file = write_config("[setpoint]\nn_points = 4\n");
    let config = ObservingConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("n_points"));

    let file = write_config("[dither]\npattern_rad = [0.1, -0.1]\nframes_per_step = [10]\n");
    let config = ObservingConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_malformed_file_is_a_load_error() {
    let file = write_config("[setpoint]\nn_points = \"five\"\n");
    assert!(ObservingConfig::load_from(file.path()).is_err());
}

#[test]
#[serial]
fn test_shipped_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
    let config = ObservingConfig::load_from(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.dither.frames_per_step.len(), config.dither.pattern_rad.len());
}
