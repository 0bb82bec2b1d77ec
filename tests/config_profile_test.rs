//! Station profile loading and saving.

use rockmag_daq::config::{DeviceMode, RotationMode, Settings};
use rockmag_daq::measurement::{Axis, Vec3};
use rockmag_daq::protocol::Range;
use std::fs;
use tempfile::TempDir;

#[test]
fn missing_profile_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings, Settings::default());
    settings.validate().unwrap();
}

#[test]
fn partial_profile_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("station.toml");
    fs::write(
        &path,
        r#"
        [application]
        log_level = "debug"

        [magnetometer.y]
        enabled = false

        [demagnetizer]
        mode = "manual"

        [measure]
        rotation_mode = "multiple"
        rotations = 3
        "#,
    )
    .unwrap();

    let settings = Settings::load_from(&path).unwrap();
    assert_eq!(settings.application.log_level, "debug");
    assert!(!settings.magnetometer.axis(Axis::Y).enabled);
    assert_eq!(settings.demagnetizer.mode, DeviceMode::Manual);
    assert_eq!(settings.measure.rotation_mode, RotationMode::Multiple);
    assert_eq!(settings.measure.rotations, 3);
    assert_eq!(settings.handler.positions.measurement, 40_000);
    settings.validate().unwrap();
}

#[test]
fn saved_profile_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("profiles").join("station.toml");

    let mut settings = Settings::default();
    settings.calibration.holder = Vec3::new(1.5e-8, -2.0e-9, 3.0e-8);
    settings.calibration.emu_per_flux = Vec3::new(-1.9e-5, -2.1e-5, -1.05e-5);
    settings.magnetometer.axis_mut(Axis::Z).range = Range::X100;
    settings.magnetometer.axis_mut(Axis::Z).flux_counting = true;
    settings.save(&path).unwrap();

    let loaded = Settings::load_from(&path).unwrap();
    assert_eq!(loaded, settings);
}

#[test]
fn malformed_profile_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[measure\nrotations = ").unwrap();
    assert!(Settings::load_from(&path).is_err());
}

#[test]
fn single_axis_magnetometer_is_rejected() {
    let mut settings = Settings::default();
    settings.magnetometer.axis_mut(Axis::X).enabled = false;
    settings.magnetometer.axis_mut(Axis::Y).enabled = false;
    assert!(settings.validate().is_err());
}

#[test]
fn shipped_profile_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/rockmag.toml");
    let settings = Settings::load_from(path).unwrap();
    settings.validate().unwrap();

    let defaults = Settings::default();
    assert_eq!(settings.handler, defaults.handler);
    assert_eq!(settings.calibration, defaults.calibration);
    assert_eq!(settings.sequence, defaults.sequence);
}
