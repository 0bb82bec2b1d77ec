//! Shared fixtures for the station integration tests.

#![allow(dead_code)]

use rockmag_daq::config::Settings;
use rockmag_daq::measurement::{Axis, Vec3};
use rockmag_daq::sim::{SimEvent, SimWorld};
use rockmag_daq::specimen::{SampleInfo, SpecimenFile};
use rockmag_daq::station::Station;
use tempfile::TempDir;

/// Settings for a simulated station writing into `data_dir`.
pub fn test_settings(data_dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.application.data_dir = data_dir.path().to_path_buf();
    settings.magnetometer.settle_ms = 50;
    settings
}

/// A simulated station with a clean holder, plus the world it runs against.
pub fn sim_station(settings: Settings) -> (SimWorld, Station) {
    let world = SimWorld::new(&settings);
    world.set_holder(settings.calibration.holder);
    let station = Station::simulated(settings, &world).expect("Failed to build simulated station");
    (world, station)
}

/// A new specimen file in the station's data directory.
pub fn specimen(station: &Station, name: &str) -> SpecimenFile {
    let path = SpecimenFile::path_for(&station.settings.application.data_dir, name)
        .expect("Invalid specimen name");
    SpecimenFile::create(path, SampleInfo::named(name))
}

/// Whether `a` and `b` agree to `rel` of the larger magnitude.
pub fn close(a: Vec3, b: Vec3, rel: f64) -> bool {
    let scale = a.norm().max(b.norm()).max(f64::MIN_POSITIVE);
    Axis::ALL.into_iter().all(|axis| (a[axis] - b[axis]).abs() <= rel * scale)
}

/// Quarter turns of every data latch taken at the measurement position.
pub fn measurement_latches(world: &SimWorld, measurement_offset: i64) -> Vec<usize> {
    world
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::DataLatched { translation, quarter } if translation == measurement_offset => Some(quarter),
            _ => None,
        })
        .collect()
}
