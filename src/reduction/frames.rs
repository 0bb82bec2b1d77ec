//! Reference frame rotations.
//!
//! Directions move through four frames: instrument (magnetometer axes, sample
//! axes after the step table), core (corrected for how the sample sits in the
//! holder), in situ (geographic, from the core azimuth and plunge) and
//! stratigraphic (bedding restored to horizontal).

use super::angles::{cart_to_dir, dir_to_cart, horizontal, rotate_about, wrap_360};
use crate::config::OrientationConfig;
use crate::measurement::Vec3;
use crate::specimen::SampleInfo;
use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// Declination and inclination in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Direction {
    /// Declination, `[0, 360)`
    pub declination: f64,
    /// Inclination, `[-90, 90]`
    pub inclination: f64,
}

impl Direction {
    /// Direction of a Cartesian vector.
    pub fn of(v: Vec3) -> Self {
        let (declination, inclination) = cart_to_dir(v);
        Self {
            declination,
            inclination,
        }
    }

    /// Unit vector.
    pub fn to_cart(self) -> Vec3 {
        dir_to_cart(self.declination, self.inclination)
    }
}

/// A field azimuth corrected for magnetic declination when the orientation
/// convention says azimuths were taken with a magnetic compass.
pub fn true_azimuth(azimuth: f64, orientation: &OrientationConfig) -> f64 {
    if orientation.field_azimuths_magnetic {
        wrap_360(azimuth + orientation.magnetic_declination_deg)
    } else {
        wrap_360(azimuth)
    }
}

/// Instrument to core: a single rotation about Z by the calibrated angle.
pub fn core_direction(sample_moment: Vec3, orientation: &OrientationConfig) -> Direction {
    let instrument = Direction::of(sample_moment);
    Direction {
        declination: wrap_360(instrument.declination + orientation.instrument_to_core_deg),
        inclination: instrument.inclination,
    }
}

/// Core to in situ: tilt by the core plunge about Y, then turn by the core azimuth.
pub fn in_situ_direction(core: Direction, sample: &SampleInfo, orientation: &OrientationConfig) -> Direction {
    let tilt = Rotation3::from_axis_angle(&Vector3::y_axis(), -sample.core_plunge.to_radians());
    let v = Vec3::from(tilt * core.to_cart().into_inner());

    let (declination, inclination) = cart_to_dir(v);
    Direction {
        declination: wrap_360(declination + true_azimuth(sample.core_azimuth, orientation)),
        inclination,
    }
}

/// In situ to stratigraphic.
///
/// A plunging fold is first straightened by rotating about the horizontal
/// axis normal to the hinge by the hinge plunge. The bedding pole, carried
/// through that rotation, is then brought to vertical by rotating about the
/// bedding strike; overturned beds rotate a further 180°.
pub fn stratigraphic_direction(
    in_situ: Direction,
    sample: &SampleInfo,
    orientation: &OrientationConfig,
) -> Direction {
    let dip_direction = true_azimuth(sample.bedding_dip_direction, orientation);
    let mut v = in_situ.to_cart();
    let mut pole = dir_to_cart(dip_direction + 180.0, 90.0 - sample.bedding_dip);

    if sample.fold_plunge != 0.0 {
        let hinge = true_azimuth(sample.fold_hinge_azimuth, orientation);
        let axis = horizontal(hinge + 90.0);
        v = rotate_about(v, axis, sample.fold_plunge);
        pole = rotate_about(pole, axis, sample.fold_plunge);
    }

    let (pole_azimuth, pole_plunge) = cart_to_dir(pole);
    let mut angle = 90.0 - pole_plunge;
    if sample.overturned {
        angle += 180.0;
    }
    let strike = horizontal(pole_azimuth - 90.0);
    Direction::of(rotate_about(v, strike, angle))
}
