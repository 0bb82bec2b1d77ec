//! Angle and direction helpers.

use crate::measurement::Vec3;
use nalgebra::{Rotation3, Unit};

/// Reduce an angle in degrees to `[0, 360)`.
pub fn wrap_360(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Unit vector (north, east, down) for a declination/inclination pair in degrees.
pub fn dir_to_cart(declination: f64, inclination: f64) -> Vec3 {
    let (d, i) = (declination.to_radians(), inclination.to_radians());
    Vec3::new(i.cos() * d.cos(), i.cos() * d.sin(), i.sin())
}

/// Declination in `[0, 360)` and inclination in `[-90, 90]` of `v`, in degrees.
///
/// A zero vector has declination 0 and inclination 0.
pub fn cart_to_dir(v: Vec3) -> (f64, f64) {
    let horizontal = v.x.hypot(v.y);
    let declination = wrap_360(v.y.atan2(v.x).to_degrees());
    let inclination = v.z.atan2(horizontal).to_degrees();
    (declination, inclination)
}

/// Rotate `v` by `angle` degrees about `axis` (right-hand rule).
pub fn rotate_about(v: Vec3, axis: Vec3, angle: f64) -> Vec3 {
    let axis = Unit::new_normalize(axis.into_inner());
    Vec3::from(Rotation3::from_axis_angle(&axis, angle.to_radians()) * v.into_inner())
}

/// Horizontal unit vector pointing at `azimuth` degrees.
pub fn horizontal(azimuth: f64) -> Vec3 {
    dir_to_cart(azimuth, 0.0)
}
