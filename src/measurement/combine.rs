//! Count/analog combination.

use crate::config::CalibrationConstants;
use crate::measurement::Axis;

/// Flux count magnitude above which an axis must be upranged even when
/// flux counting.
pub const COUNT_LIMIT: i64 = 9900;

/// Convert a count and averaged analog value (both in flux quanta) to emu.
///
/// With flux counting enabled the whole-quantum count is added to the analog
/// value before scaling by the axis calibration constant.
pub fn combine(
    count: i64,
    analog_mean: f64,
    axis: Axis,
    flux_counting: bool,
    calibration: &CalibrationConstants,
) -> f64 {
    let flux = if flux_counting {
        analog_mean + count as f64
    } else {
        analog_mean
    };
    flux * calibration.for_axis(axis)
}

/// Whether a count read during a measurement means the axis range is too
/// sensitive: any count at all on a non-counting axis, or a count beyond
/// [`COUNT_LIMIT`].
pub fn needs_uprange(count: i64, flux_counting: bool) -> bool {
    (count != 0 && !flux_counting) || count.abs() > COUNT_LIMIT
}
