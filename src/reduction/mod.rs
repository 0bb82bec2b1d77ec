//! Data reduction.
//!
//! Turns the raw readings of one measurement cycle into a corrected sample
//! moment with statistics, directions in every reference frame and the
//! diagnostic ratios. Pure computation: no I/O, no clock.

pub mod angles;
pub mod frames;
pub mod stats;

pub use angles::wrap_360;
pub use frames::Direction;
pub use stats::{NormalStatistics, NormalSums};

use crate::config::{CalibrationConstants, OrientationConfig};
use crate::measurement::{Axis, RawMeasurement, Vec3};
use crate::specimen::SampleInfo;

/// Guards every ratio against division by zero.
pub const EPSILON: f64 = 1e-15;

/// Inputs besides the raw data.
#[derive(Debug, Clone, Copy)]
pub struct ReductionContext<'a> {
    /// Holder moment and emu conversion
    pub calibration: &'a CalibrationConstants,
    /// Frame conventions
    pub orientation: &'a OrientationConfig,
    /// Specimen orientation and size
    pub sample: &'a SampleInfo,
}

/// Reduced result of one measurement cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    /// Per-axis statistics in sample coordinates
    pub statistics: NormalStatistics,
    /// Percent error per axis
    pub percent_error: Vec3,
    /// Total moment (emu)
    pub total_moment: f64,
    /// Total moment over sample size
    pub magnetization: f64,
    /// Core-frame direction
    pub core: Direction,
    /// Geographic direction
    pub in_situ: Direction,
    /// Tilt-corrected direction
    pub stratigraphic: Direction,
    /// Total moment over noise
    pub signal_to_noise: f64,
    /// Total moment over background drift
    pub signal_to_drift: f64,
    /// Total moment over holder moment
    pub signal_to_holder: f64,
}

/// Reduce one cycle.
pub fn reduce(raw: &RawMeasurement, ctx: &ReductionContext<'_>) -> Reduction {
    let statistics = normal_statistics(raw, ctx.calibration.holder);
    let mean = statistics.mean;
    let sigma = statistics.sigma;

    let total_moment = mean.norm();
    let magnetization = if ctx.sample.size > 0.0 {
        total_moment / ctx.sample.size
    } else {
        0.0
    };
    let mut percent_error = Vec3::ZERO;
    for axis in Axis::ALL {
        percent_error[axis] = 100.0 * sigma[axis] / (mean[axis].abs() + EPSILON);
    }

    let core = frames::core_direction(mean, ctx.orientation);
    let in_situ = frames::in_situ_direction(core, ctx.sample, ctx.orientation);
    let stratigraphic = frames::stratigraphic_direction(in_situ, ctx.sample, ctx.orientation);

    Reduction {
        statistics,
        percent_error,
        total_moment,
        magnetization,
        core,
        in_situ,
        stratigraphic,
        signal_to_noise: total_moment / (sigma.norm() + EPSILON),
        signal_to_drift: total_moment / (raw.background.drift().norm() + EPSILON),
        signal_to_holder: total_moment / (ctx.calibration.holder.norm() + EPSILON),
    }
}

/// Holder and drift correction followed by per-sample-axis statistics.
pub fn normal_statistics(raw: &RawMeasurement, holder: Vec3) -> NormalStatistics {
    let count = raw.readings.len();
    let mut sums = NormalSums::new();
    for (index, reading) in raw.readings.iter().enumerate() {
        let corrected = stats::correct_reading(reading, index, count, &raw.background, holder);
        sums.extend(&stats::sample_components(
            corrected,
            reading.rotation,
            raw.orientation,
            raw.axes,
        ));
    }
    sums.statistics()
}
