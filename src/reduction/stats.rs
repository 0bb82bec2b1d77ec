//! Per-reading corrections and per-axis statistics.
//!
//! The sample turns with the handler, so which sample axis a magnetometer
//! axis sees depends on the rotation step `k` (quarter turns from home):
//!
//! | k | sample X | sample Y |
//! |---|----------|----------|
//! | 0 | +Mx      | +My      |
//! | 1 | +My      | -Mx      |
//! | 2 | -Mx      | -My      |
//! | 3 | -My      | +Mx      |
//!
//! Sample Z is always +Mz. A sample loaded inverted (−Z) is turned over about
//! its Y axis, which negates sample X and Z. Only axes the magnetometer
//! actually has contribute.
//!
//! The empty holder turns with the sample but is never inverted, so its
//! moment appears in the magnetometer frame as the inverse of the table above.

use crate::measurement::{Axis, AxisSet, Background, Reading, Vec3, ZOrientation};
use crate::motion::RotationPosition;

/// Holder moment as seen by the magnetometer at `rotation`.
pub fn holder_in_magnetometer_frame(holder: Vec3, rotation: RotationPosition) -> Vec3 {
    let (x, y) = match rotation.quarter() {
        0 => (holder.x, holder.y),
        1 => (-holder.y, holder.x),
        2 => (-holder.x, -holder.y),
        _ => (holder.y, -holder.x),
    };
    Vec3::new(x, y, holder.z)
}

/// Background interpolated at reading `index` of `count`.
///
/// The two background readings sit at virtual steps 0 and `count + 1`.
pub fn interpolated_background(background: &Background, index: usize, count: usize) -> Vec3 {
    let fraction = (index as f64 + 1.0) / (count as f64 + 1.0);
    background.before + background.drift() * fraction
}

/// A reading with holder and interpolated background removed.
pub fn correct_reading(
    reading: &Reading,
    index: usize,
    count: usize,
    background: &Background,
    holder: Vec3,
) -> Vec3 {
    reading.moment
        - interpolated_background(background, index, count)
        - holder_in_magnetometer_frame(holder, reading.rotation)
}

/// A sample-axis value derived from one magnetometer axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleComponent {
    /// Sample axis receiving the value
    pub sample_axis: Axis,
    /// Signed value
    pub value: f64,
}

/// Map a corrected magnetometer-frame reading to sample-axis components.
pub fn sample_components(
    moment: Vec3,
    rotation: RotationPosition,
    orientation: ZOrientation,
    axes: AxisSet,
) -> Vec<SampleComponent> {
    // (sample axis, source magnetometer axis, sign)
    let mapping: [(Axis, Axis, f64); 2] = match rotation.quarter() {
        0 => [(Axis::X, Axis::X, 1.0), (Axis::Y, Axis::Y, 1.0)],
        1 => [(Axis::X, Axis::Y, 1.0), (Axis::Y, Axis::X, -1.0)],
        2 => [(Axis::X, Axis::X, -1.0), (Axis::Y, Axis::Y, -1.0)],
        _ => [(Axis::X, Axis::Y, -1.0), (Axis::Y, Axis::X, 1.0)],
    };
    let flip = match orientation {
        ZOrientation::PlusZ => 1.0,
        ZOrientation::MinusZ => -1.0,
    };

    let mut out = Vec::with_capacity(3);
    for (sample_axis, source, sign) in mapping {
        if axes.contains(source) {
            let sign = if sample_axis == Axis::X { sign * flip } else { sign };
            out.push(SampleComponent {
                sample_axis,
                value: sign * moment[source],
            });
        }
    }
    if axes.contains(Axis::Z) {
        out.push(SampleComponent {
            sample_axis: Axis::Z,
            value: flip * moment.z,
        });
    }
    out
}

/// Running count, sum and sum of squares per sample axis.
///
/// Sums are taken about the first value seen on each axis, so identical
/// readings accumulate exact zeros and a constant signal has zero spread.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NormalSums {
    count: [u32; 3],
    shift: [f64; 3],
    sum: [f64; 3],
    sum_sq: [f64; 3],
}

impl NormalSums {
    /// Empty sums.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one value to `axis`.
    pub fn add(&mut self, axis: Axis, value: f64) {
        let i = axis.index();
        if self.count[i] == 0 {
            self.shift[i] = value;
        }
        let d = value - self.shift[i];
        self.count[i] += 1;
        self.sum[i] += d;
        self.sum_sq[i] += d * d;
    }

    /// Add every component.
    pub fn extend(&mut self, components: &[SampleComponent]) {
        for c in components {
            self.add(c.sample_axis, c.value);
        }
    }

    /// Mean, standard deviation and count per axis.
    pub fn statistics(&self) -> NormalStatistics {
        let mut stats = NormalStatistics::default();
        for axis in Axis::ALL {
            let i = axis.index();
            let n = self.count[i];
            stats.count[i] = n;
            if n == 0 {
                continue;
            }
            let nf = f64::from(n);
            stats.mean[axis] = self.shift[i] + self.sum[i] / nf;
            if n > 1 {
                // Cancellation can push the variance slightly below zero.
                let variance = ((self.sum_sq[i] - self.sum[i] * self.sum[i] / nf) / (nf - 1.0)).max(0.0);
                stats.sigma[axis] = variance.sqrt();
            }
        }
        stats
    }
}

/// Per sample axis: mean, unbiased standard deviation, number of values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NormalStatistics {
    /// Mean moment (emu)
    pub mean: Vec3,
    /// Standard deviation (emu); zero for fewer than two values
    pub sigma: Vec3,
    /// Values contributing to each axis
    pub count: [u32; 3],
}

impl NormalStatistics {
    /// Values contributing to `axis`.
    pub fn n(&self, axis: Axis) -> u32 {
        self.count[axis.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(rotation: RotationPosition, moment: Vec3) -> Reading {
        Reading { rotation, moment }
    }

    #[test]
    fn holder_pattern_matches_sample_pattern() {
        // A sample identical to the holder must cancel exactly at every step.
        let holder = Vec3::new(1.0, 2.0, 3.0);
        for k in 0..4 {
            let rot = RotationPosition::from_quarter(k);
            let seen = holder_in_magnetometer_frame(holder, rot);
            let comps = sample_components(seen, rot, ZOrientation::PlusZ, AxisSet::all());
            let mut recovered = Vec3::ZERO;
            for c in comps {
                recovered[c.sample_axis] = c.value;
            }
            assert_eq!(recovered, holder, "k = {k}");
        }
    }

    #[test]
    fn background_interpolates_across_virtual_steps() {
        let bg = Background {
            before: Vec3::new(0.0, 0.0, 0.0),
            after: Vec3::new(3.0, 0.0, 0.0),
        };
        assert_eq!(interpolated_background(&bg, 0, 2).x, 1.0);
        assert_eq!(interpolated_background(&bg, 1, 2).x, 2.0);
    }

    #[test]
    fn minus_z_flips_x_and_z() {
        let comps = sample_components(
            Vec3::new(1.0, 2.0, 3.0),
            RotationPosition::Home,
            ZOrientation::MinusZ,
            AxisSet::all(),
        );
        let values: Vec<(Axis, f64)> = comps.iter().map(|c| (c.sample_axis, c.value)).collect();
        assert_eq!(values, vec![(Axis::X, -1.0), (Axis::Y, 2.0), (Axis::Z, -3.0)]);
    }

    #[test]
    fn missing_axes_contribute_nothing() {
        let axes = AxisSet::of(&[Axis::X, Axis::Z]);
        let comps = sample_components(Vec3::new(1.0, 2.0, 3.0), RotationPosition::Deg90, ZOrientation::PlusZ, axes);
        // At 90° magnetometer X feeds sample Y; sample X would need magnetometer Y.
        let values: Vec<(Axis, f64)> = comps.iter().map(|c| (c.sample_axis, c.value)).collect();
        assert_eq!(values, vec![(Axis::Y, -1.0), (Axis::Z, 3.0)]);
    }

    #[test]
    fn identical_readings_have_zero_sigma() {
        let mut sums = NormalSums::new();
        for _ in 0..8 {
            sums.add(Axis::X, 0.1 + 0.2);
        }
        let stats = sums.statistics();
        assert_eq!(stats.sigma.x, 0.0);
        assert!((stats.mean.x - 0.3).abs() < 1e-15);
        assert_eq!(stats.n(Axis::X), 8);
    }

    #[test]
    fn single_reading_has_zero_sigma() {
        let mut sums = NormalSums::new();
        sums.add(Axis::Z, 5.0);
        let stats = sums.statistics();
        assert_eq!(stats.sigma.z, 0.0);
        assert!(!stats.sigma.z.is_nan());
        assert_eq!(stats.n(Axis::Y), 0);
    }

    #[test]
    fn sample_standard_deviation() {
        let mut sums = NormalSums::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            sums.add(Axis::Y, v);
        }
        let sigma = sums.statistics().sigma.y;
        assert!((sigma - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn correction_removes_background_and_holder() {
        let bg = Background {
            before: Vec3::new(1.0, 1.0, 1.0),
            after: Vec3::new(1.0, 1.0, 1.0),
        };
        let holder = Vec3::new(0.5, 0.0, 0.0);
        let r = reading(RotationPosition::Deg180, Vec3::new(1.0, 1.0, 1.0));
        let corrected = correct_reading(&r, 0, 1, &bg, holder);
        assert_eq!(corrected, Vec3::new(0.5, 0.0, 0.0));
    }
}
