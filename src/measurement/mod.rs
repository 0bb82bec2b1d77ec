//! Measurement cycle and its value types.

mod combine;
mod cycle;
mod types;

pub use combine::{combine, needs_uprange, COUNT_LIMIT};
pub use cycle::{coil_for, rotation_schedule, CycleOutcome, CyclePlan, DemagStep, MeasurementCycle};
pub use types::{Axis, AxisSet, Background, RawMeasurement, Reading, Vec3, ZOrientation};

use serde::{Deserialize, Serialize};

/// Measure loop stopping policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureMode {
    /// Fewest readings the axis layout allows: one with three axes, two
    /// (180° apart) with two
    Minimum,
    /// One full rotation
    SingleRotation,
    /// The given number of full rotations
    MultipleRotation(u32),
}
