//! The measurement cycle state machine.
//!
//! ```text
//! BackgroundBefore -> [Demagnetize] -> MeasureLoop -> BackgroundAfter -> Done
//! ```
//!
//! The cancel flag is checked before every stage's motion. A cancel (or a
//! declined manual step) ends the cycle with [`CycleOutcome::Cancelled`] and
//! whatever was captured is dropped. A count that shows the range is too
//! sensitive ends the measure loop early with [`CycleOutcome::NeedsUprange`].

use super::{combine, needs_uprange, AxisSet, Background, MeasureMode, RawMeasurement, Reading, Vec3, ZOrientation};
use crate::error::{AppResult, DaqError};
use crate::measurement::Axis;
use crate::motion::{RotationPosition, TranslationPosition};
use crate::operator::{Operator, Prompt};
use crate::protocol::Target;
use crate::station::{Demagnetizer, Station};
use tokio::time::sleep;
use tracing::instrument;

/// One AF step before measuring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemagStep {
    /// Peak field in mT
    pub level_mt: f64,
    /// Sample axes to demagnetize
    pub axes: AxisSet,
}

/// What one cycle should do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclePlan {
    /// Demagnetize first, or measure as is
    pub demag: Option<DemagStep>,
    /// Measure loop stopping policy
    pub mode: MeasureMode,
    /// How the sample is loaded
    pub orientation: ZOrientation,
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// All stages ran
    Completed(RawMeasurement),
    /// The listed axes saw counts their range cannot take
    NeedsUprange(AxisSet),
    /// The operator cancelled
    Cancelled,
}

/// Rotation positions the measure loop visits, in order.
pub fn rotation_schedule(mode: MeasureMode, axes: AxisSet) -> Vec<RotationPosition> {
    let readings = match mode {
        MeasureMode::Minimum if axes.len() >= 3 => return vec![RotationPosition::Home],
        MeasureMode::Minimum => {
            return vec![RotationPosition::Home, RotationPosition::Deg180];
        }
        MeasureMode::SingleRotation => 4,
        MeasureMode::MultipleRotation(n) => 4 * n.max(1) as usize,
    };
    (0..readings).map(RotationPosition::from_quarter).collect()
}

/// Order in which AF axes are run.
const AF_ORDER: [Axis; 3] = [Axis::Z, Axis::X, Axis::Y];

enum LoopResult {
    Done(Vec<Reading>),
    Uprange(AxisSet),
}

struct Point {
    moment: Vec3,
    overflow: AxisSet,
}

/// A measurement cycle borrowing the station for its whole run.
pub struct MeasurementCycle<'a> {
    station: &'a mut Station,
    operator: &'a dyn Operator,
}

impl<'a> MeasurementCycle<'a> {
    /// Cycle over `station`, prompting `operator` for manual steps.
    pub fn new(station: &'a mut Station, operator: &'a dyn Operator) -> Self {
        Self { station, operator }
    }

    /// Run every stage of `plan`.
    ///
    /// Device failures are errors; operator cancel is an outcome.
    #[instrument(skip(self), fields(level = plan.demag.map(|d| d.level_mt)))]
    pub async fn run(&mut self, plan: &CyclePlan) -> AppResult<CycleOutcome> {
        match self.run_stages(plan).await {
            Err(e) if e.is_cancel() => {
                tracing::info!("Measurement cycle cancelled");
                Ok(CycleOutcome::Cancelled)
            }
            other => other,
        }
    }

    fn check_cancel(&self) -> AppResult<()> {
        if self.station.cancel.is_cancelled() {
            Err(DaqError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn run_stages(&mut self, plan: &CyclePlan) -> AppResult<CycleOutcome> {
        let axes = self.station.settings.magnetometer.enabled_axes();

        let before = self.background(axes, true).await?;

        if let Some(step) = plan.demag {
            self.demagnetize(step).await?;
        }

        let readings = match self.measure_loop(plan.mode, axes).await? {
            LoopResult::Done(readings) => readings,
            LoopResult::Uprange(overflow) => return Ok(CycleOutcome::NeedsUprange(overflow)),
        };

        let after = self.background(axes, false).await?;
        let background = Background { before, after };
        tracing::debug!(drift = ?background.drift(), readings = readings.len(), "Cycle complete");

        Ok(CycleOutcome::Completed(RawMeasurement {
            axes,
            orientation: plan.orientation,
            readings,
            background,
        }))
    }

    /// Empty-tube reading at the background position.
    #[instrument(skip(self))]
    async fn background(&mut self, axes: AxisSet, before: bool) -> AppResult<Vec3> {
        self.check_cancel()?;
        self.station
            .handler
            .go_to(TranslationPosition::Background, RotationPosition::Home, self.operator)
            .await?;
        if before {
            self.station.magnetometer.pulse_loop(Target::All).await?;
            self.station.magnetometer.reset_count(Target::All).await?;
        }
        let point = self.read_point(axes).await?;
        if !point.overflow.is_empty() {
            tracing::warn!(axes = ?point.overflow, "Background counts nonzero");
        }
        Ok(point.moment)
    }

    /// Settle, latch and read every axis, combining counts and analog data.
    async fn read_point(&mut self, axes: AxisSet) -> AppResult<Point> {
        let config = &self.station.settings.magnetometer;
        sleep(config.settle()).await;
        let samples = config.analog_samples;

        let counts = self.station.magnetometer.read_counts(axes).await?;
        let mut overflow = AxisSet::none();
        for axis in axes.iter() {
            let count = counts[axis.index()];
            if needs_uprange(count, self.station.settings.magnetometer.axis(axis).flux_counting) {
                tracing::warn!(%axis, count, "Count exceeds range");
                overflow.insert(axis);
            }
        }
        if !overflow.is_empty() {
            return Ok(Point {
                moment: Vec3::ZERO,
                overflow,
            });
        }

        let analog = self.station.magnetometer.read_analog_mean(axes, samples).await?;
        let settings = &self.station.settings;
        let mut moment = Vec3::ZERO;
        for axis in axes.iter() {
            moment[axis] = combine(
                counts[axis.index()],
                analog[axis],
                axis,
                settings.magnetometer.axis(axis).flux_counting,
                &settings.calibration,
            );
        }
        Ok(Point { moment, overflow })
    }

    /// AF-demagnetize along each requested axis: Z, then X, then Y.
    #[instrument(skip(self))]
    async fn demagnetize(&mut self, step: DemagStep) -> AppResult<()> {
        let coils = self.station.settings.demagnetizer.coils;
        for axis in AF_ORDER.into_iter().filter(|a| step.axes.contains(*a)) {
            self.check_cancel()?;
            let (coil, rotation) = coil_for(axis, coils).ok_or_else(|| {
                DaqError::Configuration(format!("No AF coil can reach the {axis} axis"))
            })?;
            if rotation != RotationPosition::Home {
                tracing::debug!(%axis, %coil, "Rotating 90° to use the available coil");
            }
            self.station
                .handler
                .go_to(TranslationPosition::af(coil), rotation, self.operator)
                .await?;
            self.check_cancel()?;

            match &mut self.station.demagnetizer {
                Demagnetizer::Automatic(af) => af.demagnetize(coil, step.level_mt).await?,
                Demagnetizer::Manual => {
                    let prompt = Prompt::ManualDemagnetize {
                        axis: coil,
                        level_mt: step.level_mt,
                    };
                    if !self.operator.confirm(&prompt).await {
                        return Err(DaqError::Cancelled);
                    }
                }
                Demagnetizer::Absent => {
                    return Err(DaqError::Configuration(
                        "No AF demagnetizer is installed".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Readings at successive rotation positions until the mode is satisfied.
    #[instrument(skip(self))]
    async fn measure_loop(&mut self, mode: MeasureMode, axes: AxisSet) -> AppResult<LoopResult> {
        let schedule = rotation_schedule(mode, axes);
        let mut readings = Vec::with_capacity(schedule.len());

        for rotation in schedule {
            self.check_cancel()?;
            self.station
                .handler
                .go_to(TranslationPosition::Measurement, rotation, self.operator)
                .await?;

            let point = self.read_point(axes).await?;
            if !point.overflow.is_empty() {
                self.station
                    .handler
                    .rotate_to(RotationPosition::Home, self.operator)
                    .await?;
                return Ok(LoopResult::Uprange(point.overflow));
            }
            tracing::debug!(%rotation, moment = ?point.moment, "Reading");
            readings.push(Reading {
                rotation,
                moment: point.moment,
            });
        }

        self.check_cancel()?;
        self.station
            .handler
            .rotate_to(RotationPosition::Home, self.operator)
            .await?;
        Ok(LoopResult::Done(readings))
    }
}

/// Coil and rotation that expose sample `axis` to a field.
///
/// A transverse axis without its own coil uses the other transverse coil
/// with the sample turned a quarter.
pub fn coil_for(axis: Axis, coils: AxisSet) -> Option<(Axis, RotationPosition)> {
    if coils.contains(axis) {
        return Some((axis, RotationPosition::Home));
    }
    let other = match axis {
        Axis::X => Axis::Y,
        Axis::Y => Axis::X,
        Axis::Z => return None,
    };
    coils
        .contains(other)
        .then_some((other, RotationPosition::Deg90))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_mode_depends_on_axis_count() {
        assert_eq!(
            rotation_schedule(MeasureMode::Minimum, AxisSet::all()),
            vec![RotationPosition::Home]
        );
        assert_eq!(
            rotation_schedule(MeasureMode::Minimum, AxisSet::of(&[Axis::X, Axis::Z])),
            vec![RotationPosition::Home, RotationPosition::Deg180]
        );
    }

    #[test]
    fn rotation_modes_take_four_readings_per_turn() {
        assert_eq!(rotation_schedule(MeasureMode::SingleRotation, AxisSet::all()).len(), 4);
        let multi = rotation_schedule(MeasureMode::MultipleRotation(3), AxisSet::all());
        assert_eq!(multi.len(), 12);
        assert_eq!(multi[5], RotationPosition::Deg90);
    }

    #[test]
    fn single_transverse_coil_serves_both_axes() {
        let coils = AxisSet::of(&[Axis::X, Axis::Z]);
        assert_eq!(coil_for(Axis::X, coils), Some((Axis::X, RotationPosition::Home)));
        assert_eq!(coil_for(Axis::Y, coils), Some((Axis::X, RotationPosition::Deg90)));
        assert_eq!(coil_for(Axis::Z, AxisSet::of(&[Axis::X])), None);
    }
}
