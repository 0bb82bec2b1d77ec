//! One measurement step with the uprange and remeasure policies.

use super::{load, unload, StepOutcome};
use crate::config::{DeviceMode, MeasureOptions, Settings};
use crate::error::{AppResult, DaqError};
use crate::measurement::{AxisSet, CycleOutcome, CyclePlan, DemagStep, RawMeasurement};
use crate::operator::{Notice, Operator, Prompt};
use crate::reduction::{reduce, Reduction, ReductionContext};
use crate::specimen::{SampleInfo, SpecimenFile, SpecimenRecord};
use crate::station::Station;
use tracing::instrument;

/// Cycle plan for a step at `level_mt`. Level 0 measures without AF.
pub fn plan_for(settings: &Settings, level_mt: f64) -> AppResult<CyclePlan> {
    let demag = if level_mt > 0.0 {
        if settings.demagnetizer.mode == DeviceMode::None {
            return Err(DaqError::Configuration(format!(
                "AF step at {level_mt} mT needs a demagnetizer, but none is installed"
            )));
        }
        Some(DemagStep {
            level_mt,
            axes: settings.demagnetizer.axes,
        })
    } else {
        None
    };
    Ok(CyclePlan {
        demag,
        mode: settings.measure.measure_mode(),
        orientation: settings.measure.orientation,
    })
}

/// Make every axis in `axes` one step less sensitive, once the operator
/// agrees.
///
/// Past the last fixed range an axis switches to flux counting; an axis
/// already flux counting fails with [`DaqError::TooStrong`], and then no
/// axis is changed.
pub async fn uprange(station: &mut Station, operator: &dyn Operator, axes: AxisSet) -> AppResult<()> {
    if !operator.confirm(&Prompt::Uprange { axes }).await {
        return Err(DaqError::Declined("range increase".into()));
    }
    // No axis changes unless every axis can.
    for axis in axes.iter() {
        let config = station.settings.magnetometer.axis(axis);
        if config.range.next().is_none() && config.flux_counting {
            tracing::error!(%axis, "Sample too strong for every range");
            return Err(DaqError::TooStrong(axis));
        }
    }
    for axis in axes.iter() {
        let config = station.settings.magnetometer.axis_mut(axis);
        match config.range.next() {
            Some(next) => config.range = next,
            None => config.flux_counting = true,
        }
        let (range, flux_counting) = (config.range, config.flux_counting);
        station.apply_axis_config(axis).await?;
        tracing::info!(%axis, %range, flux_counting, "Raised axis range");
        operator.notify(&Notice::RangeChanged {
            axis,
            range,
            flux_counting,
        });
    }
    Ok(())
}

/// Run `plan` until a cycle completes, upranging in between. `None` when
/// the operator cancelled.
pub(crate) async fn acquire(
    station: &mut Station,
    operator: &dyn Operator,
    plan: &CyclePlan,
) -> AppResult<Option<RawMeasurement>> {
    let mut plan = *plan;
    loop {
        match station.cycle(operator).run(&plan).await? {
            CycleOutcome::Completed(raw) => return Ok(Some(raw)),
            CycleOutcome::Cancelled => return Ok(None),
            CycleOutcome::NeedsUprange(axes) => {
                uprange(station, operator, axes).await?;
                // The sample has already seen this field.
                plan.demag = None;
            }
        }
    }
}

/// Ratios below threshold, each with whether it asks for a remeasure.
fn threshold_failures(reduction: &Reduction, options: &MeasureOptions) -> Vec<(Notice, bool)> {
    let mut failures = Vec::new();
    if reduction.signal_to_noise < options.sn_threshold {
        failures.push((
            Notice::LowSignalToNoise {
                ratio: reduction.signal_to_noise,
                threshold: options.sn_threshold,
            },
            options.remeasure_low_sn,
        ));
    }
    if reduction.signal_to_drift < options.sdrift_threshold {
        failures.push((
            Notice::LowSignalToDrift {
                ratio: reduction.signal_to_drift,
                threshold: options.sdrift_threshold,
            },
            options.remeasure_low_sdrift,
        ));
    }
    failures
}

async fn measure_reduced(
    station: &mut Station,
    operator: &dyn Operator,
    plan: &CyclePlan,
    sample: &SampleInfo,
) -> AppResult<Option<Reduction>> {
    let level_mt = plan.demag.map_or(0.0, |d| d.level_mt);
    let mut remeasured = false;
    loop {
        let Some(raw) = acquire(station, operator, plan).await? else {
            return Ok(None);
        };
        let settings = &station.settings;
        let reduction = reduce(
            &raw,
            &ReductionContext {
                calibration: &settings.calibration,
                orientation: &settings.orientation,
                sample,
            },
        );

        let failures = threshold_failures(&reduction, &settings.measure);
        for (notice, _) in &failures {
            tracing::warn!(%notice, "Threshold not met");
            operator.notify(notice);
        }
        if !remeasured && failures.iter().any(|(_, remeasure)| *remeasure) {
            remeasured = true;
            operator.notify(&Notice::Remeasuring { level_mt });
            continue;
        }
        return Ok(Some(reduction));
    }
}

/// Measure, reduce and store one step at `level_mt`.
///
/// The step index is reserved first and released again unless the step is
/// stored.
#[instrument(skip(station, operator, file), fields(specimen = %file.info().name))]
pub async fn measure_step(
    station: &mut Station,
    operator: &dyn Operator,
    file: &mut SpecimenFile,
    level_mt: f64,
) -> AppResult<StepOutcome> {
    let plan = plan_for(&station.settings, level_mt)?;
    let sample = file.info().clone();
    let step = file.begin_step()?;

    match measure_reduced(station, operator, &plan, &sample).await {
        Ok(Some(reduction)) => {
            let record = SpecimenRecord::from_reduction(step, level_mt, &reduction);
            file.commit(record.clone())?;
            file.flush()?;
            tracing::info!(step, level_mt, total_moment = record.total_moment, "Step recorded");
            operator.notify(&Notice::StepRecorded { step, level_mt });
            Ok(StepOutcome::Recorded(record))
        }
        Ok(None) => {
            file.rollback();
            operator.notify(&Notice::Cancelled);
            Ok(StepOutcome::Cancelled)
        }
        Err(e) if e.is_cancel() => {
            file.rollback();
            operator.notify(&Notice::Cancelled);
            Ok(StepOutcome::Cancelled)
        }
        Err(e) => {
            file.rollback();
            operator.notify(&Notice::Failure(e.to_string()));
            Err(e)
        }
    }
}

/// Single-step workflow: load the specimen, measure one step, unload.
pub async fn measure_specimen(
    station: &mut Station,
    operator: &dyn Operator,
    file: &mut SpecimenFile,
    level_mt: f64,
) -> AppResult<StepOutcome> {
    station.cancel.reset();
    let specimen = file.info().name.clone();
    match load(
        station,
        operator,
        Prompt::LoadSample {
            specimen: specimen.clone(),
        },
    )
    .await
    {
        Ok(()) => {}
        Err(e) if e.is_cancel() => {
            operator.notify(&Notice::Cancelled);
            return Ok(StepOutcome::Cancelled);
        }
        Err(e) => return Err(e),
    }

    let outcome = measure_step(station, operator, file, level_mt).await?;
    if matches!(outcome, StepOutcome::Recorded(_)) {
        unload(station, operator, Prompt::RemoveSample { specimen }).await?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasureMode;
    use crate::reduction::{Direction, NormalStatistics};
    use crate::measurement::{Axis, Vec3};
    use crate::operator::AutoOperator;
    use crate::protocol::Range;
    use crate::sim::SimWorld;

    fn reduction(signal_to_noise: f64, signal_to_drift: f64) -> Reduction {
        Reduction {
            statistics: NormalStatistics::default(),
            percent_error: Vec3::ZERO,
            total_moment: 1.0,
            magnetization: 1.0,
            core: Direction::default(),
            in_situ: Direction::default(),
            stratigraphic: Direction::default(),
            signal_to_noise,
            signal_to_drift,
            signal_to_holder: 100.0,
        }
    }

    #[test]
    fn zero_level_skips_af() {
        let settings = Settings::default();
        let plan = plan_for(&settings, 0.0).unwrap();
        assert_eq!(plan.demag, None);
        assert_eq!(plan.mode, MeasureMode::Minimum);

        let plan = plan_for(&settings, 12.5).unwrap();
        assert_eq!(plan.demag.map(|d| d.level_mt), Some(12.5));
    }

    #[test]
    fn af_step_without_demagnetizer_is_rejected() {
        let mut settings = Settings::default();
        settings.demagnetizer.mode = DeviceMode::None;
        assert!(plan_for(&settings, 5.0).is_err());
        assert!(plan_for(&settings, 0.0).is_ok());
    }

    #[test]
    fn failures_carry_their_remeasure_option() {
        let options = MeasureOptions {
            remeasure_low_sn: false,
            ..MeasureOptions::default()
        };
        let failures = threshold_failures(&reduction(2.0, 50.0), &options);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], (Notice::LowSignalToNoise { .. }, false)));

        let failures = threshold_failures(&reduction(2.0, 2.0), &options);
        assert_eq!(failures.len(), 2);
        assert!(failures[1].1);

        assert!(threshold_failures(&reduction(50.0, 50.0), &options).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn too_strong_axis_leaves_every_range_alone() {
        let mut settings = Settings::default();
        settings.magnetometer.z.range = Range::Extended;
        settings.magnetometer.z.flux_counting = true;
        let world = SimWorld::new(&settings);
        let mut station = Station::simulated(settings, &world).unwrap();
        let operator = AutoOperator::accepting();

        let result = uprange(&mut station, &operator, AxisSet::of(&[Axis::X, Axis::Z])).await;

        assert!(matches!(result, Err(DaqError::TooStrong(Axis::Z))));
        assert_eq!(station.settings.magnetometer.x.range, Range::X1);
        assert!(!station.settings.magnetometer.x.flux_counting);
        assert_eq!(world.range(Axis::X), Range::X1);
        assert!(operator.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_fixed_range_moves_to_flux_counting() {
        let mut settings = Settings::default();
        settings.magnetometer.y.range = Range::Extended;
        let world = SimWorld::new(&settings);
        let mut station = Station::simulated(settings, &world).unwrap();
        let operator = AutoOperator::accepting();

        uprange(&mut station, &operator, AxisSet::of(&[Axis::X, Axis::Y]))
            .await
            .unwrap();

        assert_eq!(station.settings.magnetometer.x.range, Range::X10);
        assert!(station.settings.magnetometer.y.flux_counting);
        assert_eq!(operator.notices().len(), 2);
    }
}
