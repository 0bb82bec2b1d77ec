//! Holder and standard calibration.
//!
//! Both measure without AF with the holder the right way up and change the
//! stored calibration only when the operator accepts the result.

use super::step::acquire;
use super::{load, unload};
use crate::error::AppResult;
use crate::measurement::{Axis, CyclePlan, RawMeasurement, Vec3, ZOrientation};
use crate::operator::{Notice, Operator, Prompt};
use crate::reduction::{normal_statistics, EPSILON};
use crate::station::Station;
use tracing::instrument;

/// Result of a calibration workflow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationOutcome {
    /// Measured and stored
    Accepted(Vec3),
    /// Measured, but the operator kept the old values
    Rejected(Vec3),
    /// The operator cancelled
    Cancelled,
}

async fn calibration_cycle(
    station: &mut Station,
    operator: &dyn Operator,
    prompt: Prompt,
) -> AppResult<Option<RawMeasurement>> {
    station.cancel.reset();
    let measured = match load(station, operator, prompt).await {
        Ok(()) => {
            let plan = CyclePlan {
                demag: None,
                mode: station.settings.measure.measure_mode(),
                orientation: ZOrientation::PlusZ,
            };
            acquire(station, operator, &plan).await
        }
        Err(e) => Err(e),
    };
    match measured {
        Ok(Some(raw)) => Ok(Some(raw)),
        Ok(None) => {
            operator.notify(&Notice::Cancelled);
            Ok(None)
        }
        Err(e) if e.is_cancel() => {
            operator.notify(&Notice::Cancelled);
            Ok(None)
        }
        Err(e) => {
            operator.notify(&Notice::Failure(e.to_string()));
            Err(e)
        }
    }
}

/// Measure the empty holder and offer its moment as the holder correction.
#[instrument(skip_all)]
pub async fn measure_holder(station: &mut Station, operator: &dyn Operator) -> AppResult<CalibrationOutcome> {
    let Some(raw) = calibration_cycle(station, operator, Prompt::EmptyHolder).await? else {
        return Ok(CalibrationOutcome::Cancelled);
    };
    let moment = normal_statistics(&raw, Vec3::ZERO).mean;
    tracing::info!(?moment, "Holder measured");

    unload(
        station,
        operator,
        Prompt::RemoveSample {
            specimen: "holder".into(),
        },
    )
    .await?;

    if operator.confirm(&Prompt::AcceptHolder { moment }).await {
        station.settings.calibration.holder = moment;
        tracing::info!("Holder moment stored");
        Ok(CalibrationOutcome::Accepted(moment))
    } else {
        Ok(CalibrationOutcome::Rejected(moment))
    }
}

/// Calibration constants that turn `measured` into `expected`, axis by axis.
///
/// Axes without a usable reading keep their current constant.
pub fn rescale_calibration(current: Vec3, expected: Vec3, measured: Vec3, counts: [u32; 3]) -> Vec3 {
    let mut proposed = current;
    for axis in Axis::ALL {
        let m = measured[axis];
        if counts[axis.index()] > 0 && m.abs() > EPSILON {
            proposed[axis] = current[axis] * expected[axis] / m;
        } else {
            tracing::warn!(%axis, "No usable standard reading, calibration kept");
        }
    }
    proposed
}

/// Measure the calibration standard and offer constants that make it read
/// its known moment.
#[instrument(skip_all)]
pub async fn measure_standard(station: &mut Station, operator: &dyn Operator) -> AppResult<CalibrationOutcome> {
    let Some(raw) = calibration_cycle(station, operator, Prompt::LoadStandard).await? else {
        return Ok(CalibrationOutcome::Cancelled);
    };
    let calibration = station.settings.calibration;
    let statistics = normal_statistics(&raw, calibration.holder);
    let proposed = rescale_calibration(
        calibration.emu_per_flux,
        station.settings.standard.moment,
        statistics.mean,
        statistics.count,
    );
    tracing::info!(measured = ?statistics.mean, ?proposed, "Standard measured");

    unload(
        station,
        operator,
        Prompt::RemoveSample {
            specimen: "calibration standard".into(),
        },
    )
    .await?;

    if operator.confirm(&Prompt::AcceptCalibration { emu_per_flux: proposed }).await {
        station.settings.calibration.emu_per_flux = proposed;
        tracing::info!("Calibration constants stored");
        Ok(CalibrationOutcome::Accepted(proposed))
    } else {
        Ok(CalibrationOutcome::Rejected(proposed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_scales_each_measured_axis() {
        let proposed = rescale_calibration(
            Vec3::new(-2.0e-5, -2.0e-5, -1.0e-5),
            Vec3::new(1.0e-3, 1.0e-3, 1.0e-3),
            Vec3::new(2.0e-3, 0.5e-3, 0.0),
            [1, 1, 1],
        );
        assert!((proposed.x + 1.0e-5).abs() < 1e-18);
        assert!((proposed.y + 4.0e-5).abs() < 1e-18);
        assert_eq!(proposed.z, -1.0e-5);
    }

    #[test]
    fn unmeasured_axis_keeps_constant() {
        let current = Vec3::new(1.0, 2.0, 3.0);
        let proposed = rescale_calibration(current, Vec3::new(5.0, 5.0, 5.0), Vec3::new(1.0, 1.0, 1.0), [1, 0, 1]);
        assert_eq!(proposed, Vec3::new(5.0, 2.0, 15.0));
    }
}
