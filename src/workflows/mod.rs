//! Operator workflows.
//!
//! Each workflow brings the sample to the load position and has the operator
//! load it, then runs one or more measurement cycles and reduces them. Two
//! policies wrap every cycle:
//!
//! - **Auto-uprange**: a cycle that saw counts its range cannot take is
//!   discarded. After the operator agrees, each affected axis moves one range
//!   step less sensitive (or to flux counting past the last fixed range) and
//!   the cycle is retried. An axis already flux counting is too strong.
//! - **Remeasure**: a reduced step whose S/N or S/Drift is below threshold is
//!   measured once more when the matching option is on; otherwise the
//!   operator is told.
//!
//! Operator cancel is an outcome, never an error. A step that does not
//! complete leaves the specimen file at its last stored step.

mod calibration;
mod sequence;
mod step;

pub use calibration::{measure_holder, measure_standard, rescale_calibration, CalibrationOutcome};
pub use sequence::{run_sequence, AfSchedule, SequenceReport};
pub use step::{measure_specimen, measure_step, plan_for, uprange};

use crate::error::{AppResult, DaqError};
use crate::motion::{RotationPosition, TranslationPosition};
use crate::operator::{Operator, Prompt};
use crate::specimen::SpecimenRecord;
use crate::station::Station;

/// How one measurement step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step was reduced and stored
    Recorded(SpecimenRecord),
    /// The operator cancelled; nothing was stored
    Cancelled,
}

/// Home the handler if its position is unknown, move to the load position
/// and put `prompt` to the operator.
///
/// A declined prompt is a cancel.
pub(crate) async fn load(station: &mut Station, operator: &dyn Operator, prompt: Prompt) -> AppResult<()> {
    if !station.handler.is_homed() {
        tracing::info!("Handler position unknown, homing");
        station.handler.home(operator).await?;
    }
    station
        .handler
        .go_to(TranslationPosition::Load, RotationPosition::Home, operator)
        .await?;
    if operator.confirm(&prompt).await {
        Ok(())
    } else {
        Err(DaqError::Cancelled)
    }
}

/// Return to the load position and ask for the sample to be taken out.
pub(crate) async fn unload(station: &mut Station, operator: &dyn Operator, prompt: Prompt) -> AppResult<()> {
    station
        .handler
        .go_to(TranslationPosition::Load, RotationPosition::Home, operator)
        .await?;
    if !operator.confirm(&prompt).await {
        tracing::warn!(%prompt, "Operator left the sample in the holder");
    }
    Ok(())
}
