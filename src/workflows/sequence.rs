//! AF demagnetization sequences.

use super::{load, measure_step, unload, StepOutcome};
use crate::config::SequenceConfig;
use crate::error::AppResult;
use crate::operator::{Notice, Operator, Prompt};
use crate::specimen::{SpecimenFile, SpecimenRecord};
use crate::station::Station;
use tracing::instrument;

const LEVEL_TOLERANCE_MT: f64 = 1e-9;

/// Levels of a sequence, in mT.
///
/// Starts at `start_mt` and steps by `increment1_mt` below the crossover and
/// by `increment2_mt` from the crossover on. Ends once the level exceeds the
/// larger of the two stop values.
#[derive(Debug, Clone)]
pub struct AfSchedule {
    config: SequenceConfig,
    next: Option<f64>,
}

impl AfSchedule {
    /// Schedule for `config`.
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            next: Some(config.start_mt),
            config,
        }
    }
}

impl Iterator for AfSchedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let level = self.next?;
        let stop = self.config.stop1_mt.max(self.config.stop2_mt);
        if level > stop + LEVEL_TOLERANCE_MT {
            self.next = None;
            return None;
        }
        let increment = if level < self.config.crossover_mt - LEVEL_TOLERANCE_MT {
            self.config.increment1_mt
        } else {
            self.config.increment2_mt
        };
        // Round so accumulated increments land on the levels the operator typed.
        self.next = (increment > 0.0).then(|| ((level + increment) * 1e6).round() / 1e6);
        Some(level)
    }
}

/// What a sequence stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceReport {
    /// Records stored, in order
    pub recorded: Vec<SpecimenRecord>,
    /// The operator cancelled before the last level
    pub cancelled: bool,
}

/// Load the specimen and measure one step per level of `schedule`.
///
/// A cancel stops the sequence; steps already stored stay stored.
#[instrument(skip_all, fields(specimen = %file.info().name))]
pub async fn run_sequence(
    station: &mut Station,
    operator: &dyn Operator,
    file: &mut SpecimenFile,
    schedule: AfSchedule,
) -> AppResult<SequenceReport> {
    station.cancel.reset();
    let specimen = file.info().name.clone();
    let mut report = SequenceReport::default();

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
            report.cancelled = true;
            return Ok(report);
        }
        Err(e) => return Err(e),
    }

    for level_mt in schedule {
        match measure_step(station, operator, file, level_mt).await? {
            StepOutcome::Recorded(record) => report.recorded.push(record),
            StepOutcome::Cancelled => {
                report.cancelled = true;
                tracing::info!(stored = report.recorded.len(), "Sequence cancelled");
                return Ok(report);
            }
        }
    }

    unload(station, operator, Prompt::RemoveSample { specimen }).await?;
    tracing::info!(steps = report.recorded.len(), "Sequence complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(start: f64, inc1: f64, inc2: f64, crossover: f64, stop1: f64, stop2: f64) -> Vec<f64> {
        AfSchedule::new(SequenceConfig {
            start_mt: start,
            increment1_mt: inc1,
            increment2_mt: inc2,
            crossover_mt: crossover,
            stop1_mt: stop1,
            stop2_mt: stop2,
        })
        .collect()
    }

    #[test]
    fn single_increment() {
        assert_eq!(
            schedule(0.0, 2.0, 2.0, 100.0, 10.0, 0.0),
            vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]
        );
    }

    #[test]
    fn switches_increment_at_crossover() {
        assert_eq!(
            schedule(0.0, 2.5, 10.0, 5.0, 30.0, 0.0),
            vec![0.0, 2.5, 5.0, 15.0, 25.0]
        );
    }

    #[test]
    fn larger_stop_wins() {
        assert_eq!(schedule(0.0, 5.0, 5.0, 0.0, 5.0, 15.0), vec![0.0, 5.0, 10.0, 15.0]);
    }

    #[test]
    fn fractional_steps_do_not_drift() {
        let levels = schedule(0.0, 0.1, 0.1, 100.0, 1.0, 0.0);
        assert_eq!(levels.len(), 11);
        assert_eq!(levels[10], 1.0);
    }

    #[test]
    fn start_above_stop_is_empty() {
        assert!(schedule(20.0, 1.0, 1.0, 0.0, 10.0, 0.0).is_empty());
    }
}
