//! Operator boundary.
//!
//! Everything the measurement core needs from a person goes through the
//! [`Operator`] trait: yes/no confirmations (load a sample, move a manual
//! handler, accept a calibration) and fire-and-forget notices (threshold
//! warnings, range changes). Cancellation is a separate [`CancelFlag`] the
//! front end can set at any time; the core polls it between stages and while
//! waiting for motion.

use crate::measurement::{Axis, AxisSet, Vec3};
use crate::motion::{RotationPosition, TranslationPosition};
use crate::protocol::Range;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A question put to the operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Put the specimen into the holder at the load position
    LoadSample {
        /// Specimen name
        specimen: String,
    },
    /// Take the specimen out of the holder
    RemoveSample {
        /// Specimen name
        specimen: String,
    },
    /// Leave the holder empty for a blank measurement
    EmptyHolder,
    /// Load the calibration standard
    LoadStandard,
    /// Move a manual handler to a position
    ManualMove {
        /// Target translation position
        translation: TranslationPosition,
        /// Target rotation position
        rotation: RotationPosition,
    },
    /// Run a manual AF demagnetization
    ManualDemagnetize {
        /// Coil axis
        axis: Axis,
        /// Peak field in mT
        level_mt: f64,
    },
    /// Raise the range of saturated axes and retry the step
    Uprange {
        /// Axes that overflowed
        axes: AxisSet,
    },
    /// Store a new holder moment
    AcceptHolder {
        /// Measured holder moment (emu)
        moment: Vec3,
    },
    /// Store new calibration constants
    AcceptCalibration {
        /// Proposed emu per flux quantum
        emu_per_flux: Vec3,
    },
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::LoadSample { specimen } => write!(f, "Load specimen '{specimen}' and continue?"),
            Prompt::RemoveSample { specimen } => write!(f, "Remove specimen '{specimen}'?"),
            Prompt::EmptyHolder => write!(f, "Make sure the holder is empty. Continue?"),
            Prompt::LoadStandard => write!(f, "Load the calibration standard. Continue?"),
            Prompt::ManualMove {
                translation,
                rotation,
            } => write!(f, "Move the sample to {translation} / {rotation}. Done?"),
            Prompt::ManualDemagnetize { axis, level_mt } => {
                write!(f, "Demagnetize along {axis} at {level_mt:.1} mT. Done?")
            }
            Prompt::Uprange { axes } => {
                let names: Vec<String> = axes.iter().map(|a| a.to_string()).collect();
                write!(f, "Signal too large on {}. Increase range and remeasure?", names.join(", "))
            }
            Prompt::AcceptHolder { moment } => write!(
                f,
                "Holder moment X={:.3e} Y={:.3e} Z={:.3e} emu. Store it?",
                moment.x, moment.y, moment.z
            ),
            Prompt::AcceptCalibration { emu_per_flux } => write!(
                f,
                "Calibration X={:.4e} Y={:.4e} Z={:.4e} emu/flux quantum. Store it?",
                emu_per_flux.x, emu_per_flux.y, emu_per_flux.z
            ),
        }
    }
}

/// Something the operator should know about; no answer is needed.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Signal-to-noise ratio below threshold
    LowSignalToNoise {
        /// Measured ratio
        ratio: f64,
        /// Configured threshold
        threshold: f64,
    },
    /// Signal-to-drift ratio below threshold
    LowSignalToDrift {
        /// Measured ratio
        ratio: f64,
        /// Configured threshold
        threshold: f64,
    },
    /// A step is being measured again
    Remeasuring {
        /// AF level of the step
        level_mt: f64,
    },
    /// A magnetometer axis changed range or counting mode
    RangeChanged {
        /// Axis
        axis: Axis,
        /// New range
        range: Range,
        /// Flux counting now enabled
        flux_counting: bool,
    },
    /// A step was stored
    StepRecorded {
        /// Step index (1-based)
        step: u32,
        /// AF level
        level_mt: f64,
    },
    /// The step was cancelled and nothing was stored
    Cancelled,
    /// A failure the operator must see
    Failure(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::LowSignalToNoise { ratio, threshold } => {
                write!(f, "Low signal/noise: {ratio:.2} (threshold {threshold:.2})")
            }
            Notice::LowSignalToDrift { ratio, threshold } => {
                write!(f, "Low signal/drift: {ratio:.2} (threshold {threshold:.2})")
            }
            Notice::Remeasuring { level_mt } => write!(f, "Remeasuring step at {level_mt:.1} mT"),
            Notice::RangeChanged {
                axis,
                range,
                flux_counting,
            } => {
                if *flux_counting {
                    write!(f, "{axis} axis now flux counting at range {range}")
                } else {
                    write!(f, "{axis} axis range raised to {range}")
                }
            }
            Notice::StepRecorded { step, level_mt } => {
                write!(f, "Recorded step {step} at {level_mt:.1} mT")
            }
            Notice::Cancelled => write!(f, "Measurement cancelled"),
            Notice::Failure(message) => write!(f, "{message}"),
        }
    }
}

/// The person at the instrument.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Ask a yes/no question. `false` declines.
    async fn confirm(&self, prompt: &Prompt) -> bool;

    /// Report something without waiting for an answer.
    fn notify(&self, notice: &Notice);
}

type Policy = Box<dyn Fn(&Prompt) -> bool + Send + Sync>;

/// Non-interactive operator that answers by policy and records everything.
pub struct AutoOperator {
    policy: Policy,
    prompts: Mutex<Vec<Prompt>>,
    notices: Mutex<Vec<Notice>>,
}

impl Default for AutoOperator {
    fn default() -> Self {
        Self::accepting()
    }
}

impl AutoOperator {
    /// Accept every prompt.
    pub fn accepting() -> Self {
        Self::with_policy(|_| true)
    }

    /// Answer each prompt with `policy`.
    pub fn with_policy<F>(policy: F) -> Self
    where
        F: Fn(&Prompt) -> bool + Send + Sync + 'static,
    {
        Self {
            policy: Box::new(policy),
            prompts: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
        }
    }

    /// Prompts seen so far.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().clone()
    }

    /// Notices seen so far.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl Operator for AutoOperator {
    async fn confirm(&self, prompt: &Prompt) -> bool {
        let answer = (self.policy)(prompt);
        tracing::debug!(%prompt, answer, "Auto-answered prompt");
        self.prompts.lock().push(prompt.clone());
        answer
    }

    fn notify(&self, notice: &Notice) {
        tracing::info!(%notice, "Operator notice");
        self.notices.lock().push(notice.clone());
    }
}

/// Shared operator-cancel flag.
///
/// Cloning shares the flag. Setting it asks the running cycle to stop at the
/// next stage boundary or motion poll.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    /// New, cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag before starting new work.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
        other.reset();
        assert!(!flag.is_cancelled());
    }

    #[tokio::test]
    async fn auto_operator_records_and_applies_policy() {
        let op = AutoOperator::with_policy(|p| !matches!(p, Prompt::Uprange { .. }));
        assert!(op.confirm(&Prompt::EmptyHolder).await);
        assert!(!op.confirm(&Prompt::Uprange { axes: AxisSet::all() }).await);
        op.notify(&Notice::Cancelled);
        assert_eq!(op.prompts().len(), 2);
        assert_eq!(op.notices(), vec![Notice::Cancelled]);
    }

    #[test]
    fn prompts_render_for_the_console() {
        let text = Prompt::Uprange {
            axes: AxisSet::of(&[Axis::X, Axis::Z]),
        }
        .to_string();
        assert!(text.contains("X, Z"));
    }
}
