//! Simulated instruments.
//!
//! A [`SimWorld`] holds the physical state the three simulated devices share:
//! the sample's remanence and its AF history, the holder and background
//! moments, and where the handler has put the sample. Each device is a
//! [`Transport`] that parses the command strings the real controller accepts
//! and answers the way it does, so the protocol adapters cannot tell the
//! difference.
//!
//! The world records [`SimEvent`]s for tests and can be told to misbehave:
//! saturate an axis below a given range, fail the next AF ramp, or round
//! handler velocities.
//!
//! # Example
//!
//! ```rust,ignore
//! let settings = Settings::default();
//! let world = SimWorld::new(&settings);
//! world.set_sample(Some(Vec3::new(1e-4, 0.0, 2e-4)));
//! let mut station = Station::simulated(settings, &world)?;
//! ```

mod demagnetizer;
mod handler;
mod magnetometer;

pub use demagnetizer::DemagnetizerModel;
pub use handler::HandlerModel;
pub use magnetometer::MagnetometerModel;

use crate::config::{PositionOffsets, Settings};
use crate::error::SerialError;
use crate::measurement::{Axis, Vec3, ZOrientation};
use crate::motion::RotationPosition;
use crate::protocol::{Direction, MotionAxis, Range};
use crate::reduction::stats::holder_in_magnetometer_frame;
use crate::serial::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::Instant;

/// Simulated magnetometer.
pub type SimMagnetometer = SimPort<MagnetometerModel>;
/// Simulated AF demagnetizer.
pub type SimDemagnetizer = SimPort<DemagnetizerModel>;
/// Simulated sample handler.
pub type SimHandler = SimPort<HandlerModel>;

/// Distance in pulses past the outermost position at which the limit switches sit.
const LIMIT_MARGIN: i64 = 5_000;
/// Tolerance in pulses for "the sample is at the measurement position".
const POSITION_TOLERANCE: i64 = 50;

/// Something the simulated devices did.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// Magnetometer range changed
    RangeSet {
        /// Axis
        axis: Axis,
        /// New range
        range: Range,
    },
    /// Magnetometer analog data latched
    DataLatched {
        /// Handler translation in pulses from home
        translation: i64,
        /// Rotation quarter turns from home
        quarter: usize,
    },
    /// Handler move finished
    Moved {
        /// Motor
        axis: MotionAxis,
        /// Pulse position before
        from: i64,
        /// Pulse position after
        to: i64,
    },
    /// Handler home seek finished
    Homed {
        /// Motor
        axis: MotionAxis,
    },
    /// AF ramp started
    Ramp {
        /// Coil
        coil: Axis,
        /// Peak field in mT
        level_mt: f64,
        /// Handler translation in pulses from home
        translation: i64,
        /// Rotation quarter turns from home
        quarter: usize,
    },
}

/// State shared by the simulated devices.
#[derive(Debug)]
pub struct WorldState {
    offsets: PositionOffsets,
    pulses_per_revolution: i64,
    limits: (i64, i64),
    emu_per_flux: Vec3,
    started: Instant,

    sample: Option<Vec3>,
    orientation: ZOrientation,
    af_decay_mt: f64,
    max_af_mt: f64,
    holder: Vec3,
    background: Vec3,
    drift_per_second: Vec3,
    noise: f64,

    ranges: [Range; 3],
    saturate_below: [Option<Range>; 3],
    latched_count: [i64; 3],
    latched_flux: [f64; 3],

    translation: i64,
    rotation: i64,
    selected: MotionAxis,
    registers: BTreeMap<char, String>,
    direction: Direction,
    moving_polls: u32,
    busy_polls: u32,
    velocity_step: Option<u32>,

    amplitude_mt: f64,
    coil: Option<Axis>,
    ramp_polls: u32,
    ramp_error: Option<String>,

    events: Vec<SimEvent>,
}

impl WorldState {
    fn new(settings: &Settings) -> Self {
        let offsets = settings.handler.positions;
        let outermost = [
            offsets.load,
            offsets.af_x,
            offsets.af_y,
            offsets.af_z,
            offsets.background,
            offsets.measurement,
        ]
        .into_iter()
        .fold(0, |acc, o| acc.max(o.abs()))
            + LIMIT_MARGIN;
        Self {
            offsets,
            pulses_per_revolution: i64::from(settings.handler.pulses_per_revolution.max(4)),
            limits: (-outermost, outermost),
            emu_per_flux: settings.calibration.emu_per_flux,
            started: Instant::now(),

            sample: Some(Vec3::new(3.0e-4, -1.5e-4, 6.0e-4)),
            orientation: settings.measure.orientation,
            af_decay_mt: 25.0,
            max_af_mt: 0.0,
            holder: Vec3::new(2.0e-8, 1.0e-8, -3.0e-8),
            background: Vec3::new(1.0e-9, -2.0e-9, 1.5e-9),
            drift_per_second: Vec3::ZERO,
            noise: 0.0,

            ranges: [Range::X1; 3],
            saturate_below: [None; 3],
            latched_count: [0; 3],
            latched_flux: [0.0; 3],

            translation: 0,
            rotation: 0,
            selected: MotionAxis::Translation,
            registers: BTreeMap::new(),
            direction: Direction::Positive,
            moving_polls: 0,
            busy_polls: 2,
            velocity_step: None,

            amplitude_mt: 0.0,
            coil: None,
            ramp_polls: 0,
            ramp_error: None,

            events: Vec::new(),
        }
    }

    /// Rotation quarter turns from home, to the nearest quarter.
    fn quarter(&self) -> usize {
        let quarter = self.pulses_per_revolution / 4;
        let within = self.rotation.rem_euclid(self.pulses_per_revolution);
        (((within + quarter / 2) / quarter) % 4) as usize
    }

    fn at_measurement(&self) -> bool {
        (self.translation - self.offsets.measurement).abs() <= POSITION_TOLERANCE
    }

    /// Sample remanence after its AF history, in the sample frame.
    fn remanence(&self) -> Option<Vec3> {
        self.sample
            .map(|nrm| nrm * (-self.max_af_mt / self.af_decay_mt).exp())
    }

    /// Moment the SQUIDs see right now, in emu.
    fn sensed_moment(&self) -> Vec3 {
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut moment = self.background + self.drift_per_second * elapsed;
        if self.at_measurement() {
            let rotation = RotationPosition::from_quarter(self.quarter());
            moment = moment + holder_in_magnetometer_frame(self.holder, rotation);
            if let Some(sample) = self.remanence() {
                let loaded = match self.orientation {
                    ZOrientation::PlusZ => sample,
                    ZOrientation::MinusZ => Vec3::new(-sample.x, sample.y, -sample.z),
                };
                moment = moment + holder_in_magnetometer_frame(loaded, rotation);
            }
        }
        if self.noise > 0.0 {
            let mut rng = rand::thread_rng();
            for axis in Axis::ALL {
                moment[axis] += rng.gen_range(-self.noise..self.noise);
            }
        }
        moment
    }
}

/// Shared simulated world. Cloning shares the state.
#[derive(Debug, Clone)]
pub struct SimWorld {
    inner: Arc<Mutex<WorldState>>,
}

impl SimWorld {
    /// World laid out per `settings`: handler offsets, pulses per revolution,
    /// calibration constants and loading orientation.
    ///
    /// It starts with a sample loaded, a small holder moment and a constant
    /// background, no drift and no noise.
    pub fn new(settings: &Settings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WorldState::new(settings))),
        }
    }

    /// Sample remanence in the sample frame, or `None` for an empty holder.
    /// Clears the AF history.
    pub fn set_sample(&self, moment: Option<Vec3>) {
        let mut state = self.inner.lock();
        state.sample = moment;
        state.max_af_mt = 0.0;
    }

    /// How the sample sits in the holder.
    pub fn set_orientation(&self, orientation: ZOrientation) {
        self.inner.lock().orientation = orientation;
    }

    /// Holder moment in the holder frame.
    pub fn set_holder(&self, moment: Vec3) {
        self.inner.lock().holder = moment;
    }

    /// Background moment at time zero.
    pub fn set_background(&self, moment: Vec3) {
        self.inner.lock().background = moment;
    }

    /// Linear background drift in emu per second.
    pub fn set_drift(&self, per_second: Vec3) {
        self.inner.lock().drift_per_second = per_second;
    }

    /// Uniform noise amplitude in emu added to every latched reading.
    pub fn set_noise(&self, amplitude: f64) {
        self.inner.lock().noise = amplitude.abs();
    }

    /// AF field in mT that reduces the remanence by a factor e.
    pub fn set_af_decay(&self, decay_mt: f64) {
        self.inner.lock().af_decay_mt = decay_mt.max(f64::EPSILON);
    }

    /// Report an out-of-range count on `axis` while the sample is measured
    /// on any range more sensitive than `range`.
    pub fn saturate_below(&self, axis: Axis, range: Range) {
        self.inner.lock().saturate_below[axis.index()] = Some(range);
    }

    /// Make the next ramp status poll report `token` (e.g. "TRACK ERROR").
    pub fn fail_next_ramp(&self, token: &str) {
        self.inner.lock().ramp_error = Some(token.to_string());
    }

    /// Round handler velocities to multiples of `step`.
    pub fn coerce_velocity(&self, step: u32) {
        self.inner.lock().velocity_step = (step > 0).then_some(step);
    }

    /// Status polls a handler move stays busy for.
    pub fn set_busy_polls(&self, polls: u32) {
        self.inner.lock().busy_polls = polls;
    }

    /// Current sample remanence after AF, in the sample frame.
    pub fn remanence(&self) -> Option<Vec3> {
        self.inner.lock().remanence()
    }

    /// Highest AF level applied since the sample was set.
    pub fn max_af_mt(&self) -> f64 {
        self.inner.lock().max_af_mt
    }

    /// Handler translation in pulses from home.
    pub fn translation_pulses(&self) -> i64 {
        self.inner.lock().translation
    }

    /// Handler rotation in quarter turns from home.
    pub fn rotation_quarter(&self) -> usize {
        self.inner.lock().quarter()
    }

    /// Current range of `axis`.
    pub fn range(&self, axis: Axis) -> Range {
        self.inner.lock().ranges[axis.index()]
    }

    /// Last value written to handler register `register` (e.g. `'M'` for
    /// velocity), as stored after any coercion.
    pub fn handler_register(&self, register: char) -> Option<String> {
        self.inner.lock().registers.get(&register).cloned()
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<SimEvent> {
        self.inner.lock().events.clone()
    }

    /// Peak fields of every ramp run, in order.
    pub fn ramp_levels(&self) -> Vec<f64> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Ramp { level_mt, .. } => Some(*level_mt),
                _ => None,
            })
            .collect()
    }
}

/// Command handling of one simulated controller.
pub trait DeviceModel: Send {
    /// Port name used in diagnostics.
    const NAME: &'static str;
    /// Character ending a command.
    const TERMINATOR: char;

    /// Whether `partial` is a prefix that itself contains the terminator.
    fn continues(_partial: &str) -> bool {
        false
    }

    /// Apply one complete command and return the reply, if any.
    fn handle(world: &mut WorldState, command: &str) -> Option<String>;
}

/// A simulated device behind the [`Transport`] seam.
pub struct SimPort<M> {
    world: SimWorld,
    input: String,
    output: VecDeque<u8>,
    closed: bool,
    model: PhantomData<M>,
}

impl<M: DeviceModel> SimPort<M> {
    /// Device attached to `world`.
    pub fn new(world: SimWorld) -> Self {
        Self {
            world,
            input: String::new(),
            output: VecDeque::new(),
            closed: false,
            model: PhantomData,
        }
    }

    fn closed_error() -> SerialError {
        SerialError::Closed {
            port: M::NAME.to_string(),
        }
    }
}

#[async_trait]
impl<M: DeviceModel> Transport for SimPort<M> {
    fn name(&self) -> &str {
        M::NAME
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError> {
        if self.closed {
            return Err(Self::closed_error());
        }
        for ch in String::from_utf8_lossy(bytes).chars() {
            if ch != M::TERMINATOR {
                if ch != '\n' {
                    self.input.push(ch);
                }
                continue;
            }
            if M::continues(&self.input) {
                self.input.push(ch);
                continue;
            }
            let command = std::mem::take(&mut self.input);
            let reply = M::handle(&mut self.world.inner.lock(), command.trim());
            tracing::trace!(device = M::NAME, %command, ?reply, "sim");
            if let Some(reply) = reply {
                self.output.extend(reply.bytes());
            }
        }
        Ok(bytes.len())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError> {
        if self.closed {
            return Err(Self::closed_error());
        }
        let n = max_len.min(self.output.len());
        Ok(self.output.drain(..n).collect())
    }

    async fn close(&mut self) -> Result<(), SerialError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> SimWorld {
        SimWorld::new(&Settings::default())
    }

    #[test]
    fn quarter_rounds_to_nearest() {
        let world = world();
        let mut state = world.inner.lock();
        state.rotation = 500;
        assert_eq!(state.quarter(), 1);
        state.rotation = 1_990;
        assert_eq!(state.quarter(), 0);
        state.rotation = -500;
        assert_eq!(state.quarter(), 3);
    }

    #[test]
    fn af_history_decays_remanence() {
        let world = world();
        world.set_sample(Some(Vec3::new(1.0, 0.0, 0.0)));
        world.set_af_decay(10.0);
        world.inner.lock().max_af_mt = 10.0;
        let m = world.remanence().unwrap();
        assert!((m.x - (-1.0f64).exp()).abs() < 1e-12);
        world.set_sample(None);
        assert_eq!(world.remanence(), None);
    }

    #[test]
    fn sample_only_seen_at_measurement() {
        let world = world();
        world.set_holder(Vec3::ZERO);
        world.set_background(Vec3::ZERO);
        world.set_sample(Some(Vec3::new(1.0, 2.0, 3.0)));
        let mut state = world.inner.lock();
        assert_eq!(state.sensed_moment(), Vec3::ZERO);
        state.translation = state.offsets.measurement;
        assert_eq!(state.sensed_moment(), Vec3::new(1.0, 2.0, 3.0));
        state.rotation = state.pulses_per_revolution / 4;
        assert_eq!(state.sensed_moment(), Vec3::new(-2.0, 1.0, 3.0));
    }
}
