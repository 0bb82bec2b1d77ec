//! Station configuration using Figment
//!
//! Strongly-typed settings for the magnetometer station. Configuration is
//! loaded from:
//! 1. built-in defaults (every section has them)
//! 2. a TOML profile (e.g. `config/rockmag.toml`)
//! 3. environment variables prefixed with `ROCKMAG_`, using `__` between
//!    nested keys (`ROCKMAG_MEASURE__SN_THRESHOLD=5`)
//!
//! The same profile is written back by [`Settings::save`] at shutdown so that
//! calibration results and magnetometer range changes persist.
//!
//! # Example
//! ```no_run
//! use rockmag_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/rockmag.toml")?;
//! settings.validate()?;
//! println!("Magnetometer on {}", settings.magnetometer.port.path);
//! # Ok::<(), rockmag_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::measurement::{Axis, AxisSet, MeasureMode, Vec3, ZOrientation};
use crate::protocol::magnetometer::AxisConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level station configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Magnetometer port and per-axis settings
    pub magnetometer: MagnetometerConfig,
    /// AF demagnetizer mode, port and coil layout
    pub demagnetizer: DemagnetizerConfig,
    /// Sample handler mode, port and motion parameters
    pub handler: HandlerConfig,
    /// emu-per-flux-quantum constants and holder moment
    pub calibration: CalibrationConstants,
    /// Known moment of the calibration standard
    pub standard: StandardConfig,
    /// Orientation conventions for frame rotation
    pub orientation: OrientationConfig,
    /// Measurement options and repeat thresholds
    pub measure: MeasureOptions,
    /// AF demagnetization sequence parameters
    pub sequence: SequenceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory holding specimen files
    pub data_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Rock Magnetometer".to_string(),
            log_level: "info".to_string(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("rockmag"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

/// How a device is operated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Driven over its serial port
    #[default]
    Auto,
    /// Operated by hand; the operator is prompted
    Manual,
    /// Not installed
    None,
}

/// Serial port assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl PortConfig {
    fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
        }
    }
}

/// Magnetometer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagnetometerConfig {
    /// Settling delay before latching, in milliseconds
    pub settle_ms: u64,
    /// Number of analog samples averaged per reading
    pub analog_samples: u32,
    /// Serial port
    pub port: PortConfig,
    /// X axis settings (`enabled = false` when the axis is not installed)
    pub x: AxisConfig,
    /// Y axis settings
    pub y: AxisConfig,
    /// Z axis settings
    pub z: AxisConfig,
}

impl Default for MagnetometerConfig {
    fn default() -> Self {
        Self {
            port: PortConfig::new("/dev/ttyUSB0", 1200),
            x: AxisConfig::default(),
            y: AxisConfig::default(),
            z: AxisConfig::default(),
            settle_ms: 500,
            analog_samples: 1,
        }
    }
}

impl MagnetometerConfig {
    /// Settings for one axis.
    pub fn axis(&self, axis: Axis) -> &AxisConfig {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    /// Mutable settings for one axis.
    pub fn axis_mut(&mut self, axis: Axis) -> &mut AxisConfig {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
        }
    }

    /// Axes that are installed and enabled.
    pub fn enabled_axes(&self) -> AxisSet {
        let mut set = AxisSet::none();
        for axis in Axis::ALL {
            if self.axis(axis).enabled {
                set.insert(axis);
            }
        }
        set
    }

    /// Settling delay as a Duration.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// AF demagnetizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemagnetizerConfig {
    /// Operating mode
    pub mode: DeviceMode,
    /// Ramp-cycle watchdog, in seconds
    pub ramp_watchdog_secs: u64,
    /// Serial port (auto mode)
    pub port: PortConfig,
    /// Coils physically present
    pub coils: AxisSet,
    /// Sample axes to demagnetize at every AF step
    pub axes: AxisSet,
}

impl Default for DemagnetizerConfig {
    fn default() -> Self {
        Self {
            mode: DeviceMode::Auto,
            port: PortConfig::new("/dev/ttyUSB1", 1200),
            coils: AxisSet::all(),
            axes: AxisSet::all(),
            ramp_watchdog_secs: 240,
        }
    }
}

/// Absolute pulse offsets of the named translation positions, relative to Home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionOffsets {
    /// Sample loading position
    pub load: i64,
    /// X AF coil
    pub af_x: i64,
    /// Y AF coil
    pub af_y: i64,
    /// Z AF coil
    pub af_z: i64,
    /// Background (empty tube in the SQUID region)
    pub background: i64,
    /// Measurement (sample centred in the SQUID region)
    pub measurement: i64,
}

impl Default for PositionOffsets {
    fn default() -> Self {
        Self {
            load: 1_000,
            af_x: 9_000,
            af_y: 10_000,
            af_z: 8_000,
            background: 20_000,
            measurement: 40_000,
        }
    }
}

/// Sample handler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Operating mode
    pub mode: DeviceMode,
    /// Translation velocity outside the measurement region
    pub translation_velocity: u32,
    /// Velocity for Background <-> Measurement moves
    pub measurement_velocity: u32,
    /// Rotation velocity
    pub rotation_velocity: u32,
    /// Acceleration register value
    pub acceleration: u32,
    /// Deceleration register value
    pub deceleration: u32,
    /// Rotation pulses per full revolution
    pub pulses_per_revolution: u32,
    /// Pulse count used when seeking a limit switch
    pub limit_seek_pulses: u32,
    /// True when the right limit lies in the + direction
    pub right_limit_positive: bool,
    /// Motion watchdog, in seconds
    pub watchdog_secs: u64,
    /// Interval between completion polls, in milliseconds
    pub poll_ms: u64,
    /// Serial port (auto mode)
    pub port: PortConfig,
    /// Named translation positions
    pub positions: PositionOffsets,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            mode: DeviceMode::Auto,
            port: PortConfig::new("/dev/ttyUSB2", 9600),
            positions: PositionOffsets::default(),
            translation_velocity: 6_000,
            measurement_velocity: 2_000,
            rotation_velocity: 1_500,
            acceleration: 20,
            deceleration: 10,
            pulses_per_revolution: 2_000,
            limit_seek_pulses: 100_000,
            right_limit_positive: true,
            watchdog_secs: 60,
            poll_ms: 440,
        }
    }
}

impl HandlerConfig {
    /// Motion watchdog as a Duration.
    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    /// Completion poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

/// Process-wide calibration constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConstants {
    /// emu per flux quantum for each magnetometer axis
    pub emu_per_flux: Vec3,
    /// Empty-holder moment (emu, holder frame)
    pub holder: Vec3,
}

impl Default for CalibrationConstants {
    fn default() -> Self {
        Self {
            emu_per_flux: Vec3::new(-2.0e-5, -2.0e-5, -1.0e-5),
            holder: Vec3::ZERO,
        }
    }
}

impl CalibrationConstants {
    /// Calibration constant for one axis.
    pub fn for_axis(&self, axis: Axis) -> f64 {
        self.emu_per_flux[axis]
    }
}

/// Calibration standard description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardConfig {
    /// Known moment of the standard in the sample frame (emu)
    pub moment: Vec3,
}

impl Default for StandardConfig {
    fn default() -> Self {
        Self {
            moment: Vec3::new(1.0e-3, 1.0e-3, 1.0e-3),
        }
    }
}

/// Orientation conventions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrientationConfig {
    /// Rotation about Z taking instrument coordinates into core coordinates
    pub instrument_to_core_deg: f64,
    /// Local magnetic declination, added to azimuths taken with a magnetic compass
    pub magnetic_declination_deg: f64,
    /// Whether core, bedding and fold-hinge azimuths were measured with a magnetic compass
    pub field_azimuths_magnetic: bool,
}

/// How many rotation steps a measurement takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Fewest readings the axis layout allows
    #[default]
    Minimum,
    /// One full rotation (four readings)
    Single,
    /// `rotations` full rotations
    Multiple,
}

/// Measurement options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureOptions {
    /// Rotation mode
    pub rotation_mode: RotationMode,
    /// Number of rotations in multiple-rotation mode
    pub rotations: u32,
    /// How samples are loaded
    pub orientation: ZOrientation,
    /// Minimum acceptable S/N ratio
    pub sn_threshold: f64,
    /// Minimum acceptable S/Drift ratio
    pub sdrift_threshold: f64,
    /// Remeasure once when S/N is below threshold
    pub remeasure_low_sn: bool,
    /// Remeasure once when S/Drift is below threshold
    pub remeasure_low_sdrift: bool,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            rotation_mode: RotationMode::Minimum,
            rotations: 2,
            orientation: ZOrientation::PlusZ,
            sn_threshold: 10.0,
            sdrift_threshold: 10.0,
            remeasure_low_sn: true,
            remeasure_low_sdrift: true,
        }
    }
}

impl MeasureOptions {
    /// Rotation mode as a measurement-loop stopping policy.
    pub fn measure_mode(&self) -> MeasureMode {
        match self.rotation_mode {
            RotationMode::Minimum => MeasureMode::Minimum,
            RotationMode::Single => MeasureMode::SingleRotation,
            RotationMode::Multiple => MeasureMode::MultipleRotation(self.rotations),
        }
    }
}

/// AF demagnetization sequence parameters (mT).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// First level (0 = NRM, no demagnetization)
    pub start_mt: f64,
    /// Increment below the crossover
    pub increment1_mt: f64,
    /// Increment at and above the crossover
    pub increment2_mt: f64,
    /// Level at which the second increment takes over
    pub crossover_mt: f64,
    /// First stop value
    pub stop1_mt: f64,
    /// Second stop value; the sequence ends above the higher of the two
    pub stop2_mt: f64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            start_mt: 0.0,
            increment1_mt: 2.5,
            increment2_mt: 10.0,
            crossover_mt: 20.0,
            stop1_mt: 60.0,
            stop2_mt: 0.0,
        }
    }
}

/// Highest AF level the demagnetizer accepts (four-digit gauss).
pub const MAX_AF_LEVEL_MT: f64 = 999.9;

impl Settings {
    /// Load configuration from `config/rockmag.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/rockmag.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// Missing files fall back to defaults; malformed files are errors.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ROCKMAG_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Write the profile back as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot serialise settings: {e}")))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path.as_ref(), text)?;
        tracing::info!(path = %path.as_ref().display(), "Settings saved");
        Ok(())
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let axes = self.magnetometer.enabled_axes();
        if axes.len() < 2 {
            return Err(DaqError::Configuration(
                "At least two magnetometer axes must be enabled".into(),
            ));
        }
        if axes.len() == 2 && !axes.contains(Axis::Z) {
            return Err(DaqError::Configuration(
                "A two-axis magnetometer must include the Z axis".into(),
            ));
        }
        if self.magnetometer.analog_samples == 0 {
            return Err(DaqError::Configuration(
                "analog_samples must be at least 1".into(),
            ));
        }

        if self.measure.rotation_mode == RotationMode::Multiple && self.measure.rotations == 0 {
            return Err(DaqError::Configuration(
                "Multiple-rotation mode needs at least one rotation".into(),
            ));
        }
        if self.measure.sn_threshold < 0.0 || self.measure.sdrift_threshold < 0.0 {
            return Err(DaqError::Configuration(
                "Ratio thresholds must not be negative".into(),
            ));
        }

        let seq = &self.sequence;
        if seq.increment1_mt <= 0.0 || seq.increment2_mt <= 0.0 {
            return Err(DaqError::Configuration(
                "Sequence increments must be positive".into(),
            ));
        }
        let top = seq.stop1_mt.max(seq.stop2_mt);
        if seq.start_mt < 0.0 || top > MAX_AF_LEVEL_MT {
            return Err(DaqError::Configuration(format!(
                "AF levels must lie within 0..={MAX_AF_LEVEL_MT} mT"
            )));
        }

        if self.demagnetizer.mode != DeviceMode::None && self.demagnetizer.coils.is_empty() {
            return Err(DaqError::Configuration(
                "An installed demagnetizer needs at least one coil".into(),
            ));
        }

        if self.handler.pulses_per_revolution % 4 != 0 || self.handler.pulses_per_revolution == 0 {
            return Err(DaqError::Configuration(
                "pulses_per_revolution must be a positive multiple of 4".into(),
            ));
        }
        let p = &self.handler.positions;
        let mut offsets = vec![0, p.load, p.af_x, p.af_y, p.af_z, p.background, p.measurement];
        offsets.sort_unstable();
        offsets.dedup();
        if offsets.len() != 7 {
            return Err(DaqError::Configuration(
                "Handler positions must all have distinct offsets".into(),
            ));
        }

        Ok(())
    }
}
