//! SQUID magnetometer controller protocol.
//!
//! Commands are `<target><mnemonic>\r` with target `A` (all axes) or one of
//! `X`, `Y`, `Z`. Configuration commands (`<axis>C<code>`) are echoed by the
//! controller and confirmed against the echo.
//!
//! Counts and analog data are read in two steps: a latch (`LC`/`LD`) freezes
//! the value, then a send (`SC`/`SD`) returns it. A send without a preceding
//! latch returns a stale value, so this adapter refuses it.

use super::port::{CommandPort, PortTiming};
use crate::error::ProtocolError;
use crate::measurement::{Axis, AxisSet, Vec3};
use crate::serial::DynTransport;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::instrument;

const DEVICE: &str = "Magnetometer";

/// Fixed analog range of one SQUID axis, most sensitive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Range {
    /// 1× (most sensitive)
    #[default]
    X1,
    /// 10×
    X10,
    /// 100×
    X100,
    /// Extended range
    Extended,
}

impl Range {
    /// Wire code following `CR`.
    pub fn code(self) -> char {
        match self {
            Range::X1 => '1',
            Range::X10 => 'T',
            Range::X100 => 'H',
            Range::Extended => 'E',
        }
    }

    /// Range for a wire code.
    pub fn from_code(code: char) -> Option<Range> {
        [Range::X1, Range::X10, Range::X100, Range::Extended]
            .into_iter()
            .find(|r| r.code() == code)
    }

    /// Next less sensitive range, if any.
    pub fn next(self) -> Option<Range> {
        match self {
            Range::X1 => Some(Range::X10),
            Range::X10 => Some(Range::X100),
            Range::X100 => Some(Range::Extended),
            Range::Extended => None,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Range::X1 => "1x",
            Range::X10 => "10x",
            Range::X100 => "100x",
            Range::Extended => "extended",
        };
        f.write_str(s)
    }
}

/// Analog filter bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    /// 1 Hz
    #[default]
    Hz1,
    /// 10 Hz
    Hz10,
    /// 100 Hz
    Hz100,
    /// Wide band
    Wide,
}

impl Filter {
    /// Wire code following `CF`.
    pub fn code(self) -> char {
        match self {
            Filter::Hz1 => '1',
            Filter::Hz10 => 'T',
            Filter::Hz100 => 'H',
            Filter::Wide => 'E',
        }
    }
}

/// Configuration of one magnetometer axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    /// Axis physically present and used
    pub enabled: bool,
    /// Analog range
    pub range: Range,
    /// Filter bandwidth
    pub filter: Filter,
    /// Fast slew rate
    pub fast_slew: bool,
    /// Whole flux quanta are counted and added to the analog value
    pub flux_counting: bool,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            range: Range::X1,
            filter: Filter::Hz1,
            fast_slew: false,
            flux_counting: false,
        }
    }
}

/// Command target: one axis or all at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// All axes (`A`)
    All,
    /// A single axis
    Axis(Axis),
}

impl Target {
    fn letter(self) -> char {
        match self {
            Target::All => 'A',
            Target::Axis(axis) => axis.letter(),
        }
    }

    fn axes(self) -> impl Iterator<Item = Axis> {
        let only = match self {
            Target::All => None,
            Target::Axis(axis) => Some(axis),
        };
        Axis::ALL
            .into_iter()
            .filter(move |a| only.map_or(true, |o| o == *a))
    }
}

/// Magnetometer protocol adapter.
pub struct MagnetometerProtocol {
    port: CommandPort,
    count_latched: [bool; 3],
    data_latched: [bool; 3],
}

impl MagnetometerProtocol {
    /// Adapter over `transport` with the standard magnetometer timing.
    pub fn new(transport: DynTransport) -> Self {
        Self::with_timing(transport, PortTiming::MAGNETOMETER)
    }

    /// Adapter with explicit timing.
    pub fn with_timing(transport: DynTransport, timing: PortTiming) -> Self {
        Self {
            port: CommandPort::new(DEVICE, transport, timing),
            count_latched: [false; 3],
            data_latched: [false; 3],
        }
    }

    async fn configure(&mut self, axis: Axis, register: &str, code: &str) -> Result<(), ProtocolError> {
        let echo = format!("{}C{}", axis.letter(), code);
        let command = format!("{echo}\r");
        let register = format!("{axis} {register}");
        self.port.confirm(&register, &command, &echo).await?;
        Ok(())
    }

    /// Set the analog range of `axis`.
    #[instrument(skip(self))]
    pub async fn set_range(&mut self, axis: Axis, range: Range) -> Result<(), ProtocolError> {
        self.configure(axis, "range", &format!("R{}", range.code())).await
    }

    /// Set the filter bandwidth of `axis`.
    #[instrument(skip(self))]
    pub async fn set_filter(&mut self, axis: Axis, filter: Filter) -> Result<(), ProtocolError> {
        self.configure(axis, "filter", &format!("F{}", filter.code())).await
    }

    /// Enable or disable fast slew on `axis`.
    #[instrument(skip(self))]
    pub async fn set_fast_slew(&mut self, axis: Axis, enabled: bool) -> Result<(), ProtocolError> {
        let code = if enabled { "SE" } else { "SD" };
        self.configure(axis, "slew", code).await
    }

    /// Push range, filter and slew for one axis.
    pub async fn configure_axis(&mut self, axis: Axis, config: &AxisConfig) -> Result<(), ProtocolError> {
        self.set_range(axis, config.range).await?;
        self.set_filter(axis, config.filter).await?;
        self.set_fast_slew(axis, config.fast_slew).await?;
        tracing::info!(%axis, range = %config.range, flux_counting = config.flux_counting, "Configured magnetometer axis");
        Ok(())
    }

    /// Latch the flux counters of `target`.
    pub async fn latch_count(&mut self, target: Target) -> Result<(), ProtocolError> {
        self.port.send(&format!("{}LC\r", target.letter())).await?;
        for axis in target.axes() {
            self.count_latched[axis.index()] = true;
        }
        Ok(())
    }

    /// Latch the analog data of `target`.
    pub async fn latch_data(&mut self, target: Target) -> Result<(), ProtocolError> {
        self.port.send(&format!("{}LD\r", target.letter())).await?;
        for axis in target.axes() {
            self.data_latched[axis.index()] = true;
        }
        Ok(())
    }

    /// Read the latched flux count of `axis`. Consumes the latch.
    pub async fn read_count(&mut self, axis: Axis) -> Result<i64, ProtocolError> {
        if !std::mem::take(&mut self.count_latched[axis.index()]) {
            return Err(ProtocolError::NotLatched { axis, what: "count" });
        }
        let reply = self.port.query(&format!("{}SC\r", axis.letter()), '\r').await?;
        reply.parse::<i64>().map_err(|_| ProtocolError::Parse {
            device: DEVICE,
            reply,
            expected: "signed integer count",
        })
    }

    /// Read the latched analog value of `axis` in flux quanta. Consumes the latch.
    pub async fn read_data(&mut self, axis: Axis) -> Result<f64, ProtocolError> {
        if !std::mem::take(&mut self.data_latched[axis.index()]) {
            return Err(ProtocolError::NotLatched { axis, what: "data" });
        }
        let reply = self.port.query(&format!("{}SD\r", axis.letter()), '\r').await?;
        reply.parse::<f64>().map_err(|_| ProtocolError::Parse {
            device: DEVICE,
            reply,
            expected: "signed float",
        })
    }

    /// Latch and read the flux counts of every axis in `axes`.
    pub async fn read_counts(&mut self, axes: AxisSet) -> Result<[i64; 3], ProtocolError> {
        self.latch_count(Target::All).await?;
        let mut counts = [0; 3];
        for axis in axes.iter() {
            counts[axis.index()] = self.read_count(axis).await?;
        }
        Ok(counts)
    }

    /// Mean of `samples` latched analog readings on every axis in `axes`.
    pub async fn read_analog_mean(&mut self, axes: AxisSet, samples: u32) -> Result<Vec3, ProtocolError> {
        let samples = samples.max(1);
        let mut sum = Vec3::ZERO;
        for _ in 0..samples {
            self.latch_data(Target::All).await?;
            for axis in axes.iter() {
                sum[axis] += self.read_data(axis).await?;
            }
        }
        Ok(sum * (1.0 / f64::from(samples)))
    }

    /// Pulse the feedback loop of `target`.
    #[instrument(skip(self))]
    pub async fn pulse_loop(&mut self, target: Target) -> Result<(), ProtocolError> {
        self.port.send(&format!("{}CLP\r", target.letter())).await
    }

    /// Clear and reset the flux counters of `target`.
    #[instrument(skip(self))]
    pub async fn reset_count(&mut self, target: Target) -> Result<(), ProtocolError> {
        let letter = target.letter();
        self.port.send(&format!("{letter}CLC\r")).await?;
        self.port.send(&format!("{letter}RC\r")).await?;
        for axis in target.axes() {
            self.count_latched[axis.index()] = false;
        }
        Ok(())
    }

    /// Close the serial link.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.port.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockTransport;

    /// Echoes configuration commands and answers SC/SD with fixed values.
    fn echo_device() -> MockTransport {
        MockTransport::with_responder("mag", |cmd| {
            let cmd = String::from_utf8_lossy(cmd).trim_end().to_string();
            if cmd.ends_with("SC") {
                vec![b"-42\r\n".to_vec()]
            } else if cmd.ends_with("SD") {
                vec![b"+1.500000E-01\r\n".to_vec()]
            } else if cmd.len() > 2 && &cmd[1..2] == "C" {
                vec![format!("{cmd}\r\n").into_bytes()]
            } else {
                Vec::new()
            }
        })
    }

    #[test]
    fn range_steps_up_to_extended() {
        assert_eq!(Range::X1.next(), Some(Range::X10));
        assert_eq!(Range::X100.next(), Some(Range::Extended));
        assert_eq!(Range::Extended.next(), None);
        assert_eq!(Range::from_code('H'), Some(Range::X100));
        assert_eq!(Range::from_code('Q'), None);
    }

    #[tokio::test(start_paused = true)]
    async fn configure_axis_sends_range_filter_slew() {
        let mock = echo_device();
        let log = mock.log();
        let mut mag = MagnetometerProtocol::new(Box::new(mock));
        let config = AxisConfig {
            range: Range::X100,
            fast_slew: true,
            ..AxisConfig::default()
        };
        mag.configure_axis(Axis::Z, &config).await.unwrap();
        assert_eq!(log.writes(), vec!["ZCRH\r", "ZCF1\r", "ZCSE\r"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_range_names_axis_and_register() {
        let mut mag = MagnetometerProtocol::new(Box::new(MockTransport::scripted("mag", vec![])));
        let err = mag.set_range(Axis::Y, Range::X10).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Y range"), "{msg}");
        assert!(msg.contains("YCRT"), "{msg}");
    }

    #[tokio::test(start_paused = true)]
    async fn read_requires_latch_and_consumes_it() {
        let mut mag = MagnetometerProtocol::new(Box::new(echo_device()));
        assert!(matches!(
            mag.read_count(Axis::X).await,
            Err(ProtocolError::NotLatched { axis: Axis::X, .. })
        ));

        mag.latch_count(Target::All).await.unwrap();
        assert_eq!(mag.read_count(Axis::X).await.unwrap(), -42);
        assert!(mag.read_count(Axis::X).await.is_err());
        assert_eq!(mag.read_count(Axis::Z).await.unwrap(), -42);
    }

    #[tokio::test(start_paused = true)]
    async fn analog_mean_latches_each_sample() {
        let mock = echo_device();
        let log = mock.log();
        let mut mag = MagnetometerProtocol::new(Box::new(mock));
        let mean = mag
            .read_analog_mean(AxisSet::of(&[Axis::X, Axis::Z]), 2)
            .await
            .unwrap();
        assert!((mean.x - 0.15).abs() < 1e-12);
        assert_eq!(mean.y, 0.0);
        let latches = log.writes().iter().filter(|w| *w == "ALD\r").count();
        assert_eq!(latches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_count_clears_then_resets() {
        let mock = echo_device();
        let log = mock.log();
        let mut mag = MagnetometerProtocol::new(Box::new(mock));
        mag.reset_count(Target::Axis(Axis::Z)).await.unwrap();
        assert_eq!(log.writes(), vec!["ZCLC\r", "ZRC\r"]);
    }
}
