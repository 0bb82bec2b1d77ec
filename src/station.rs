//! The station: settings, devices and the cancel flag in one context.
//!
//! Every workflow and measurement cycle borrows the station mutably, so only
//! one of them can drive the instruments at a time.

use crate::config::{DeviceMode, PortConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::measurement::{Axis, MeasurementCycle};
use crate::motion::{MotionController, SampleHandler};
use crate::operator::{CancelFlag, Operator};
use crate::protocol::{DemagnetizerProtocol, HandlerProtocol, MagnetometerProtocol};
use crate::serial::{open_channel, DynTransport};
use crate::sim::{SimDemagnetizer, SimHandler, SimMagnetometer, SimWorld};

/// The AF demagnetizer as installed.
pub enum Demagnetizer {
    /// Driven over its serial port
    Automatic(DemagnetizerProtocol),
    /// Operated by hand
    Manual,
    /// Not installed
    Absent,
}

/// Application context.
pub struct Station {
    /// Current settings; saved back at shutdown
    pub settings: Settings,
    /// Magnetometer
    pub magnetometer: MagnetometerProtocol,
    /// AF demagnetizer
    pub demagnetizer: Demagnetizer,
    /// Sample handler
    pub handler: SampleHandler,
    /// Operator cancel
    pub cancel: CancelFlag,
}

impl Station {
    /// Build a station over already-open transports.
    ///
    /// A device in automatic mode needs a transport; transports for manual or
    /// absent devices are ignored.
    pub fn from_transports(
        settings: Settings,
        magnetometer: DynTransport,
        demagnetizer: Option<DynTransport>,
        handler: Option<DynTransport>,
        cancel: CancelFlag,
    ) -> AppResult<Self> {
        let demagnetizer = match (settings.demagnetizer.mode, demagnetizer) {
            (DeviceMode::Auto, Some(t)) => Demagnetizer::Automatic(
                DemagnetizerProtocol::new(t).with_watchdog(std::time::Duration::from_secs(
                    settings.demagnetizer.ramp_watchdog_secs,
                )),
            ),
            (DeviceMode::Auto, None) => {
                return Err(DaqError::Configuration(
                    "AF demagnetizer is in auto mode but has no port".into(),
                ))
            }
            (DeviceMode::Manual, _) => Demagnetizer::Manual,
            (DeviceMode::None, _) => Demagnetizer::Absent,
        };

        let handler = match (settings.handler.mode, handler) {
            (DeviceMode::Auto, Some(t)) => SampleHandler::Automatic(MotionController::new(
                HandlerProtocol::new(t),
                settings.handler.clone(),
                cancel.clone(),
            )),
            (DeviceMode::Auto, None) => {
                return Err(DaqError::Configuration(
                    "Sample handler is in auto mode but has no port".into(),
                ))
            }
            (DeviceMode::Manual, _) => SampleHandler::manual(),
            (DeviceMode::None, _) => {
                return Err(DaqError::Configuration(
                    "A sample handler (auto or manual) is required".into(),
                ))
            }
        };

        Ok(Self {
            magnetometer: MagnetometerProtocol::new(magnetometer),
            demagnetizer,
            handler,
            cancel,
            settings,
        })
    }

    /// Open the serial ports named in `settings`.
    pub async fn connect(settings: Settings) -> AppResult<Self> {
        settings.validate()?;

        async fn open(port: &PortConfig, device: &str) -> AppResult<DynTransport> {
            let channel = open_channel(&port.path, port.baud_rate, device).await?;
            Ok(Box::new(channel))
        }

        let magnetometer = open(&settings.magnetometer.port, "Magnetometer").await?;
        let demagnetizer = match settings.demagnetizer.mode {
            DeviceMode::Auto => Some(open(&settings.demagnetizer.port, "AF demagnetizer").await?),
            _ => None,
        };
        let handler = match settings.handler.mode {
            DeviceMode::Auto => Some(open(&settings.handler.port, "Sample handler").await?),
            _ => None,
        };
        Self::from_transports(settings, magnetometer, demagnetizer, handler, CancelFlag::new())
    }

    /// A station whose devices are simulated against `world`.
    pub fn simulated(settings: Settings, world: &SimWorld) -> AppResult<Self> {
        settings.validate()?;
        Self::from_transports(
            settings,
            Box::new(SimMagnetometer::new(world.clone())),
            Some(Box::new(SimDemagnetizer::new(world.clone()))),
            Some(Box::new(SimHandler::new(world.clone()))),
            CancelFlag::new(),
        )
    }

    /// Push axis settings to the magnetometer, put the handler online and
    /// home it.
    pub async fn initialize(&mut self, operator: &dyn Operator) -> AppResult<()> {
        for axis in self.settings.magnetometer.enabled_axes().iter() {
            self.apply_axis_config(axis).await?;
        }
        if let SampleHandler::Automatic(controller) = &mut self.handler {
            controller.initialize().await?;
        }
        self.handler.home(operator).await?;
        tracing::info!("Station initialized");
        Ok(())
    }

    /// Send the configured range, filter and slew of `axis`.
    pub async fn apply_axis_config(&mut self, axis: Axis) -> AppResult<()> {
        let config = *self.settings.magnetometer.axis(axis);
        self.magnetometer.configure_axis(axis, &config).await?;
        Ok(())
    }

    /// Start a measurement cycle.
    pub fn cycle<'a>(&'a mut self, operator: &'a dyn Operator) -> MeasurementCycle<'a> {
        MeasurementCycle::new(self, operator)
    }

    /// Close every device link. All devices are attempted; the first error is returned.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let mut first_error: Option<DaqError> = None;

        if let Err(e) = self.magnetometer.close().await {
            tracing::warn!(error = %e, "Closing magnetometer failed");
            first_error.get_or_insert(e.into());
        }
        if let Demagnetizer::Automatic(af) = &mut self.demagnetizer {
            if let Err(e) = af.close().await {
                tracing::warn!(error = %e, "Closing AF demagnetizer failed");
                first_error.get_or_insert(e.into());
            }
        }
        if let Err(e) = self.handler.close().await {
            tracing::warn!(error = %e, "Closing sample handler failed");
            first_error.get_or_insert(e);
        }

        tracing::info!("Station shut down");
        first_error.map_or(Ok(()), Err)
    }
}
