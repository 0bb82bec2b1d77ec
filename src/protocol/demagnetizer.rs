//! AF demagnetizer controller protocol.
//!
//! A ramp cycle is configured with an amplitude (`DCA`, four-digit gauss) and a
//! coil (`DCC`), started with `DERC`, then polled with a status request sent
//! one character at a time until the controller reports completion or a fault.

use super::port::{CommandPort, PortTiming};
use crate::error::ProtocolError;
use crate::measurement::Axis;
use crate::serial::DynTransport;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::instrument;

const DEVICE: &str = "AF demagnetizer";

/// Tokens that mark a completed ramp cycle.
const DONE_TOKENS: [&str; 3] = ["DO", "ON", "NE"];
/// Tokens that mark a failed ramp cycle.
const ERROR_TOKENS: [&str; 2] = ["TRACK ERROR", "ZERO ERROR"];

/// Interval between ramp status polls.
pub const RAMP_POLL_INTERVAL: Duration = Duration::from_millis(440);
/// Default ramp watchdog.
pub const DEFAULT_RAMP_WATCHDOG: Duration = Duration::from_secs(240);
/// Largest amplitude the four-digit gauss field can carry, in gauss.
pub const MAX_GAUSS: u32 = 9999;

/// Convert a level in mT to the zero-padded gauss field of `DCA`.
pub fn amplitude_field(level_mt: f64) -> Result<String, ProtocolError> {
    let gauss = (level_mt * 10.0).round();
    if !gauss.is_finite() || gauss < 0.0 || gauss > f64::from(MAX_GAUSS) {
        return Err(ProtocolError::InvalidCommand {
            device: DEVICE,
            reason: format!("AF level {level_mt} mT does not fit a four-digit gauss field"),
        });
    }
    Ok(format!("{:04}", gauss as u32))
}

/// How a ramp status reply should be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RampStatus {
    /// Cycle complete
    Done,
    /// Controller reported a fault
    Fault(String),
    /// Nothing conclusive yet
    Pending,
}

/// Classify an accumulated status reply. Error tokens win over completion tokens.
pub fn classify_status(reply: &str) -> RampStatus {
    if let Some(token) = ERROR_TOKENS.iter().find(|t| reply.contains(*t)) {
        return RampStatus::Fault((*token).to_string());
    }
    if DONE_TOKENS.iter().any(|t| reply.contains(t)) {
        return RampStatus::Done;
    }
    RampStatus::Pending
}

/// Demagnetizer protocol adapter.
pub struct DemagnetizerProtocol {
    port: CommandPort,
    watchdog: Duration,
    poll_interval: Duration,
}

impl DemagnetizerProtocol {
    /// Adapter with the standard timing and watchdog.
    pub fn new(transport: DynTransport) -> Self {
        Self {
            port: CommandPort::new(DEVICE, transport, PortTiming::DEMAGNETIZER),
            watchdog: DEFAULT_RAMP_WATCHDOG,
            poll_interval: RAMP_POLL_INTERVAL,
        }
    }

    /// Override the ramp watchdog.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Set the ramp amplitude.
    #[instrument(skip(self))]
    pub async fn set_amplitude(&mut self, level_mt: f64) -> Result<(), ProtocolError> {
        let field = amplitude_field(level_mt)?;
        let echo = format!("DCA{field}");
        self.port
            .confirm("amplitude", &format!("{echo}\r"), &field)
            .await?;
        Ok(())
    }

    /// Select the coil for `axis`.
    #[instrument(skip(self))]
    pub async fn select_coil(&mut self, axis: Axis) -> Result<(), ProtocolError> {
        let echo = format!("DCC{}", axis.letter());
        self.port.confirm("coil", &format!("{echo}\r"), &echo).await?;
        Ok(())
    }

    /// Start a ramp cycle and wait for it to finish.
    ///
    /// Fails with [`ProtocolError::RampFault`] when the controller reports a
    /// tracking or zero error and with [`ProtocolError::RampTimeout`] when no
    /// conclusive status arrives before the watchdog.
    #[instrument(skip(self))]
    pub async fn execute_ramp(&mut self) -> Result<(), ProtocolError> {
        self.port.send("DERC\r").await?;
        let started = Instant::now();
        let mut reply = String::new();

        loop {
            sleep(self.poll_interval).await;
            self.port.write_chars("DSS\r").await?;
            sleep(self.port.timing().settle).await;
            reply.push_str(&self.port.read_available()?);

            match classify_status(&reply) {
                RampStatus::Done => {
                    tracing::info!(elapsed = ?started.elapsed(), "AF ramp cycle complete");
                    return Ok(());
                }
                RampStatus::Fault(token) => {
                    tracing::error!(%token, "AF ramp cycle failed");
                    return Err(ProtocolError::RampFault(token));
                }
                RampStatus::Pending => {}
            }

            // Keep only the tail so tokens split across polls still match.
            if reply.len() > 64 {
                let cut = reply.len() - 32;
                let cut = (cut..reply.len()).find(|i| reply.is_char_boundary(*i)).unwrap_or(0);
                reply.drain(..cut);
            }

            if started.elapsed() >= self.watchdog {
                tracing::error!(watchdog = ?self.watchdog, "AF ramp cycle not acknowledged");
                return Err(ProtocolError::RampTimeout(self.watchdog));
            }
        }
    }

    /// Configure and run one ramp on `axis` at `level_mt`.
    pub async fn demagnetize(&mut self, axis: Axis, level_mt: f64) -> Result<(), ProtocolError> {
        tracing::info!(%axis, level_mt, "Demagnetizing");
        self.set_amplitude(level_mt).await?;
        self.select_coil(axis).await?;
        self.execute_ramp().await
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

    fn controller(status_after: usize, status: &'static str) -> MockTransport {
        let mut status_polls = 0usize;
        MockTransport::with_responder("af", move |cmd| {
            let cmd = String::from_utf8_lossy(cmd).to_string();
            if cmd.starts_with("DCA") || cmd.starts_with("DCC") {
                vec![cmd.into_bytes()]
            } else if cmd == "\r" {
                status_polls += 1;
                if status_polls >= status_after {
                    vec![status.as_bytes().to_vec()]
                } else {
                    vec![b"BUSY\r".to_vec()]
                }
            } else {
                Vec::new()
            }
        })
    }

    #[test]
    fn amplitude_is_four_digit_gauss() {
        assert_eq!(amplitude_field(2.5).unwrap(), "0025");
        assert_eq!(amplitude_field(0.0).unwrap(), "0000");
        assert_eq!(amplitude_field(100.0).unwrap(), "1000");
        assert!(amplitude_field(1000.0).is_err());
        assert!(amplitude_field(-1.0).is_err());
    }

    #[test]
    fn error_tokens_take_precedence() {
        assert_eq!(classify_status("DONE\r"), RampStatus::Done);
        assert_eq!(
            classify_status("TRACK ERROR DONE\r"),
            RampStatus::Fault("TRACK ERROR".into())
        );
        assert_eq!(
            classify_status("ZERO ERROR"),
            RampStatus::Fault("ZERO ERROR".into())
        );
        assert_eq!(classify_status("BUSY"), RampStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn demagnetize_sends_expected_commands() {
        let mock = controller(2, "DONE\r");
        let log = mock.log();
        let mut af = DemagnetizerProtocol::new(Box::new(mock));
        af.demagnetize(Axis::Z, 12.5).await.unwrap();

        let writes = log.writes();
        assert_eq!(&writes[..3], &["DCA0125\r", "DCCZ\r", "DERC\r"]);
        assert_eq!(&writes[3..7], &["D", "S", "S", "\r"]);
    }

    #[tokio::test(start_paused = true)]
    async fn track_error_fails_the_ramp() {
        let mut af = DemagnetizerProtocol::new(Box::new(controller(1, "TRACK ERROR\r")));
        let err = af.demagnetize(Axis::X, 10.0).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RampFault(t) if t == "TRACK ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_status_is_not_discarded_by_the_next_poll() {
        let mut answered = false;
        let mock = MockTransport::with_responder("af", move |cmd| {
            if cmd.starts_with(b"DC") {
                vec![cmd.to_vec()]
            } else if cmd == b"\r" && !answered {
                answered = true;
                vec![Vec::new(), b"DONE\r".to_vec()]
            } else {
                Vec::new()
            }
        });
        let mut af = DemagnetizerProtocol::new(Box::new(mock)).with_watchdog(Duration::from_secs(5));
        af.demagnetize(Axis::Z, 5.0).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_hits_watchdog() {
        let mock = MockTransport::with_responder("af", |cmd| {
            if cmd.starts_with(b"DC") {
                vec![cmd.to_vec()]
            } else {
                Vec::new()
            }
        });
        let mut af = DemagnetizerProtocol::new(Box::new(mock)).with_watchdog(Duration::from_secs(5));
        let err = af.demagnetize(Axis::Y, 5.0).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RampTimeout(d) if d == Duration::from_secs(5)));
    }
}
