//! Command/confirm plumbing shared by the device adapters.

use crate::error::ProtocolError;
use crate::serial::{DynTransport, Transport};
use std::time::Duration;
use tokio::time::sleep;

/// Bytes requested per non-blocking read.
const READ_CHUNK: usize = 256;
/// Upper bound on reads while discarding stale input.
const MAX_DRAIN_READS: usize = 64;

/// Fixed delays for one device's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTiming {
    /// Wait after a command before the first reply poll
    pub settle: Duration,
    /// Sleep between reply polls
    pub poll_interval: Duration,
    /// Number of reply polls before a confirmation fails
    pub confirm_polls: usize,
    /// Delay between characters for per-character sends
    pub char_delay: Duration,
    /// Minimum gap after any command before the next one
    pub command_gap: Duration,
}

impl PortTiming {
    /// Magnetometer: short settle, fast polls.
    pub const MAGNETOMETER: PortTiming = PortTiming {
        settle: Duration::from_millis(110),
        poll_interval: Duration::from_millis(50),
        confirm_polls: 3,
        char_delay: Duration::from_millis(5),
        command_gap: Duration::from_millis(20),
    };

    /// Sample handler.
    pub const HANDLER: PortTiming = PortTiming {
        settle: Duration::from_millis(220),
        poll_interval: Duration::from_millis(100),
        confirm_polls: 3,
        char_delay: Duration::from_millis(5),
        command_gap: Duration::from_millis(50),
    };

    /// AF demagnetizer: slow controller, long settle.
    pub const DEMAGNETIZER: PortTiming = PortTiming {
        settle: Duration::from_millis(440),
        poll_interval: Duration::from_millis(110),
        confirm_polls: 3,
        char_delay: Duration::from_millis(30),
        command_gap: Duration::from_millis(50),
    };
}

/// A device's transport plus its protocol timing.
pub struct CommandPort {
    device: &'static str,
    transport: DynTransport,
    timing: PortTiming,
}

impl CommandPort {
    /// Wrap `transport` for the named device.
    pub fn new(device: &'static str, transport: DynTransport, timing: PortTiming) -> Self {
        Self {
            device,
            transport,
            timing,
        }
    }

    /// Device name used in diagnostics.
    pub fn device(&self) -> &'static str {
        self.device
    }

    /// Protocol timing.
    pub fn timing(&self) -> PortTiming {
        self.timing
    }

    /// Discard anything left in the receive buffer, returning the byte count.
    pub fn drain(&mut self) -> Result<usize, ProtocolError> {
        let mut discarded = 0;
        for _ in 0..MAX_DRAIN_READS {
            let stale = self.transport.read(READ_CHUNK)?;
            if stale.is_empty() {
                break;
            }
            discarded += stale.len();
        }
        if discarded > 0 {
            tracing::debug!(
                device = self.device,
                discarded,
                "Discarded stale bytes before command"
            );
        }
        Ok(discarded)
    }

    /// Send a complete command string.
    pub async fn send(&mut self, command: &str) -> Result<(), ProtocolError> {
        self.drain()?;
        tracing::trace!(device = self.device, command = %command.escape_debug(), "send");
        self.transport.write(command.as_bytes()).await?;
        sleep(self.timing.command_gap).await;
        Ok(())
    }

    /// Send a command one character at a time with the inter-character delay.
    ///
    /// Unlike [`CommandPort::send`] nothing buffered is discarded first, so a
    /// status reply still arriving from the previous poll is kept.
    pub async fn write_chars(&mut self, command: &str) -> Result<(), ProtocolError> {
        tracing::trace!(device = self.device, command = %command.escape_debug(), "send per character");
        let mut buf = [0u8; 4];
        for ch in command.chars() {
            self.transport.write(ch.encode_utf8(&mut buf).as_bytes()).await?;
            sleep(self.timing.char_delay).await;
        }
        Ok(())
    }

    /// Non-blocking read of whatever is buffered, as text.
    pub fn read_available(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.transport.read(READ_CHUNK)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Wait the settle delay, then poll until `done` accepts the accumulated
    /// reply or the poll budget runs out. Returns the accumulated reply and
    /// whether it was accepted.
    async fn collect<F>(&mut self, polls: usize, done: F) -> Result<(String, bool), ProtocolError>
    where
        F: Fn(&str) -> bool,
    {
        sleep(self.timing.settle).await;
        let mut reply = String::new();
        for attempt in 0..polls {
            if attempt > 0 {
                sleep(self.timing.poll_interval).await;
            }
            reply.push_str(&self.read_available()?);
            if done(&reply) {
                return Ok((reply, true));
            }
        }
        Ok((reply, false))
    }

    /// Send `command` and require a reply containing `expected`.
    ///
    /// The reply is polled [`PortTiming::confirm_polls`] times after the
    /// settle delay. A missing or mismatched reply is a
    /// [`ProtocolError::Confirmation`] naming `register`.
    pub async fn confirm(
        &mut self,
        register: &str,
        command: &str,
        expected: &str,
    ) -> Result<String, ProtocolError> {
        self.confirm_by(register, command, expected, |r| r.contains(expected))
            .await
    }

    /// Like [`CommandPort::confirm`], with `accept` deciding whether the
    /// accumulated reply carries `expected`.
    pub async fn confirm_by<F>(
        &mut self,
        register: &str,
        command: &str,
        expected: &str,
        accept: F,
    ) -> Result<String, ProtocolError>
    where
        F: Fn(&str) -> bool,
    {
        self.send(command).await?;
        let polls = self.timing.confirm_polls;
        let (reply, ok) = self.collect(polls, accept).await?;
        if ok {
            Ok(reply)
        } else {
            tracing::warn!(
                device = self.device,
                register,
                expected,
                actual = %reply.trim(),
                "Confirmation failed"
            );
            Err(ProtocolError::Confirmation {
                device: self.device,
                register: register.to_string(),
                expected: expected.to_string(),
                actual: reply.trim().to_string(),
            })
        }
    }

    /// Send `command` and require any non-empty reply.
    pub async fn acknowledge(&mut self, register: &str, command: &str) -> Result<String, ProtocolError> {
        self.send(command).await?;
        let polls = self.timing.confirm_polls;
        let (reply, ok) = self.collect(polls, |r| !r.trim().is_empty()).await?;
        if ok {
            Ok(reply)
        } else {
            Err(ProtocolError::Confirmation {
                device: self.device,
                register: register.to_string(),
                expected: "any reply".to_string(),
                actual: String::new(),
            })
        }
    }

    /// Send `command` and return the reply up to `terminator`, trimmed.
    pub async fn query(&mut self, command: &str, terminator: char) -> Result<String, ProtocolError> {
        self.send(command).await?;
        let polls = self.timing.confirm_polls;
        let (reply, _) = self.collect(polls, |r| r.contains(terminator)).await?;
        let line = reply.split(terminator).next().unwrap_or_default().trim();
        if line.is_empty() {
            return Err(ProtocolError::NoReply {
                device: self.device,
                command: command.trim_end().to_string(),
            });
        }
        Ok(line.to_string())
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.transport.close().await?;
        Ok(())
    }
}
