//! Sample handler (stepper indexer) protocol.
//!
//! Commands are `<register><contents>,`. Parameter registers are read back
//! with a verify command (`V<register><contents>,`) and confirmed only when
//! the reply echoes the whole register field as it was sent. Velocity is only acknowledged because the
//! indexer rounds some velocities to the nearest value it supports.

use super::port::{CommandPort, PortTiming};
use crate::error::ProtocolError;
use crate::serial::DynTransport;
use std::fmt;
use tracing::instrument;

const DEVICE: &str = "Sample handler";

/// Command delimiter.
pub const DELIMITER: char = ',';

/// Handler register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// `A`: acceleration
    Acceleration,
    /// `D`: deceleration
    Deceleration,
    /// `M`: maximum velocity
    Velocity,
    /// `N`: pulse count
    Count,
    /// `O1,`: motor select (translation / rotation)
    AxisSelect,
    /// `+`: positive direction
    Plus,
    /// `-`: negative direction
    Minus,
    /// `G`: go
    Go,
    /// `H`: seek home
    SeekHome,
    /// `@`: go online
    Online,
    /// `F`: status request
    Status,
    /// `V`: verify a register
    Verify,
}

impl Register {
    /// Every register.
    pub const ALL: [Register; 12] = [
        Register::Acceleration,
        Register::Deceleration,
        Register::Velocity,
        Register::Count,
        Register::AxisSelect,
        Register::Plus,
        Register::Minus,
        Register::Go,
        Register::SeekHome,
        Register::Online,
        Register::Status,
        Register::Verify,
    ];

    /// Wire prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Register::Acceleration => "A",
            Register::Deceleration => "D",
            Register::Velocity => "M",
            Register::Count => "N",
            Register::AxisSelect => "O1,",
            Register::Plus => "+",
            Register::Minus => "-",
            Register::Go => "G",
            Register::SeekHome => "H",
            Register::Online => "@",
            Register::Status => "F",
            Register::Verify => "V",
        }
    }

    /// Register name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Register::Acceleration => "acceleration",
            Register::Deceleration => "deceleration",
            Register::Velocity => "velocity",
            Register::Count => "pulse count",
            Register::AxisSelect => "axis select",
            Register::Plus => "direction +",
            Register::Minus => "direction -",
            Register::Go => "go",
            Register::SeekHome => "seek home",
            Register::Online => "online",
            Register::Status => "status",
            Register::Verify => "verify",
        }
    }

    /// Prefix used inside a verify command.
    fn verify_prefix(self) -> &'static str {
        match self {
            Register::AxisSelect => "O",
            other => other.prefix(),
        }
    }
}

/// One encoded handler command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCommand {
    register: Register,
    contents: String,
}

impl HandlerCommand {
    /// Build a command. `contents` may not contain the delimiter.
    pub fn new(register: Register, contents: impl Into<String>) -> Result<Self, ProtocolError> {
        let contents = contents.into();
        if contents.contains(DELIMITER) {
            return Err(ProtocolError::InvalidCommand {
                device: DEVICE,
                reason: format!("contents '{contents}' contain the '{DELIMITER}' delimiter"),
            });
        }
        Ok(Self { register, contents })
    }

    /// Register addressed.
    pub fn register(&self) -> Register {
        self.register
    }

    /// Command contents.
    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Wire form: `<register><contents>,`.
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.register.prefix(), self.contents, DELIMITER)
    }

    /// Verify command for this register: `V<register><contents>,`.
    pub fn verify(&self) -> String {
        format!(
            "{}{}{}{}",
            Register::Verify.prefix(),
            self.register.verify_prefix(),
            if self.register == Register::AxisSelect {
                ""
            } else {
                self.contents.as_str()
            },
            DELIMITER
        )
    }

    /// Parse a wire command produced by [`HandlerCommand::encode`].
    pub fn parse(wire: &str) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidCommand {
            device: DEVICE,
            reason: format!("'{wire}': {reason}"),
        };
        let body = wire
            .strip_suffix(DELIMITER)
            .ok_or_else(|| invalid("missing trailing delimiter"))?;
        let register = Register::ALL
            .into_iter()
            .find(|r| body.starts_with(r.prefix()))
            .ok_or_else(|| invalid("unknown register"))?;
        let contents = &body[register.prefix().len()..];
        Self::new(register, contents)
    }
}

impl fmt::Display for HandlerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Which motor a move drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAxis {
    /// Vertical translation along the tube
    Translation,
    /// Rotation about the tube axis
    Rotation,
}

impl MotionAxis {
    fn contents(self) -> &'static str {
        match self {
            MotionAxis::Translation => "0",
            MotionAxis::Rotation => "1",
        }
    }
}

/// Direction of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Increasing pulse offsets
    Positive,
    /// Decreasing pulse offsets
    Negative,
}

impl Direction {
    /// Direction of a signed pulse delta.
    pub fn of(delta: i64) -> Self {
        if delta < 0 {
            Direction::Negative
        } else {
            Direction::Positive
        }
    }

    /// Opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Positive => Direction::Negative,
            Direction::Negative => Direction::Positive,
        }
    }
}

/// Full parameter set for one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveParams {
    /// Motor
    pub axis: MotionAxis,
    /// Acceleration
    pub acceleration: u32,
    /// Deceleration
    pub deceleration: u32,
    /// Velocity in pulses per second
    pub velocity: u32,
    /// Unsigned pulse count
    pub pulses: u64,
    /// Direction
    pub direction: Direction,
}

/// Handler protocol adapter.
pub struct HandlerProtocol {
    port: CommandPort,
    armed: bool,
}

impl HandlerProtocol {
    /// Adapter with the standard handler timing.
    pub fn new(transport: DynTransport) -> Self {
        Self::with_timing(transport, PortTiming::HANDLER)
    }

    /// Adapter with explicit timing.
    pub fn with_timing(transport: DynTransport, timing: PortTiming) -> Self {
        Self {
            port: CommandPort::new(DEVICE, transport, timing),
            armed: false,
        }
    }

    /// Whether a move has been configured and not yet started.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    async fn set(&mut self, command: HandlerCommand) -> Result<(), ProtocolError> {
        self.port.send(&command.encode()).await?;
        let register = command.register().name();
        if command.register() == Register::Velocity {
            self.port.acknowledge(register, &command.verify()).await?;
        } else {
            let expected = command.encode();
            self.port
                .confirm_by(register, &command.verify(), &expected, |reply| {
                    echoes(reply, &expected)
                })
                .await?;
        }
        Ok(())
    }

    /// Put the indexer online.
    pub async fn set_online(&mut self) -> Result<(), ProtocolError> {
        self.port
            .send(&HandlerCommand::new(Register::Online, "0")?.encode())
            .await
    }

    /// Select the motor for following commands.
    pub async fn select_axis(&mut self, axis: MotionAxis) -> Result<(), ProtocolError> {
        self.set(HandlerCommand::new(Register::AxisSelect, axis.contents())?)
            .await
    }

    /// Set acceleration.
    pub async fn set_acceleration(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.set(HandlerCommand::new(Register::Acceleration, value.to_string())?)
            .await
    }

    /// Set deceleration.
    pub async fn set_deceleration(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.set(HandlerCommand::new(Register::Deceleration, value.to_string())?)
            .await
    }

    /// Set velocity.
    pub async fn set_velocity(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.set(HandlerCommand::new(Register::Velocity, value.to_string())?)
            .await
    }

    /// Set the pulse count of the next move.
    pub async fn set_count(&mut self, pulses: u64) -> Result<(), ProtocolError> {
        self.set(HandlerCommand::new(Register::Count, pulses.to_string())?)
            .await
    }

    /// Set the direction of the next move.
    pub async fn set_direction(&mut self, direction: Direction) -> Result<(), ProtocolError> {
        let register = match direction {
            Direction::Positive => Register::Plus,
            Direction::Negative => Register::Minus,
        };
        self.port
            .send(&HandlerCommand::new(register, "")?.encode())
            .await
    }

    /// Issue every parameter of a move in order (axis, acceleration,
    /// deceleration, velocity, count, direction) and arm it.
    #[instrument(skip(self), fields(axis = ?params.axis, pulses = params.pulses))]
    pub async fn configure_move(&mut self, params: &MoveParams) -> Result<(), ProtocolError> {
        self.armed = false;
        self.select_axis(params.axis).await?;
        self.set_acceleration(params.acceleration).await?;
        self.set_deceleration(params.deceleration).await?;
        self.set_velocity(params.velocity).await?;
        self.set_count(params.pulses).await?;
        self.set_direction(params.direction).await?;
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), ProtocolError> {
        if std::mem::take(&mut self.armed) {
            Ok(())
        } else {
            Err(ProtocolError::NotArmed)
        }
    }

    /// Start the configured move.
    pub async fn go(&mut self) -> Result<(), ProtocolError> {
        self.disarm()?;
        self.port
            .send(&HandlerCommand::new(Register::Go, "")?.encode())
            .await
    }

    /// Start the configured move as a home seek.
    pub async fn seek_home(&mut self) -> Result<(), ProtocolError> {
        self.disarm()?;
        self.port
            .send(&HandlerCommand::new(Register::SeekHome, "1")?.encode())
            .await
    }

    /// Whether the selected motor is still moving.
    pub async fn is_moving(&mut self) -> Result<bool, ProtocolError> {
        let command = HandlerCommand::new(Register::Status, "%")?.encode();
        let reply = self.port.query(&command, DELIMITER).await?;
        if reply.contains("F1") {
            Ok(true)
        } else if reply.contains("F0") {
            Ok(false)
        } else {
            Err(ProtocolError::Parse {
                device: DEVICE,
                reply,
                expected: "status F0 or F1",
            })
        }
    }

    /// Close the serial link.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.port.close().await
    }
}

/// True when `reply` carries `field` as a whole register echo, not as part of
/// a longer value.
fn echoes(reply: &str, field: &str) -> bool {
    reply.match_indices(field).any(|(at, _)| {
        reply[..at]
            .chars()
            .next_back()
            .map_or(true, |c| matches!(c, ',' | '\r' | '\n' | ' '))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockTransport;

    /// Indexer that remembers set registers and answers verify commands with them.
    fn indexer(coerce_velocity: bool) -> MockTransport {
        let mut last_set = String::new();
        MockTransport::with_responder("handler", move |cmd| {
            let cmd = String::from_utf8_lossy(cmd).to_string();
            if cmd.starts_with('V') {
                let reply = if cmd.starts_with("VM") && coerce_velocity {
                    "M5990,".to_string()
                } else {
                    last_set.clone()
                };
                vec![reply.into_bytes()]
            } else if cmd.starts_with('F') {
                vec![b"F0,".to_vec()]
            } else {
                last_set = cmd;
                Vec::new()
            }
        })
    }

    fn params() -> MoveParams {
        MoveParams {
            axis: MotionAxis::Translation,
            acceleration: 20,
            deceleration: 10,
            velocity: 6000,
            pulses: 1500,
            direction: Direction::Negative,
        }
    }

    #[test]
    fn encode_and_parse() {
        let cmd = HandlerCommand::new(Register::AxisSelect, "1").unwrap();
        assert_eq!(cmd.encode(), "O1,1,");
        assert_eq!(cmd.verify(), "VO,");
        assert_eq!(HandlerCommand::parse("O1,1,").unwrap(), cmd);

        let cmd = HandlerCommand::parse("N1500,").unwrap();
        assert_eq!(cmd.register(), Register::Count);
        assert_eq!(cmd.contents(), "1500");
        assert_eq!(cmd.verify(), "VN1500,");

        assert_eq!(HandlerCommand::parse("G,").unwrap().contents(), "");
    }

    #[test]
    fn contents_may_not_contain_delimiter() {
        assert!(HandlerCommand::new(Register::Count, "1,2").is_err());
        assert!(HandlerCommand::parse("N15").is_err());
        assert!(HandlerCommand::parse("Q1,").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn configure_move_issues_registers_in_order() {
        let mock = indexer(false);
        let log = mock.log();
        let mut handler = HandlerProtocol::new(Box::new(mock));
        handler.configure_move(&params()).await.unwrap();
        assert!(handler.is_armed());

        let sets: Vec<String> = log
            .writes()
            .into_iter()
            .filter(|w| !w.starts_with('V'))
            .collect();
        assert_eq!(sets, vec!["O1,0,", "A20,", "D10,", "M6000,", "N1500,", "-,"]);

        handler.go().await.unwrap();
        assert!(!handler.is_armed());
        assert_eq!(log.writes().last().map(String::as_str), Some("G,"));
    }

    #[tokio::test(start_paused = true)]
    async fn coerced_velocity_is_accepted() {
        let mut handler = HandlerProtocol::new(Box::new(indexer(true)));
        handler.configure_move(&params()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn go_requires_configured_move() {
        let mut handler = HandlerProtocol::new(Box::new(indexer(false)));
        assert!(matches!(handler.go().await, Err(ProtocolError::NotArmed)));
        assert!(matches!(handler.seek_home().await, Err(ProtocolError::NotArmed)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verify_leaves_move_unarmed() {
        let mock = MockTransport::with_responder("handler", |cmd| {
            if cmd.starts_with(b"VA") {
                vec![b"A99,".to_vec()]
            } else if cmd.starts_with(b"V") {
                vec![b"O1,0,".to_vec()]
            } else {
                Vec::new()
            }
        });
        let mut handler = HandlerProtocol::new(Box::new(mock));
        let err = handler.configure_move(&params()).await.unwrap_err();
        assert!(err.to_string().contains("acceleration"));
        assert!(!handler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_axis_echo_is_rejected() {
        let mock = MockTransport::with_responder("handler", |cmd| {
            if cmd.starts_with(b"V") {
                vec![b"O1,0,".to_vec()]
            } else {
                Vec::new()
            }
        });
        let mut handler = HandlerProtocol::new(Box::new(mock));
        let err = handler.select_axis(MotionAxis::Rotation).await.unwrap_err();
        match err {
            ProtocolError::Confirmation {
                register,
                expected,
                actual,
                ..
            } => {
                assert_eq!(register, Register::AxisSelect.name());
                assert_eq!(expected, "O1,1,");
                assert_eq!(actual, "O1,0,");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn longer_count_echo_is_rejected() {
        let mock = MockTransport::with_responder("handler", |cmd| {
            if cmd.starts_with(b"V") {
                vec![b"N15000,".to_vec()]
            } else {
                Vec::new()
            }
        });
        let mut handler = HandlerProtocol::new(Box::new(mock));
        assert!(handler.set_count(1500).await.is_err());
    }

    #[test]
    fn echo_must_be_a_whole_field() {
        assert!(echoes("N1500,", "N1500,"));
        assert!(echoes("\r\nO1,1,", "O1,1,"));
        assert!(!echoes("N15000,", "N1500,"));
        assert!(!echoes("XN1500,", "N1500,"));
        assert!(!echoes("O1,0,", "O1,1,"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_stopped() {
        let mut handler = HandlerProtocol::new(Box::new(indexer(false)));
        assert!(!handler.is_moving().await.unwrap());
    }
}
