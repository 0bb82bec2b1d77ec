//! Custom error types for the application.
//!
//! Errors are layered the same way the devices are:
//!
//! - **`SerialError`**: transport failures on one serial channel (open, write
//!   timeout, partial write, receive overflow, I/O). These are generally fatal
//!   to the device session until it is reopened.
//! - **`ProtocolError`**: a device did not answer the way its command/confirm
//!   protocol requires (missing or mismatched reply after bounded retries,
//!   unparsable reply, latch misuse, ramp errors).
//! - **`MotionError`**: sample handler moves that could not be completed
//!   (unknown position, watchdog expiry, operator cancel).
//! - **`DaqError`**: the crate-wide error that workflows return. Operator cancel
//!   travels as `DaqError::Cancelled` internally and is turned into a regular
//!   outcome at the cycle and workflow surfaces.
//!
//! Threshold violations (S/N, S/Drift) are not errors and never appear here.

use crate::measurement::Axis;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Transport failures on a single serial channel.
#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Failed to open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("Write to {port} timed out after {written} of {expected} bytes")]
    WriteTimeout {
        port: String,
        written: usize,
        expected: usize,
    },

    #[error("Partial write to {port}: {written} of {expected} bytes")]
    PartialWrite {
        port: String,
        written: usize,
        expected: usize,
    },

    #[error("Receive buffer overflow on {port} ({capacity} bytes); buffered data discarded")]
    Overflow { port: String, capacity: usize },

    #[error("I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serial port {port} is closed")]
    Closed { port: String },
}

/// Device protocol failures.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error("{device} did not confirm {register}: expected '{expected}', got '{actual}'")]
    Confirmation {
        device: &'static str,
        register: String,
        expected: String,
        actual: String,
    },

    #[error("{device} sent no reply to '{command}'")]
    NoReply {
        device: &'static str,
        command: String,
    },

    #[error("{device} reply '{reply}' could not be parsed as {expected}")]
    Parse {
        device: &'static str,
        reply: String,
        expected: &'static str,
    },

    #[error("Magnetometer {axis} {what} read without a preceding latch")]
    NotLatched { axis: Axis, what: &'static str },

    #[error("Handler motion command issued before a move was configured")]
    NotArmed,

    #[error("Invalid {device} command: {reason}")]
    InvalidCommand {
        device: &'static str,
        reason: String,
    },

    #[error("AF demagnetizer reported {0}")]
    RampFault(String),

    #[error("AF ramp cycle not acknowledged within {0:?}")]
    RampTimeout(std::time::Duration),
}

/// Sample handler motion failures.
#[derive(Error, Debug)]
pub enum MotionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Handler position is unknown; a home seek is required")]
    PositionUnknown,

    #[error("Handler motion did not complete within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Handler motion cancelled by operator")]
    Cancelled,
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Motion(MotionError),

    #[error("Specimen store error: {0}")]
    Store(String),

    #[error("Sample too strong to measure on {0} axis (already flux counting)")]
    TooStrong(Axis),

    #[error("Operation declined by operator: {0}")]
    Declined(String),

    #[error("Measurement cancelled by operator")]
    Cancelled,
}

impl From<MotionError> for DaqError {
    fn from(value: MotionError) -> Self {
        match value {
            MotionError::Cancelled => DaqError::Cancelled,
            other => DaqError::Motion(other),
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(value: serde_json::Error) -> Self {
        DaqError::Store(value.to_string())
    }
}

impl DaqError {
    /// Whether this error is the operator-cancel signal rather than a failure.
    pub fn is_cancel(&self) -> bool {
        matches!(self, DaqError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_cancel_becomes_cancel() {
        let err: DaqError = MotionError::Cancelled.into();
        assert!(err.is_cancel());
    }

    #[test]
    fn motion_timeout_stays_motion() {
        let err: DaqError = MotionError::Timeout(std::time::Duration::from_secs(60)).into();
        assert!(matches!(err, DaqError::Motion(MotionError::Timeout(_))));
        assert!(!err.is_cancel());
    }

    #[test]
    fn confirmation_message_names_expected_and_actual() {
        let err = ProtocolError::Confirmation {
            device: "Magnetometer",
            register: "X range".into(),
            expected: "XCR1".into(),
            actual: "XCRT".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("X range"));
        assert!(msg.contains("XCR1"));
        assert!(msg.contains("XCRT"));
    }
}
