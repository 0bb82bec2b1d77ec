//! Device protocol adapters.
//!
//! Each adapter owns a [`CommandPort`] over its device's transport and encodes
//! that device's ASCII command set. Configuration commands follow the same
//! confirm pattern: send, wait a device-specific settle delay, then poll the
//! reply up to three times for an expected substring.

pub mod demagnetizer;
pub mod handler;
pub mod magnetometer;
mod port;

pub use demagnetizer::DemagnetizerProtocol;
pub use handler::{Direction, HandlerCommand, HandlerProtocol, MotionAxis, MoveParams, Register};
pub use magnetometer::{AxisConfig, Filter, MagnetometerProtocol, Range, Target};
pub use port::{CommandPort, PortTiming};
