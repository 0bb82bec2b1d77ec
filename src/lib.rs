//! # Rock Magnetometer DAQ Core Library
//!
//! Headless control of a superconducting rock magnetometer, an AF
//! demagnetizer and an automated sample handler, plus the reduction of raw
//! readings to paleomagnetic directions.
//!
//! ## Crate Structure
//!
//! - **`serial`**: the `Transport` seam and `SerialChannel`, a serial port with a
//!   background reader feeding a ring buffer.
//! - **`protocol`**: command/confirm plumbing and the three device adapters
//!   (magnetometer, demagnetizer, sample handler).
//! - **`motion`**: named handler positions, `MotionController` and the
//!   automatic/manual `SampleHandler`.
//! - **`measurement`**: value types, count/analog combination and the
//!   `MeasurementCycle` state machine.
//! - **`reduction`**: pure data reduction: holder and drift correction, per-axis
//!   statistics, moment, reference-frame directions and diagnostic ratios.
//! - **`specimen`**: per-specimen record files.
//! - **`operator`**: the boundary to whoever answers prompts, plus the cancel flag.
//! - **`station`**: the application context owning settings and devices.
//! - **`workflows`**: single-step, AF sequence, holder and standard workflows.
//! - **`sim`**: simulated devices for tests and dry runs.
//! - **`config`**, **`error`**, **`logging`**: settings, error types and tracing setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod measurement;
pub mod motion;
pub mod operator;
pub mod protocol;
pub mod reduction;
pub mod serial;
pub mod sim;
pub mod specimen;
pub mod station;
pub mod workflows;
