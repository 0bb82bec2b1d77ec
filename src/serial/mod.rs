//! Serial transport abstractions.
//!
//! Every device protocol talks to its instrument through the [`Transport`]
//! trait: a blocking-until-complete `write` and a non-blocking `read` that
//! drains whatever has been buffered so far. Callers poll `read` in their own
//! retry loops; nothing here waits for a reply.
//!
//! # Types
//!
//! - [`Transport`]: the seam the protocol adapters depend on
//! - [`DynTransport`]: type-erased boxed transport
//! - [`SerialChannel`]: real implementation over any async byte stream, with a
//!   background reader task feeding a fixed-capacity ring buffer
//! - [`MockTransport`]: scripted per-poll replies for protocol tests
//!
//! # Example
//!
//! ```rust,ignore
//! use rockmag_daq::serial::{open_channel, Transport};
//!
//! let mut channel = open_channel("/dev/ttyUSB0", 1200, "Magnetometer").await?;
//! channel.write(b"XSC\r").await?;
//! let reply = channel.read(64)?;
//! ```

mod channel;
mod mock;

pub use channel::{SerialChannel, SerialPortIO, RX_BUFFER_CAPACITY};
pub use mock::{MockTransport, MockTransportLog};

use crate::error::SerialError;
use async_trait::async_trait;

/// Byte transport to one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Port identifier used in diagnostics.
    fn name(&self) -> &str;

    /// Write all of `bytes`, returning the number written.
    ///
    /// A write that completes only partially is reported as
    /// [`SerialError::PartialWrite`], distinct from hard I/O errors.
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError>;

    /// Copy at most `max_len` buffered bytes without blocking.
    ///
    /// Returns an empty vector when nothing has arrived yet. Errors recorded
    /// by the background reader since the last call are surfaced here.
    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError>;

    /// Close the transport. Further operations fail with [`SerialError::Closed`].
    async fn close(&mut self) -> Result<(), SerialError> {
        Ok(())
    }
}

/// Type-erased boxed transport.
pub type DynTransport = Box<dyn Transport>;

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError> {
        (**self).write(bytes).await
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError> {
        (**self).read(max_len)
    }

    async fn close(&mut self) -> Result<(), SerialError> {
        (**self).close().await
    }
}

/// Open a serial port and wrap it in a [`SerialChannel`].
///
/// Standard settings are applied: 8N1, no flow control. Opening runs on the
/// blocking pool so the runtime is not stalled during port initialisation.
///
/// # Errors
///
/// Returns [`SerialError::Open`] naming the port when it cannot be opened.
#[cfg(feature = "instrument_serial")]
pub async fn open_channel(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> Result<SerialChannel, SerialError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let stream = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| SerialError::Open {
        port: port_path.to_string(),
        reason: format!("open task failed: {e}"),
    })?
    .map_err(|e| SerialError::Open {
        port: port_path.to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(port = port_path, baud_rate, device = device_name, "Opened serial port");
    Ok(SerialChannel::from_stream(port_path, Box::new(stream)))
}

/// Open a serial port (serial support disabled at build time).
#[cfg(not(feature = "instrument_serial"))]
pub async fn open_channel(
    port_path: &str,
    _baud_rate: u32,
    _device_name: &str,
) -> Result<SerialChannel, SerialError> {
    Err(SerialError::Open {
        port: port_path.to_string(),
        reason: "serial support not enabled. Rebuild with --features instrument_serial".into(),
    })
}

/// Names of the serial ports present on this machine.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> Result<Vec<String>, SerialError> {
    tokio_serial::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| SerialError::Open {
            port: "*".into(),
            reason: e.to_string(),
        })
}

/// Names of the serial ports present on this machine (serial support disabled).
#[cfg(not(feature = "instrument_serial"))]
pub fn available_ports() -> Result<Vec<String>, SerialError> {
    Ok(Vec::new())
}
