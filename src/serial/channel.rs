//! Ring-buffered serial channel with a background reader task.

use super::Transport;
use crate::error::SerialError;
use async_trait::async_trait;
use parking_lot::Mutex;
use ringbuf::{HeapRb, Rb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can back a
/// channel: `tokio_serial::SerialStream` for hardware, `tokio::io::DuplexStream`
/// in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

type DynSerial = Box<dyn SerialPortIO>;

/// Receive buffer size. Larger than any single device reply.
pub const RX_BUFFER_CAPACITY: usize = 4096;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 256;

/// Condition recorded by the reader task, surfaced on the next caller operation.
#[derive(Debug)]
enum ReaderFault {
    Overflow,
    Io(std::io::Error),
    Eof,
}

struct RxState {
    ring: HeapRb<u8>,
    fault: Option<ReaderFault>,
}

impl RxState {
    fn new() -> Self {
        Self {
            ring: HeapRb::new(RX_BUFFER_CAPACITY),
            fault: None,
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.ring.push(byte).is_err() {
                self.ring.clear();
                self.fault = Some(ReaderFault::Overflow);
                let _ = self.ring.push(byte);
            }
        }
    }
}

/// Serial transport over any [`SerialPortIO`] stream.
///
/// Writes go straight to the stream under a timeout. A spawned reader task
/// drains the stream into a mutex-protected ring buffer; [`Transport::read`]
/// only ever copies out of that buffer and never blocks.
pub struct SerialChannel {
    name: String,
    writer: WriteHalf<DynSerial>,
    rx: Arc<Mutex<RxState>>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    write_timeout: Duration,
}

impl SerialChannel {
    /// Wrap an already-open stream and start its reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream(name: &str, stream: Box<dyn SerialPortIO>) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let rx = Arc::new(Mutex::new(RxState::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(reader_loop(
            name.to_string(),
            read_half,
            Arc::clone(&rx),
            Arc::clone(&connected),
        ));

        Self {
            name: name.to_string(),
            writer,
            rx,
            connected,
            reader: Some(reader),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Override the write timeout (default 1 s).
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Whether the channel is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.rx.lock().ring.len()
    }

    fn ensure_open(&self) -> Result<(), SerialError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SerialError::Closed {
                port: self.name.clone(),
            })
        }
    }

    fn take_fault(&self) -> Result<(), SerialError> {
        let fault = self.rx.lock().fault.take();
        match fault {
            None => Ok(()),
            Some(ReaderFault::Overflow) => Err(SerialError::Overflow {
                port: self.name.clone(),
                capacity: RX_BUFFER_CAPACITY,
            }),
            Some(ReaderFault::Io(source)) => Err(SerialError::Io {
                port: self.name.clone(),
                source,
            }),
            Some(ReaderFault::Eof) => Err(SerialError::Closed {
                port: self.name.clone(),
            }),
        }
    }

    fn stop_reader(&mut self) {
        self.connected.store(false, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

async fn reader_loop(
    name: String,
    mut stream: ReadHalf<DynSerial>,
    rx: Arc<Mutex<RxState>>,
    connected: Arc<AtomicBool>,
) {
    let mut chunk = [0u8; READ_CHUNK];
    while connected.load(Ordering::Acquire) {
        match stream.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(port = %name, "Serial stream reached end of file");
                rx.lock().fault = Some(ReaderFault::Eof);
                break;
            }
            Ok(n) => rx.lock().append(&chunk[..n]),
            Err(e) => {
                tracing::warn!(port = %name, error = %e, "Serial read failed");
                rx.lock().fault = Some(ReaderFault::Io(e));
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for SerialChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError> {
        self.ensure_open()?;
        self.take_fault()?;

        let expected = bytes.len();
        let mut written = 0;
        let deadline = tokio::time::Instant::now() + self.write_timeout;

        while written < expected {
            let remaining = &bytes[written..];
            match tokio::time::timeout_at(deadline, self.writer.write(remaining)).await {
                Err(_) => {
                    return Err(SerialError::WriteTimeout {
                        port: self.name.clone(),
                        written,
                        expected,
                    })
                }
                Ok(Ok(0)) => {
                    return Err(SerialError::PartialWrite {
                        port: self.name.clone(),
                        written,
                        expected,
                    })
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(source)) => {
                    return Err(SerialError::Io {
                        port: self.name.clone(),
                        source,
                    })
                }
            }
        }

        self.writer.flush().await.map_err(|source| SerialError::Io {
            port: self.name.clone(),
            source,
        })?;
        Ok(written)
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, SerialError> {
        self.take_fault()?;
        let mut state = self.rx.lock();
        let mut out = Vec::with_capacity(max_len.min(state.ring.len()));
        while out.len() < max_len {
            match state.ring.pop() {
                Some(byte) => out.push(byte),
                None => break,
            }
        }
        drop(state);

        if out.is_empty() {
            // Only report a closed channel once the buffer is fully drained.
            self.ensure_open()?;
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<(), SerialError> {
        if !self.is_connected() && self.reader.is_none() {
            return Ok(());
        }
        self.stop_reader();
        tracing::debug!(port = %self.name, "Closing serial channel");
        self.writer
            .shutdown()
            .await
            .map_err(|source| SerialError::Io {
                port: self.name.clone(),
                source,
            })
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn read_until(channel: &mut SerialChannel, want: usize) -> Vec<u8> {
        let mut got = Vec::new();
        for _ in 0..100 {
            got.extend(channel.read(64).unwrap());
            if got.len() >= want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        got
    }

    #[tokio::test]
    async fn write_reaches_device_and_replies_are_buffered() {
        let (host, mut device) = duplex(8192);
        let mut channel = SerialChannel::from_stream("COM-test", Box::new(host));

        let n = channel.write(b"XSC\r").await.unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"XSC\r");

        device.write_all(b"+12\r\n").await.unwrap();
        let reply = read_until(&mut channel, 5).await;
        assert_eq!(reply, b"+12\r\n");
    }

    #[tokio::test]
    async fn read_never_blocks_and_respects_max_len() {
        let (host, mut device) = duplex(8192);
        let mut channel = SerialChannel::from_stream("COM-test", Box::new(host));

        assert!(channel.read(16).unwrap().is_empty());

        device.write_all(b"0123456789").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.read(4).unwrap(), b"0123");
        assert_eq!(channel.read(100).unwrap(), b"456789");
    }

    #[tokio::test]
    async fn overflow_resets_buffer_and_is_reported_once() {
        let (host, mut device) = duplex(16384);
        let mut channel = SerialChannel::from_stream("COM-test", Box::new(host));

        let flood = vec![b'x'; RX_BUFFER_CAPACITY + 100];
        device.write_all(&flood).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = channel.read(16).unwrap_err();
        assert!(matches!(err, SerialError::Overflow { .. }));
        assert!(err.to_string().contains("COM-test"));

        // Only the bytes received after the reset remain.
        let rest = read_until(&mut channel, 100).await;
        assert_eq!(rest.len(), 100);
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let (host, _device) = duplex(64);
        let mut channel = SerialChannel::from_stream("COM-test", Box::new(host));
        channel.close().await.unwrap();

        assert!(!channel.is_connected());
        assert!(matches!(
            channel.write(b"A").await,
            Err(SerialError::Closed { .. })
        ));
        assert!(matches!(channel.read(1), Err(SerialError::Closed { .. })));
    }

    #[tokio::test]
    async fn device_hangup_surfaces_on_next_operation() {
        let (host, device) = duplex(64);
        let mut channel = SerialChannel::from_stream("COM-test", Box::new(host));
        drop(device);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(channel.read(1), Err(SerialError::Closed { .. })));
    }
}
