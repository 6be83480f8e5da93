//! Serial transport for CX-505 family meters.
//!
//! RS-232 at 8N1, no flow control; the meter streams frames continuously
//! while logging is enabled. Requires the `transport_serial` feature.

use crate::error::TransportError;
use crate::transport::{ChunkSink, DeviceIdentity, Transport};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Serial port transport.
pub struct SerialTransport {
    path: String,
    baud: u32,
    port: Option<SerialStream>,
}

impl SerialTransport {
    /// Transport for the given port path and baud rate; opened lazily.
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            port: None,
        }
    }

    fn port_mut(&mut self) -> Result<&mut SerialStream, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<DeviceIdentity, TransportError> {
        let port = tokio_serial::new(&self.path, self.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Open(format!("{}: {e}", self.path)))?;
        self.port = Some(port);
        Ok(DeviceIdentity {
            model: None,
            serial: None,
            description: self.path.clone(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.port = None;
        Ok(())
    }

    async fn write(&mut self, payloads: &[Vec<u8>]) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        let mut written = 0usize;
        for payload in payloads {
            port.write_all(payload)
                .await
                .map_err(|e| TransportError::Write(e.to_string()))?;
            written += payload.len();
        }
        port.flush()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?;
        Ok(written)
    }

    async fn run_window(
        &mut self,
        duration: Duration,
        sink: ChunkSink<'_>,
    ) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        let deadline = Instant::now() + duration;
        let mut buf = [0u8; 1024];
        let mut total = 0usize;
        loop {
            match timeout_at(deadline, port.read(&mut buf)).await {
                Err(_) => break, // window elapsed
                Ok(Ok(0)) => {
                    return Err(TransportError::Window("unexpected EOF".to_string()));
                }
                Ok(Ok(n)) => {
                    total += n;
                    sink(&buf[..n]);
                }
                Ok(Err(e)) => return Err(TransportError::Window(e.to_string())),
            }
        }
        Ok(total)
    }
}
