//! Transport capability boundary.
//!
//! The core depends on one narrow contract: open, close, write, and a
//! bounded-duration capture window. Any transport satisfying it (USB-serial
//! driver, BLE bridge, in-memory simulator) is interchangeable, selected once
//! at startup. A single mutable handle is shared between the acquisition loop
//! and the async command worker through [`SharedTransport`].

use crate::error::TransportError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub mod mock;
#[cfg(feature = "transport_serial")]
pub mod serial;

/// Identity reported by a device on open.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceIdentity {
    /// Model, when the transport can report one.
    pub model: Option<String>,
    /// Serial number, when the transport can report one.
    pub serial: Option<String>,
    /// Human-readable description (port path, simulator tag, ...).
    pub description: String,
}

/// Sink receiving raw byte chunks during a capture window.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&[u8]) + Send);

/// Byte transport to the instrument.
///
/// Implementations use interior state freely; exclusive access is enforced by
/// the shared mutex, never by the implementation itself.
#[async_trait]
pub trait Transport: Send {
    /// Open the device and report its identity.
    async fn open(&mut self) -> Result<DeviceIdentity, TransportError>;

    /// Close the device. Closing an already-closed transport is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Write the payloads in order; returns total bytes written.
    async fn write(&mut self, payloads: &[Vec<u8>]) -> Result<usize, TransportError>;

    /// Read for `duration`, pushing every byte chunk into `sink`; returns
    /// total bytes read. May yield zero or more chunks.
    async fn run_window(
        &mut self,
        duration: Duration,
        sink: ChunkSink<'_>,
    ) -> Result<usize, TransportError>;
}

/// The one transport handle shared between the loop and the worker.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for shared use.
pub fn shared(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}
