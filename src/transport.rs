//! Capability traits for the physical transports the core rides on.
//!
//! The connection and protocol layers never touch a radio or serial stack
//! directly. They consume three seams defined here:
//! * [TransportHandle] - an open link supporting request/response I/O
//! * [Connector] - opens a [TransportHandle] for a device address
//! * [DiscoveryBackend] - streams raw device advertisements to a sink
//!
//! Response delivery from a transport's asynchronous notification path to a
//! blocking protocol call is mediated by the bounded queue returned from
//! [notification_queue].

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError, sync_channel};
use std::time::Duration;

/// Transport operation result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone)]
/// Error produced by a transport implementation
pub enum TransportError {
    /// Underlying IO error with the transport
    Io(Arc<std::io::Error>),
    /// A bounded wait for a device response expired
    Timeout,
    /// The link is not open
    NotConnected,
    /// Transport specific failure description
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {e}"),
            TransportError::Timeout => write!(f, "timeout waiting for transport response"),
            TransportError::NotConnected => write!(f, "transport is not connected"),
            TransportError::Other(desc) => write!(f, "transport error: {desc}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::Io(io_err) = self {
            Some(io_err.as_ref())
        } else {
            None
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// An open link to a diagnostic adapter.
///
/// Implementations wrap one physical connection (a BLE GATT session, a serial
/// port, ...) and expose the single request/response primitive the
/// connection manager builds on.
pub trait TransportHandle: Send {
    /// Writes a request to the device, then blocks until a response frame
    /// arrives or `timeout` expires.
    fn send_receive(&mut self, data: &[u8], timeout: Duration) -> TransportResult<Vec<u8>>;

    /// Reports whether the link is still up
    fn is_connected(&self) -> bool;

    /// Closes the link. After this call [TransportHandle::is_connected]
    /// returns false.
    fn disconnect(&mut self) -> TransportResult<()>;
}

/// Opens [TransportHandle]s for one kind of transport
pub trait Connector: Send + Sync {
    /// Connects to the device at `address` and returns the open handle
    fn connect(&self, address: &str) -> TransportResult<Box<dyn TransportHandle>>;
}

/// One raw advertisement sighting from a discovery feed
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// Device address (unique per device within a scan)
    pub address: String,
    /// Advertised device name, if any
    pub name: Option<String>,
    /// Signal strength in dBm, if reported
    pub rssi: Option<i16>,
    /// Manufacturer specific data blocks keyed by company ID
    pub manufacturer_data: std::collections::HashMap<u16, Vec<u8>>,
    /// Advertised service identifiers
    pub service_ids: Vec<String>,
}

/// Streams device advertisements for the duration of a scan
pub trait DiscoveryBackend {
    /// Runs discovery for `timeout`, feeding every observed advertisement to
    /// `sink`. Returns once the scan window has elapsed.
    fn discover(
        &mut self,
        timeout: Duration,
        sink: &mut dyn FnMut(Advertisement),
    ) -> TransportResult<()>;
}

/// Creates the bounded queue that carries response frames from a transport's
/// notification path to a blocking [TransportHandle::send_receive] call.
///
/// The sending side never blocks: when the queue is full the frame is dropped
/// with a warning. This is a deliberate lossy policy so that a slow consumer
/// surfaces as dropped frames in the log instead of unbounded buffering.
pub fn notification_queue(capacity: usize) -> (NotificationSender, NotificationReceiver) {
    let (tx, rx) = sync_channel(capacity);
    (
        NotificationSender { tx },
        NotificationReceiver { rx },
    )
}

#[derive(Debug, Clone)]
/// Producer half of the per-connection response queue
pub struct NotificationSender {
    tx: SyncSender<Vec<u8>>,
}

impl NotificationSender {
    /// Enqueues a response frame without blocking. Full queue drops the frame.
    pub fn push(&self, frame: Vec<u8>) {
        match self.tx.try_send(frame) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                log::warn!("notification queue full, dropping response frame");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("notification queue consumer gone, dropping response frame");
            }
        }
    }
}

#[derive(Debug)]
/// Consumer half of the per-connection response queue
pub struct NotificationReceiver {
    rx: Receiver<Vec<u8>>,
}

impl NotificationReceiver {
    /// Blocks until a response frame is available or `timeout` expires
    pub fn wait(&self, timeout: Duration) -> TransportResult<Vec<u8>> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => TransportError::Timeout,
            RecvTimeoutError::Disconnected => TransportError::NotConnected,
        })
    }

    /// Discards any frames left over from a previous exchange
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}
