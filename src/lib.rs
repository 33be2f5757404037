#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for talking to vehicles through consumer OBD2 diagnostic adapters
//! (typically ELM327-based dongles), covering the full path from device
//! discovery to decoded sensor values and trouble codes.
//!
//! ## What this crate provides
//!
//! ### Device discovery ([scanner])
//! Turns a transport's raw advertisement feed into a deduplicated registry of
//! classified automotive devices (ELM327, OBD2, VLink clones), with one-shot
//! and continuous scan modes.
//!
//! ### Connection management ([connection])
//! Multiplexes any number of logical adapter connections over heterogeneous
//! transports, serializing connect/disconnect against a shared registry and
//! providing a timeout-bounded request/response primitive.
//!
//! ### OBD2 protocol engine ([obd2])
//! Runs the ELM327 bring-up sequence, formats and sends OBD2 commands, parses
//! and validates responses, evaluates per-PID conversion formulas, discovers
//! vehicle-supported PIDs, and decodes/clears diagnostic trouble codes (DTCs).
//!
//! ## What this crate does not provide
//!
//! Physical transports. The core consumes the capability traits in
//! [transport] ("send bytes, receive bytes, report connected state"); BLE,
//! serial or USB stacks are collaborators that implement those traits. A
//! scripted in-memory implementation lives in [simulation] for testing.

use std::sync::Arc;

use crate::obd2::ProtocolError;
use crate::transport::TransportError;

pub mod connection;
pub mod obd2;
pub mod scanner;
pub mod simulation;
pub mod transport;

/// Result produced by the connection and protocol layers
pub type ObdResult<T> = Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
/// Top level error for connection and protocol operations
pub enum Error {
    /// Establishing or using a connection failed at the transport level
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    /// A connection ID was used that is not present in the registry
    #[error("no active connection: {0}")]
    NoActiveConnection(String),
    /// A bounded wait expired before the adapter responded
    #[error("timed out waiting for response on {0}")]
    Timeout(String),
    /// Transport I/O succeeded but the OBD2 response violates the protocol contract
    #[error("protocol violation")]
    Protocol(
        #[from]
        #[source]
        ProtocolError,
    ),
    /// The requested connection kind or protocol mode is not implemented
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// Error from the underlying transport
    #[error("transport error")]
    Transport(
        #[from]
        #[source]
        Arc<TransportError>,
    ),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport(Arc::new(err))
    }
}
