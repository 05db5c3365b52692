//! Crate-level error taxonomy.
//!
//! Every component boundary returns an explicit `Result`; the device loop
//! classifies transport errors into reading quality before updating health.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the Modbus transport layer.
///
/// The contract of [`crate::modbus::ModbusTransport::read_holding`] is that a
/// call either returns the requested words within the read timeout or fails
/// with exactly one of these variants.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The read did not complete within the per-call timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The TCP connection dropped, desynced, or could not be (re)established.
    /// The transport closes the socket and reconnects on the next call.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The device answered with a Modbus exception PDU. The connection stays
    /// open; the device itself rejected the request.
    #[error("modbus exception code {0:#04x}")]
    RemoteException(u8),
}

impl TransportError {
    /// Stable label used as the `reason` metric dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            TransportError::Timeout(_)         => "timeout",
            TransportError::ConnectionLost(_)  => "connection_lost",
            TransportError::RemoteException(_) => "remote_exception",
        }
    }
}

/// Errors surfaced by a [`crate::sink::TimeSeriesSink`] implementation.
///
/// The batch writer retries `Transient` failures with backoff and discards
/// the batch on `Permanent` ones.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// Network trouble or a 5xx-class response; the same batch may succeed
    /// if submitted again.
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// The store rejected the payload (4xx-class); retrying the identical
    /// batch cannot succeed.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Top-level error type for collector construction and the binary.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
