//! # Stage: Modbus TCP Transport
//!
//! ## Responsibility
//! Owns the single TCP connection to one device. Issues Read Holding
//! Registers transactions, enforces the per-call read timeout, and
//! reconnects with exponential backoff after a lost connection.
//!
//! ## Guarantees
//! - One transaction in flight at a time (the owning loop serializes calls)
//! - Every call completes within `read_timeout` or fails with `Timeout`
//! - A desynced stream is never reused: timeout, I/O error and malformed
//!   frames all close the socket so the next call starts clean
//! - Reconnect attempts back off from 100 ms, doubling, capped at the
//!   device's poll interval
//!
//! ## NOT Responsible For
//! - Word decoding (modbus::decode)
//! - Retry policy and health accounting (the device loop)

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::TransportError;
use crate::modbus::frame::{
    encode_read_holding, parse_mbap, parse_read_holding_response, FrameError, MBAP_LEN,
};
use crate::modbus::ModbusTransport;

/// First reconnect delay after a lost connection.
const RECONNECT_BASE_MS: u64 = 100;

pub struct TcpTransport {
    addr: String,
    unit_id: u8,
    read_timeout: Duration,
    keep_alive: bool,
    /// Upper bound for the reconnect backoff (the device poll interval).
    reconnect_cap: Duration,
    stream: Option<TcpStream>,
    transaction_id: u16,
    connect_failures: u32,
    next_connect_at: Option<Instant>,
}

impl TcpTransport {
    pub fn new(device: &DeviceConfig, poll_interval: Duration) -> Self {
        TcpTransport {
            addr: device.addr(),
            unit_id: device.unit_id,
            read_timeout: device.read_timeout(),
            keep_alive: device.keep_alive,
            reconnect_cap: poll_interval,
            stream: None,
            transaction_id: 0,
            connect_failures: 0,
            next_connect_at: None,
        }
    }

    /// Direct constructor for tests and tools.
    pub fn connect_to(
        addr: impl Into<String>,
        unit_id: u8,
        read_timeout: Duration,
        reconnect_cap: Duration,
    ) -> Self {
        TcpTransport {
            addr: addr.into(),
            unit_id,
            read_timeout,
            keep_alive: true,
            reconnect_cap,
            stream: None,
            transaction_id: 0,
            connect_failures: 0,
            next_connect_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn drop_connection(&mut self) {
        self.stream = None;
    }

    fn backoff_delay(&self) -> Duration {
        let exp = self.connect_failures.min(16);
        let delay = Duration::from_millis(RECONNECT_BASE_MS.saturating_mul(1u64 << exp));
        delay.min(self.reconnect_cap)
    }

    async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            return Ok(());
        }
        if let Some(gate) = self.next_connect_at {
            if Instant::now() < gate {
                return Err(TransportError::ConnectionLost(format!(
                    "reconnect to {} backed off for {:?}",
                    self.addr,
                    gate - Instant::now()
                )));
            }
        }
        match timeout(self.read_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!(addr = %self.addr, "modbus connection established");
                self.stream = Some(stream);
                self.connect_failures = 0;
                self.next_connect_at = None;
                Ok(())
            }
            Ok(Err(e)) => {
                self.note_connect_failure();
                Err(TransportError::ConnectionLost(format!(
                    "connect to {} failed: {}",
                    self.addr, e
                )))
            }
            Err(_) => {
                self.note_connect_failure();
                Err(TransportError::Timeout(self.read_timeout))
            }
        }
    }

    fn note_connect_failure(&mut self) {
        let delay = self.backoff_delay();
        self.connect_failures = self.connect_failures.saturating_add(1);
        self.next_connect_at = Some(Instant::now() + delay);
    }

    async fn exchange(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let txn = self.transaction_id;
        let request = encode_read_holding(txn, self.unit_id, start, count);

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::ConnectionLost("not connected".to_string()))?;

        stream
            .write_all(&request)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("write failed: {e}")))?;

        let mut header = [0u8; MBAP_LEN];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("read failed: {e}")))?;
        let mbap = parse_mbap(&header)
            .map_err(|e| TransportError::ConnectionLost(format!("bad mbap header: {e:?}")))?;

        if mbap.transaction_id != txn {
            return Err(TransportError::ConnectionLost(format!(
                "transaction id mismatch: sent {txn}, got {}",
                mbap.transaction_id
            )));
        }
        if mbap.unit_id != self.unit_id {
            return Err(TransportError::ConnectionLost(format!(
                "unit id mismatch: expected {}, got {}",
                self.unit_id, mbap.unit_id
            )));
        }

        let mut pdu = vec![0u8; usize::from(mbap.length) - 1];
        stream
            .read_exact(&mut pdu)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("read failed: {e}")))?;

        match parse_read_holding_response(&pdu, count) {
            Ok(words) => Ok(words),
            Err(FrameError::Exception(code)) => Err(TransportError::RemoteException(code)),
            Err(FrameError::Malformed(detail)) => {
                Err(TransportError::ConnectionLost(format!("malformed response: {detail}")))
            }
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read_holding(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        self.ensure_connected().await?;

        let result = match timeout(self.read_timeout, self.exchange(start, count)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout(self.read_timeout)),
        };

        match &result {
            // A rejected request leaves the stream in sync; everything else
            // poisons it.
            Ok(_) | Err(TransportError::RemoteException(_)) => {
                if !self.keep_alive {
                    self.drop_connection();
                }
            }
            Err(_) => self.drop_connection(),
        }
        result
    }
}
