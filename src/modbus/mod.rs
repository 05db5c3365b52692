//! Modbus TCP acquisition layer.
//!
//! One TCP connection per device, Read Holding Registers (0x03) only. The
//! transport contract is a fixed set of operations behind
//! [`ModbusTransport`]; the TCP implementation and a deterministic simulator
//! both satisfy it.

pub mod decode;
pub mod frame;
pub mod sim;
pub mod transport;

use async_trait::async_trait;

use crate::error::TransportError;

/// Capability contract for register acquisition.
///
/// Each call either returns exactly `count` words within the transport's
/// configured read timeout or fails with one of the [`TransportError`]
/// variants. Implementations are owned by a single device loop and never
/// shared across devices.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn read_holding(&mut self, start: u16, count: u16) -> Result<Vec<u16>, TransportError>;
}

pub use sim::SimTransport;
pub use transport::TcpTransport;
