//! Byte-stream transport contract consumed by serial back-ends.
//!
//! Concrete drivers (USB CDC, tty, "net:host:port" TCP peers) live
//! outside this crate; protocol back-ends only see this trait.

use std::time::Duration;

use crate::error::{Error, Result};

/// Word length, number of data bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataBits {
    DataBits5,
    DataBits6,
    DataBits7,
    DataBits8,
}

/// Parity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Parity {
    ParityNone,
    ParityEven,
    ParityOdd,
}

/// Number of stop bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopBits {
    STOP1,
    STOP2,
}

/// Serial line parameters, applied through [`Transport::set_params`].
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SerialParams {
    pub baudrate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Local mode: ignore modem control lines.
    pub local_mode: bool,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baudrate: 115200,
            data_bits: DataBits::DataBits8,
            stop_bits: StopBits::STOP1,
            parity: Parity::ParityNone,
            local_mode: true,
        }
    }
}

/// Default receive timeout on a freshly opened serial transport.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(5000);

/// An exclusive, already-opened byte stream to the programmer hardware.
///
/// `send` transmits the whole buffer or fails. `recv` fills the whole
/// buffer or fails with a timeout once the receive deadline passes; a
/// zero-length read is a transport error, not end-of-stream.
pub trait Transport {
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    fn recv(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Discard pending input. Used between sync attempts and after
    /// framing errors; implementations should poll for at least the
    /// given window (drivers use 80–250 ms).
    fn drain(&mut self, window: Duration) -> Result<()>;

    /// Adjust the receive deadline for subsequent [`Transport::recv`]
    /// calls. Sync phases narrow this to <= 100 ms; chip erase widens it.
    fn set_recv_timeout(&mut self, timeout: Duration);

    fn set_params(&mut self, params: &SerialParams) -> Result<()> {
        let _ = params;
        Ok(())
    }

    /// Assert or release DTR/RTS together; serial bootloaders use the
    /// edge as a reset pulse. Not all transports have the lines.
    fn set_dtr_rts(&mut self, on: bool) -> Result<()> {
        let _ = on;
        Err(Error::Unsupported)
    }
}

impl Transport for Box<dyn Transport> {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        (**self).send(buf)
    }
    fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).recv(buf)
    }
    fn drain(&mut self, window: Duration) -> Result<()> {
        (**self).drain(window)
    }
    fn set_recv_timeout(&mut self, timeout: Duration) {
        (**self).set_recv_timeout(timeout)
    }
    fn set_params(&mut self, params: &SerialParams) -> Result<()> {
        (**self).set_params(params)
    }
    fn set_dtr_rts(&mut self, on: bool) -> Result<()> {
        (**self).set_dtr_rts(on)
    }
}
