//! The platform seam: everything the driver needs from the hardware below.

#[cfg(feature = "hal")]
pub mod hal;

use core::fmt::{self, Display};

/// Driver-internal failure kinds. The filesystem layer only ever sees the
/// collapsed [`DiskError`](crate::disk::DiskError) codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdSpiError {
    /// SPI transfer failed.
    Transport,
    /// Chip-select or card-detect pin access failed.
    GpioError,
    /// The host cannot perform the requested transfer width.
    UnsupportedOperation,
    /// No card, or the card has not been initialized.
    NotReady,
    /// The medium is write protected.
    WriteProtected,
    /// The card never reported ready within the wait budget.
    BusyTimeout,
    /// No R1 arrived within the response window.
    CommandTimeout,
    /// R1 carried an error bit.
    CommandError(u8),
    /// Command or data CRC mismatch.
    CrcError,
    /// The start-block token was invalid or never arrived.
    DataTokenError,
    /// The card rejected written data.
    WriteResponseError,
    /// The CSD register could not be read.
    CsdReadFailed,
    /// The initialization handshake failed.
    InitFailed,
    /// Caller passed an unusable argument.
    InvalidValue,
}

impl Display for SdSpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdSpiError::Transport => write!(f, "SPI transfer failed"),
            SdSpiError::GpioError => write!(f, "GPIO access failed"),
            SdSpiError::UnsupportedOperation => write!(f, "unsupported transfer width"),
            SdSpiError::NotReady => write!(f, "medium not ready"),
            SdSpiError::WriteProtected => write!(f, "medium is write protected"),
            SdSpiError::BusyTimeout => write!(f, "card busy timeout"),
            SdSpiError::CommandTimeout => write!(f, "no command response"),
            SdSpiError::CommandError(r1) => write!(f, "command error (R1 {:#04x})", r1),
            SdSpiError::CrcError => write!(f, "CRC mismatch"),
            SdSpiError::DataTokenError => write!(f, "bad data token"),
            SdSpiError::WriteResponseError => write!(f, "write rejected by card"),
            SdSpiError::CsdReadFailed => write!(f, "CSD read failed"),
            SdSpiError::InitFailed => write!(f, "card initialization failed"),
            SdSpiError::InvalidValue => write!(f, "invalid argument"),
        }
    }
}

pub type SdSpiResult<T = ()> = Result<T, SdSpiError>;

/// Polarity of the card-detect switch.
///
/// Normally-open sockets pull the line high when a card is present;
/// normally-closed sockets pull it low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectMode {
    #[default]
    NormallyOpen,
    NormallyClosed,
}

/// Host operations the driver is generic over: a mode-0 SPI transceiver, a
/// chip-select output, a card-detect input, and a millisecond timebase.
///
/// The driver owns the bus for the lifetime of the instance; no arbitration
/// with other peripherals is performed here.
pub trait SdSpiOps {
    /// Transmit one byte, return the byte clocked in.
    fn spi_transfer(&mut self, byte: u8) -> SdSpiResult<u8>;

    /// Transmit one 16-bit word MSB first, return the word clocked in.
    ///
    /// Only used for data payloads when large-frames mode is enabled;
    /// command framing always runs byte-wide.
    fn spi_transfer_wide(&mut self, _word: u16) -> SdSpiResult<u16> {
        Err(SdSpiError::UnsupportedOperation)
    }

    /// Reprogram the SPI clock. Called with ≤400 kHz for the handshake and
    /// again with the full rate once the card is classified.
    fn spi_set_clock(&mut self, hz: u32) -> SdSpiResult<()>;

    /// Drive chip-select low (asserted).
    fn cs_assert(&mut self) -> SdSpiResult<()>;

    /// Drive chip-select high (deasserted).
    fn cs_deassert(&mut self) -> SdSpiResult<()>;

    /// Raw level of the card-detect line.
    fn cd_level(&mut self) -> bool;

    /// Busy-wait for the given number of milliseconds.
    fn delay_ms(&mut self, ms: u32);
}
