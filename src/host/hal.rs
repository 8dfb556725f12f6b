//! [`SdSpiOps`] adapter over `embedded-hal` 1.x peripherals.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

use super::{SdSpiError, SdSpiOps, SdSpiResult};

/// Bundles an SPI bus, chip-select output, card-detect input, and delay
/// provider into the host interface the driver consumes.
///
/// `SpiBus` has no clock control, so reprogramming the bus rate between the
/// 400 kHz handshake and full speed goes through an optional platform hook;
/// without one the bus keeps whatever rate it was created with, which must
/// then be low enough for initialization. Wide transfers are emitted as two
/// byte transfers, MSB first, which is bit-identical on the wire; hosts
/// with a native 16-bit FIFO can implement [`SdSpiOps`] directly instead.
pub struct HalSpiHost<SPI, CS, CD, D> {
    spi: SPI,
    cs: CS,
    cd: CD,
    delay: D,
    reclock: Option<fn(&mut SPI, u32)>,
}

impl<SPI, CS, CD, D> HalSpiHost<SPI, CS, CD, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CD: InputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, cs: CS, cd: CD, delay: D) -> Self {
        HalSpiHost {
            spi,
            cs,
            cd,
            delay,
            reclock: None,
        }
    }

    /// Like [`HalSpiHost::new`], with a hook the driver calls to reprogram
    /// the SPI clock rate.
    pub fn with_reclock(spi: SPI, cs: CS, cd: CD, delay: D, reclock: fn(&mut SPI, u32)) -> Self {
        HalSpiHost {
            spi,
            cs,
            cd,
            delay,
            reclock: Some(reclock),
        }
    }

    /// Tear down the adapter and hand the peripherals back.
    pub fn release(self) -> (SPI, CS, CD, D) {
        (self.spi, self.cs, self.cd, self.delay)
    }
}

impl<SPI, CS, CD, D> SdSpiOps for HalSpiHost<SPI, CS, CD, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    CD: InputPin,
    D: DelayNs,
{
    fn spi_transfer(&mut self, byte: u8) -> SdSpiResult<u8> {
        let mut frame = [byte];
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(|_| SdSpiError::Transport)?;
        self.spi.flush().map_err(|_| SdSpiError::Transport)?;
        Ok(frame[0])
    }

    fn spi_transfer_wide(&mut self, word: u16) -> SdSpiResult<u16> {
        let mut frame = word.to_be_bytes();
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(|_| SdSpiError::Transport)?;
        self.spi.flush().map_err(|_| SdSpiError::Transport)?;
        Ok(u16::from_be_bytes(frame))
    }

    fn spi_set_clock(&mut self, hz: u32) -> SdSpiResult<()> {
        if let Some(reclock) = self.reclock {
            reclock(&mut self.spi, hz);
        }
        Ok(())
    }

    fn cs_assert(&mut self) -> SdSpiResult<()> {
        self.cs.set_low().map_err(|_| SdSpiError::GpioError)
    }

    fn cs_deassert(&mut self) -> SdSpiResult<()> {
        self.cs.set_high().map_err(|_| SdSpiError::GpioError)
    }

    fn cd_level(&mut self) -> bool {
        // A failed pin read degrades to "line low": no card on
        // normally-open sockets rather than a phantom card.
        self.cd.is_high().unwrap_or(false)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }
}
