//! Command codec and chip-select transaction discipline.

use log::{trace, warn};

use crate::commands::{command_frame, is_app_command, trailer_len, SdResponse};
use crate::constants::*;
use crate::core::SdSpiHost;
use crate::host::{SdSpiError, SdSpiOps, SdSpiResult};

impl<T: SdSpiOps> SdSpiHost<T> {
    /// Clock idle bytes until the card releases MISO (0xFF), for up to
    /// `timeout_ms` milliseconds.
    pub(crate) fn wait_ready(&mut self, timeout_ms: u32) -> SdSpiResult<()> {
        for _ in 0..timeout_ms {
            if self.ops.spi_transfer(DUMMY_BYTE)? == DUMMY_BYTE {
                return Ok(());
            }
            self.ops.delay_ms(1);
        }
        warn!("card stayed busy for {} ms", timeout_ms);
        Err(SdSpiError::BusyTimeout)
    }

    /// Assert chip-select and wait for the card to be ready. On timeout the
    /// card is deselected before the error surfaces.
    pub(crate) fn select(&mut self) -> SdSpiResult<()> {
        self.ops.cs_assert()?;
        // One dummy clock so the card starts driving MISO.
        self.ops.spi_transfer(DUMMY_BYTE)?;
        if let Err(err) = self.wait_ready(READY_TIMEOUT_MS) {
            let _ = self.deselect();
            return Err(err);
        }
        Ok(())
    }

    /// Raise chip-select and clock one idle byte so the card releases MISO
    /// and any internal programming proceeds.
    pub(crate) fn deselect(&mut self) -> SdSpiResult<()> {
        self.ops.cs_deassert()?;
        self.ops.spi_transfer(DUMMY_BYTE)?;
        Ok(())
    }

    /// Run `f` with the card selected; deselect on every exit path. The
    /// closure's error wins over a deselect failure.
    pub(crate) fn with_select<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> SdSpiResult<R>,
    ) -> SdSpiResult<R> {
        self.select()?;
        let out = f(self);
        let released = self.deselect();
        match out {
            Ok(value) => released.map(|_| value),
            Err(err) => {
                let _ = released;
                Err(err)
            }
        }
    }

    /// Select, run one command, deselect.
    pub(crate) fn transaction(&mut self, cmd: u8, arg: u32) -> SdSpiResult<SdResponse> {
        self.with_select(|host| host.command(cmd, arg))
    }

    /// Send a command and collect its response. The card must already be
    /// selected. Application commands get their CMD55 prelude here; a
    /// prelude failure returns the CMD55 response unchanged.
    pub(crate) fn command(&mut self, cmd: u8, arg: u32) -> SdSpiResult<SdResponse> {
        if is_app_command(cmd) {
            let prelude = self.raw_command(CMD_APP_CMD, 0)?;
            if prelude.r1() > R1_IDLE_STATE {
                return Ok(prelude);
            }
            self.ops.spi_transfer(DUMMY_BYTE)?;
        }
        self.raw_command(cmd, arg)
    }

    fn raw_command(&mut self, cmd: u8, arg: u32) -> SdSpiResult<SdResponse> {
        let frame = command_frame(cmd, arg, self.crc_enabled);
        let mut r1 = R1_NO_RESPONSE;

        for attempt in 0..COMMAND_RETRIES {
            for byte in frame {
                self.ops.spi_transfer(byte)?;
            }
            // CMD12 needs one stuff byte before the response window opens.
            if cmd == CMD_STOP_TRANSMISSION {
                self.ops.spi_transfer(DUMMY_BYTE)?;
            }

            r1 = R1_NO_RESPONSE;
            for _ in 0..RESPONSE_POLL_BYTES {
                let byte = self.ops.spi_transfer(DUMMY_BYTE)?;
                if byte & 0x80 == 0 {
                    r1 = byte;
                    break;
                }
            }
            trace!("CMD{} arg {:#010x} r1 {:#04x}", cmd, arg, r1);

            if r1 == R1_NO_RESPONSE {
                // Dead card; retrying the frame will not help.
                return Ok(SdResponse::new(r1));
            }
            if r1 & R1_CRC_ERROR != 0 {
                warn!("CMD{} rejected for CRC, attempt {}", cmd, attempt + 1);
                continue;
            }
            break;
        }

        if r1 > R1_IDLE_STATE {
            return Ok(SdResponse::new(r1));
        }

        let resp = match trailer_len(cmd) {
            1 => {
                let r2 = self.ops.spi_transfer(DUMMY_BYTE)?;
                SdResponse::with_trailer(r1, r2 as u32)
            }
            4 => {
                let mut trailer = 0u32;
                for _ in 0..4 {
                    trailer = (trailer << 8) | self.ops.spi_transfer(DUMMY_BYTE)? as u32;
                }
                SdResponse::with_trailer(r1, trailer)
            }
            _ => SdResponse::new(r1),
        };
        Ok(resp)
    }
}
