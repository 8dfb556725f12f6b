//! Data-block transport: start-token wait, payload transfer, CRC16.

use crc::{Crc, CRC_16_XMODEM};
use log::warn;

use crate::constants::*;
use crate::core::SdSpiHost;
use crate::host::{SdSpiError, SdSpiOps, SdSpiResult};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

impl<T: SdSpiOps> SdSpiHost<T> {
    /// Receive one data block into `buffer` after a successful read
    /// command. Waits up to 200 ms for the start token, then transfers the
    /// payload and checks the trailing CRC16 when CRC mode is on.
    pub(crate) fn read_data(&mut self, buffer: &mut [u8]) -> SdSpiResult<()> {
        let mut token = DUMMY_BYTE;
        for _ in 0..TOKEN_TIMEOUT_MS {
            token = self.ops.spi_transfer(DUMMY_BYTE)?;
            if token != DUMMY_BYTE {
                break;
            }
            self.ops.delay_ms(1);
        }
        if token != TOKEN_START_BLOCK {
            warn!("bad start token {:#04x}", token);
            return Err(SdSpiError::DataTokenError);
        }

        let wire_crc = if self.large_frames && buffer.len() % 2 == 0 {
            for chunk in buffer.chunks_exact_mut(2) {
                let word = self.ops.spi_transfer_wide(DUMMY_WORD)?;
                chunk.copy_from_slice(&word.to_be_bytes());
            }
            self.ops.spi_transfer_wide(DUMMY_WORD)?
        } else {
            for byte in buffer.iter_mut() {
                *byte = self.ops.spi_transfer(DUMMY_BYTE)?;
            }
            let hi = self.ops.spi_transfer(DUMMY_BYTE)?;
            let lo = self.ops.spi_transfer(DUMMY_BYTE)?;
            u16::from_be_bytes([hi, lo])
        };

        if self.crc_enabled && wire_crc != CRC16.checksum(buffer) {
            warn!("data CRC mismatch");
            return Err(SdSpiError::CrcError);
        }
        Ok(())
    }

    /// Transmit one data block behind `token` and return the card's 5-bit
    /// data response. The CRC16 trailer is 0xFFFF when CRC mode is off.
    pub(crate) fn write_data(&mut self, buffer: &[u8], token: u8) -> SdSpiResult<u8> {
        self.wait_ready(READY_TIMEOUT_MS)?;
        self.ops.spi_transfer(token)?;

        let crc = if self.crc_enabled {
            CRC16.checksum(buffer)
        } else {
            0xFFFF
        };

        if self.large_frames && buffer.len() % 2 == 0 {
            for chunk in buffer.chunks_exact(2) {
                self.ops
                    .spi_transfer_wide(u16::from_be_bytes([chunk[0], chunk[1]]))?;
            }
            self.ops.spi_transfer_wide(crc)?;
        } else {
            for byte in buffer {
                self.ops.spi_transfer(*byte)?;
            }
            let [hi, lo] = crc.to_be_bytes();
            self.ops.spi_transfer(hi)?;
            self.ops.spi_transfer(lo)?;
        }

        Ok(self.ops.spi_transfer(DUMMY_BYTE)? & DATA_RESP_MASK)
    }
}
