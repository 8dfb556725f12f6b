//! Block-device operations on top of the command and data layers.

use log::{debug, warn};

use crate::card::{CardType, Cid, Csd};
use crate::commands::r1_error;
use crate::constants::*;
use crate::core::SdSpiHost;
use crate::disk::{BlockDevice, DiskError, DiskStatus};
use crate::host::{SdSpiError, SdSpiOps, SdSpiResult};

impl<T: SdSpiOps> SdSpiHost<T> {
    /// Reject operations on missing or uninitialized media, and keep the
    /// card-type tag consistent with an empty socket.
    fn require_ready(&mut self) -> SdSpiResult<()> {
        let status = self.status();
        if status.contains(DiskStatus::NODISK) {
            self.card_type = CardType::None;
        }
        if status.contains(DiskStatus::NOINIT) {
            return Err(SdSpiError::NotReady);
        }
        Ok(())
    }

    /// High-capacity cards address in blocks, everything else in bytes.
    fn block_addr(&self, lba: u64) -> u32 {
        if self.card_type.high_capacity() {
            lba as u32
        } else {
            lba as u32 * BLOCK_SIZE as u32
        }
    }

    /// Read `count` sectors starting at `lba`.
    pub fn read_blocks(&mut self, buffer: &mut [u8], lba: u64, count: usize) -> SdSpiResult<()> {
        self.require_ready()?;
        if buffer.len() < count * BLOCK_SIZE {
            return Err(SdSpiError::InvalidValue);
        }
        if count == 0 {
            return Ok(());
        }
        if count == 1 {
            self.read_single(buffer, lba)
        } else {
            self.read_multiple(buffer, lba, count)
        }
    }

    fn read_single(&mut self, buffer: &mut [u8], lba: u64) -> SdSpiResult<()> {
        let addr = self.block_addr(lba);
        let mut last = SdSpiError::CrcError;
        for attempt in 0..BLOCK_RETRIES {
            let result = self.with_select(|host| {
                let r1 = host.command(CMD_READ_SINGLE_BLOCK, addr)?.r1();
                if r1 != 0x00 {
                    return Err(r1_error(r1));
                }
                host.read_data(&mut buffer[..BLOCK_SIZE])
            });
            match result {
                Ok(()) => return Ok(()),
                Err(err @ (SdSpiError::CrcError | SdSpiError::DataTokenError)) => {
                    warn!("block read attempt {} failed: {}", attempt + 1, err);
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    fn read_multiple(&mut self, buffer: &mut [u8], mut lba: u64, count: usize) -> SdSpiResult<()> {
        let mut done = 0usize;
        let mut failures = 0;
        while failures < BLOCK_RETRIES {
            let addr = self.block_addr(lba);
            let remaining = count - done;
            let burst = self.with_select(|host| {
                let r1 = host.command(CMD_READ_MULTIPLE_BLOCK, addr)?.r1();
                if r1 != 0x00 {
                    return Err(r1_error(r1));
                }
                let mut read = 0usize;
                let mut clean = true;
                while read < remaining {
                    let start = (done + read) * BLOCK_SIZE;
                    match host.read_data(&mut buffer[start..start + BLOCK_SIZE]) {
                        Ok(()) => read += 1,
                        Err(err @ (SdSpiError::CrcError | SdSpiError::DataTokenError)) => {
                            warn!("burst read failed after {} blocks: {}", read, err);
                            clean = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }
                // The card streams until told to stop.
                host.command(CMD_STOP_TRANSMISSION, 0)?;
                if !clean {
                    host.wait_ready(READY_TIMEOUT_MS)?;
                }
                Ok(read)
            })?;
            done += burst;
            lba += burst as u64;
            if done == count {
                return Ok(());
            }
            failures = if burst > 0 { 0 } else { failures + 1 };
        }
        Err(SdSpiError::CrcError)
    }

    /// Write `count` sectors starting at `lba`.
    pub fn write_blocks(&mut self, buffer: &[u8], lba: u64, count: usize) -> SdSpiResult<()> {
        self.require_ready()?;
        if self.status().contains(DiskStatus::PROTECT) {
            return Err(SdSpiError::WriteProtected);
        }
        if buffer.len() < count * BLOCK_SIZE {
            return Err(SdSpiError::InvalidValue);
        }
        if count == 0 {
            return Ok(());
        }
        if count == 1 {
            self.write_single(buffer, lba)
        } else {
            self.write_multiple(buffer, lba, count)
        }
    }

    fn write_single(&mut self, buffer: &[u8], lba: u64) -> SdSpiResult<()> {
        let addr = self.block_addr(lba);
        for attempt in 0..BLOCK_RETRIES {
            let token = self.with_select(|host| {
                let r1 = host.command(CMD_WRITE_BLOCK, addr)?.r1();
                if r1 != 0x00 {
                    return Err(r1_error(r1));
                }
                host.write_data(&buffer[..BLOCK_SIZE], TOKEN_START_BLOCK)
            })?;
            match token {
                DATA_RESP_ACCEPTED => return self.verify_write(),
                DATA_RESP_CRC_ERROR => {
                    warn!("write attempt {} rejected for CRC", attempt + 1);
                }
                _ => {
                    warn!("write rejected, data response {:#04x}", token);
                    return Err(SdSpiError::WriteResponseError);
                }
            }
        }
        Err(SdSpiError::WriteResponseError)
    }

    fn write_multiple(&mut self, buffer: &[u8], mut lba: u64, count: usize) -> SdSpiResult<()> {
        let mut done = 0usize;
        let mut failures = 0;
        while failures < BLOCK_RETRIES {
            let remaining = count - done;

            // Pre-erase hint; MMC cards do not speak the ACMD set.
            if self.card_type != CardType::Mmc {
                let r1 = self
                    .transaction(ACMD_SET_WR_BLK_ERASE_COUNT, remaining as u32)?
                    .r1();
                if r1 != 0x00 {
                    return Err(r1_error(r1));
                }
            }

            let addr = self.block_addr(lba);
            let (burst, token) = self.with_select(|host| {
                let r1 = host.command(CMD_WRITE_MULTIPLE_BLOCK, addr)?.r1();
                if r1 != 0x00 {
                    return Err(r1_error(r1));
                }
                let mut written = 0usize;
                let mut token = DATA_RESP_ACCEPTED;
                while written < remaining {
                    let start = (done + written) * BLOCK_SIZE;
                    token = host
                        .write_data(&buffer[start..start + BLOCK_SIZE], TOKEN_START_BLOCK_MULTI)?;
                    if token != DATA_RESP_ACCEPTED {
                        break;
                    }
                    written += 1;
                }
                host.wait_ready(READY_TIMEOUT_MS)?;
                if written == remaining {
                    host.ops.spi_transfer(TOKEN_STOP_TRAN)?;
                } else {
                    host.command(CMD_STOP_TRANSMISSION, 0)?;
                }
                host.wait_ready(READY_TIMEOUT_MS)?;
                Ok((written, token))
            })?;

            if burst == remaining {
                return self.verify_write();
            }
            if token != DATA_RESP_CRC_ERROR {
                warn!("stream write aborted, data response {:#04x}", token);
                return Err(SdSpiError::WriteResponseError);
            }

            // The card knows how many blocks of the burst actually landed;
            // resume right after them.
            let well = (self.well_written_blocks()? as usize).min(remaining);
            debug!("resuming stream write, {} of {} blocks landed", well, remaining);
            done += well;
            lba += well as u64;
            failures = if well > 0 { 0 } else { failures + 1 };
        }
        Err(SdSpiError::WriteResponseError)
    }

    /// CMD13 status check after a write; both status bytes must be clear.
    fn verify_write(&mut self) -> SdSpiResult<()> {
        let resp = self.transaction(CMD_SEND_STATUS, 0)?;
        if resp.r1() != 0x00 || resp.r2() != 0x00 {
            warn!(
                "post-write status r1 {:#04x} r2 {:#04x}",
                resp.r1(),
                resp.r2()
            );
            return Err(SdSpiError::WriteResponseError);
        }
        Ok(())
    }

    /// ACMD22: number of blocks of the last stream write that programmed
    /// correctly, delivered as a 4-byte big-endian data block.
    fn well_written_blocks(&mut self) -> SdSpiResult<u32> {
        self.with_select(|host| {
            let r1 = host.command(ACMD_SEND_NUM_WR_BLOCKS, 0)?.r1();
            if r1 != 0x00 {
                return Err(r1_error(r1));
            }
            let mut raw = [0u8; 4];
            host.read_data(&mut raw)?;
            Ok(u32::from_be_bytes(raw))
        })
    }

    /// Force completion of any pending internal programming by selecting
    /// the card and waiting for ready.
    pub fn sync(&mut self) -> SdSpiResult<()> {
        self.with_select(|_| Ok(()))
    }

    fn read_register(&mut self, cmd: u8) -> SdSpiResult<[u8; CSD_SIZE]> {
        let mut last = SdSpiError::DataTokenError;
        for _ in 0..BLOCK_RETRIES {
            let result = self.with_select(|host| {
                let r1 = host.command(cmd, 0)?.r1();
                if r1 != 0x00 {
                    return Err(r1_error(r1));
                }
                let mut raw = [0u8; CSD_SIZE];
                host.read_data(&mut raw)?;
                Ok(raw)
            });
            match result {
                Ok(raw) => return Ok(raw),
                Err(err @ (SdSpiError::CrcError | SdSpiError::DataTokenError)) => last = err,
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Card-Specific Data register.
    pub fn csd(&mut self) -> SdSpiResult<Csd> {
        self.require_ready()?;
        match self.read_register(CMD_SEND_CSD) {
            Ok(raw) => Ok(Csd::new(raw)),
            Err(err) => {
                warn!("CSD read failed: {}", err);
                Err(SdSpiError::CsdReadFailed)
            }
        }
    }

    /// Card Identification register.
    pub fn cid(&mut self) -> SdSpiResult<Cid> {
        self.require_ready()?;
        self.read_register(CMD_SEND_CID).map(Cid::new)
    }

    /// Total sector count from the CSD, or 0 when it cannot be read.
    pub fn sectors(&mut self) -> u64 {
        self.csd().map(|csd| csd.sectors()).unwrap_or(0)
    }
}

impl<T: SdSpiOps> BlockDevice for SdSpiHost<T> {
    fn initialize(&mut self) -> DiskStatus {
        SdSpiHost::initialize(self)
    }

    fn status(&mut self) -> DiskStatus {
        self.check_socket();
        SdSpiHost::status(self)
    }

    fn read(&mut self, buffer: &mut [u8], lba: u64, count: usize) -> Result<(), DiskError> {
        self.read_blocks(buffer, lba, count).map_err(DiskError::from)
    }

    fn write(&mut self, buffer: &[u8], lba: u64, count: usize) -> Result<(), DiskError> {
        self.write_blocks(buffer, lba, count).map_err(DiskError::from)
    }

    fn sync(&mut self) -> Result<(), DiskError> {
        SdSpiHost::sync(self).map_err(DiskError::from)
    }

    fn sectors(&mut self) -> u64 {
        SdSpiHost::sectors(self)
    }
}
