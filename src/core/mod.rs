pub mod block;

mod cmd;
mod data;

#[cfg(test)]
pub(crate) mod testutil;

use core::sync::atomic::{AtomicU8, Ordering};

use log::{info, warn};

use crate::card::CardType;
use crate::constants::*;
use crate::disk::DiskStatus;
use crate::host::{DetectMode, SdSpiError, SdSpiOps, SdSpiResult};

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdConfig {
    /// Target SPI clock. Capped after initialization to 20 MHz for MMC and
    /// 25 MHz for SD cards.
    pub hz: u32,
    /// Polarity of the card-detect switch.
    pub detect_mode: DetectMode,
    /// Start with command and data CRC checking enabled.
    pub crc: bool,
    /// Start with 16-bit data payload transfers enabled.
    pub large_frames: bool,
}

impl Default for SdConfig {
    fn default() -> Self {
        SdConfig {
            hz: 1_000_000,
            detect_mode: DetectMode::NormallyOpen,
            crc: true,
            large_frames: false,
        }
    }
}

impl SdConfig {
    pub fn set_hz(&mut self, hz: u32) {
        self.hz = hz;
    }

    pub fn set_detect_mode(&mut self, mode: DetectMode) {
        self.detect_mode = mode;
    }

    pub fn set_crc(&mut self, crc: bool) {
        self.crc = crc;
    }

    pub fn set_large_frames(&mut self, large_frames: bool) {
        self.large_frames = large_frames;
    }
}

/// An SD/MMC card attached through SPI.
///
/// Constructed idle; the first block operation (or [`card_type`]) triggers
/// the initialization handshake when a card is present.
///
/// [`card_type`]: SdSpiHost::card_type
pub struct SdSpiHost<T: SdSpiOps> {
    pub(crate) ops: T,
    pub(crate) config: SdConfig,
    pub(crate) card_type: CardType,
    pub(crate) crc_enabled: bool,
    pub(crate) large_frames: bool,
    status: AtomicU8,
}

/// Handle for the card-detect edge interrupt.
///
/// The handler context may touch nothing but the status word, so this
/// borrows only that. Card type and the rest of the driver state are
/// reconciled on the next driver-context access.
#[derive(Debug, Clone, Copy)]
pub struct CardDetect<'a> {
    status: &'a AtomicU8,
}

impl CardDetect<'_> {
    /// Record an insertion or removal edge.
    pub fn card_changed(&self, present: bool) {
        if present {
            self.status
                .fetch_and(!DiskStatus::NODISK.bits(), Ordering::Relaxed);
        } else {
            self.status.fetch_or(
                (DiskStatus::NODISK | DiskStatus::NOINIT).bits(),
                Ordering::Relaxed,
            );
        }
    }
}

impl<T: SdSpiOps> SdSpiHost<T> {
    pub fn new(ops: T, config: SdConfig) -> Self {
        let crc_enabled = config.crc;
        let large_frames = config.large_frames;
        SdSpiHost {
            ops,
            config,
            card_type: CardType::None,
            crc_enabled,
            large_frames,
            status: AtomicU8::new((DiskStatus::NOINIT | DiskStatus::NODISK).bits()),
        }
    }

    pub fn ops(&self) -> &T {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut T {
        &mut self.ops
    }

    pub fn config(&self) -> &SdConfig {
        &self.config
    }

    /// Tear down the driver and hand the host resources back.
    pub fn release(self) -> T {
        self.ops
    }

    /// Current status word, without re-sampling card detect.
    pub fn status(&self) -> DiskStatus {
        DiskStatus::from_bits_truncate(self.status.load(Ordering::Relaxed))
    }

    pub(crate) fn status_set(&self, flags: DiskStatus) {
        self.status.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn status_clear(&self, flags: DiskStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    /// Handle for the card-detect edge interrupt.
    pub fn detect(&self) -> CardDetect<'_> {
        CardDetect {
            status: &self.status,
        }
    }

    /// Sample the card-detect line and fold the result into the status word.
    pub fn check_socket(&mut self) {
        let level = self.ops.cd_level();
        let present = match self.config.detect_mode {
            DetectMode::NormallyOpen => level,
            DetectMode::NormallyClosed => !level,
        };
        if present {
            self.status_clear(DiskStatus::NODISK);
        } else {
            self.status_set(DiskStatus::NODISK | DiskStatus::NOINIT);
            self.card_type = CardType::None;
        }
    }

    /// Detected card class, initializing the card first when a present
    /// medium is still uninitialized.
    pub fn card_type(&mut self) -> CardType {
        self.check_socket();
        let status = self.status();
        if !status.contains(DiskStatus::NODISK) && status.contains(DiskStatus::NOINIT) {
            self.initialize();
        }
        self.card_type
    }

    /// Run the initialization handshake on present, uninitialized media.
    /// Idempotent; returns the resulting status word.
    pub fn initialize(&mut self) -> DiskStatus {
        self.check_socket();
        let status = self.status();
        if status.contains(DiskStatus::NODISK) || !status.contains(DiskStatus::NOINIT) {
            return status;
        }
        match self.init_card() {
            Ok(card_type) => {
                self.card_type = card_type;
                self.status_clear(DiskStatus::NOINIT);
            }
            Err(err) => {
                warn!("card initialization failed: {}", err);
                self.card_type = CardType::Unknown;
            }
        }
        self.status()
    }

    /// The ordered handshake classifying the card. Any failure leaves the
    /// driver uninitialized; the caller records `CardType::Unknown`.
    fn init_card(&mut self) -> SdSpiResult<CardType> {
        self.ops.spi_set_clock(INIT_CLOCK_HZ)?;

        // At least 74 clocks with chip-select high to enter SPI mode.
        self.ops.cs_deassert()?;
        for _ in 0..POWER_UP_IDLE_BYTES {
            self.ops.spi_transfer(DUMMY_BYTE)?;
        }

        if self.transaction(CMD_GO_IDLE_STATE, 0)?.r1() != R1_IDLE_STATE {
            return Err(SdSpiError::InitFailed);
        }

        if self.crc_enabled && self.transaction(CMD_CRC_ON_OFF, 1)?.r1() != R1_IDLE_STATE {
            return Err(SdSpiError::InitFailed);
        }

        let if_cond = self.transaction(CMD_SEND_IF_COND, IF_COND_CHECK_ARG)?;
        let card_type = if if_cond.r1() == R1_IDLE_STATE {
            // SDv2; the card echoes the voltage range and check pattern.
            if if_cond.r7() & 0xFFF != IF_COND_CHECK_ARG {
                return Err(SdSpiError::InitFailed);
            }
            let ocr = self.transaction(CMD_READ_OCR, 0)?;
            if ocr.r1() != R1_IDLE_STATE || ocr.ocr() & OCR_VOLTAGE_3V2_3V3 == 0 {
                return Err(SdSpiError::InitFailed);
            }
            if self.poll_op_cond(ACMD_SD_SEND_OP_COND, OP_COND_HIGH_CAPACITY_ARG)? != 0x00 {
                return Err(SdSpiError::InitFailed);
            }
            let ocr = self.transaction(CMD_READ_OCR, 0)?;
            if ocr.r1() != 0x00 {
                return Err(SdSpiError::InitFailed);
            }
            if ocr.ocr() & OCR_HIGH_CAPACITY != 0 {
                CardType::Sdhc
            } else {
                CardType::Sd
            }
        } else {
            // No CMD8: an SDv1 or MMC card.
            let ocr = self.transaction(CMD_READ_OCR, 0)?;
            if ocr.r1() != R1_IDLE_STATE || ocr.ocr() & OCR_VOLTAGE_3V2_3V3 == 0 {
                return Err(SdSpiError::InitFailed);
            }
            if self.poll_op_cond(ACMD_SD_SEND_OP_COND, OP_COND_VOLTAGE_ARG)? == 0x00 {
                CardType::Sd
            } else if self.poll_op_cond(CMD_SEND_OP_COND, OP_COND_VOLTAGE_ARG)? == 0x00 {
                CardType::Mmc
            } else {
                return Err(SdSpiError::InitFailed);
            }
        };

        // Byte-addressed cards get the block length pinned to 512.
        if card_type != CardType::Sdhc
            && self.transaction(CMD_SET_BLOCKLEN, BLOCK_SIZE as u32)?.r1() != 0x00
        {
            return Err(SdSpiError::InitFailed);
        }

        // Disconnect the internal pull-up on chip-select.
        if card_type != CardType::Mmc
            && self.transaction(ACMD_SET_CLR_CARD_DETECT, 0)?.r1() != 0x00
        {
            return Err(SdSpiError::InitFailed);
        }

        let cap = if card_type == CardType::Mmc {
            MAX_CLOCK_MMC_HZ
        } else {
            MAX_CLOCK_SD_HZ
        };
        self.ops.spi_set_clock(self.config.hz.min(cap))?;

        info!("card handshake complete: {:?}", card_type);
        Ok(card_type)
    }

    /// Repeat an operating-conditions command until the card leaves the
    /// idle state, for up to a second. Returns the final R1.
    fn poll_op_cond(&mut self, cmd: u8, arg: u32) -> SdSpiResult<u8> {
        let mut r1 = R1_NO_RESPONSE;
        for _ in 0..OP_COND_TIMEOUT_MS {
            r1 = self.transaction(cmd, arg)?.r1();
            if r1 != R1_IDLE_STATE {
                break;
            }
            self.ops.delay_ms(1);
        }
        Ok(r1)
    }

    pub fn crc(&self) -> bool {
        self.crc_enabled
    }

    /// Toggle command and data CRC checking. On an initialized card this
    /// also reprograms the card through CMD59.
    pub fn set_crc(&mut self, enabled: bool) -> SdSpiResult<()> {
        if self.crc_enabled == enabled {
            return Ok(());
        }
        self.crc_enabled = enabled;
        if !self.status().contains(DiskStatus::NOINIT) {
            let resp = self.transaction(CMD_CRC_ON_OFF, enabled as u32)?;
            if resp.r1() != 0x00 {
                return Err(crate::commands::r1_error(resp.r1()));
            }
        }
        Ok(())
    }

    pub fn large_frames(&self) -> bool {
        self.large_frames
    }

    /// Toggle 16-bit SPI transfers for data payloads. Command framing is
    /// always byte-wide.
    pub fn set_large_frames(&mut self, enabled: bool) {
        self.large_frames = enabled;
    }

    /// Record the position of a mechanical write-protect switch. The driver
    /// never sets this itself.
    pub fn set_write_protect(&mut self, protected: bool) {
        if protected {
            self.status_set(DiskStatus::PROTECT);
        } else {
            self.status_clear(DiskStatus::PROTECT);
        }
    }

    /// Forget the card; the next access re-initializes it.
    pub fn unmount(&mut self) {
        self.status_set(DiskStatus::NOINIT);
        self.card_type = CardType::None;
    }
}
