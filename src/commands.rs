//! Command frame construction and response carriers.

use crc::{Crc, CRC_7_MMC};

use crate::constants::*;
use crate::host::SdSpiError;

const CRC7: Crc<u8> = Crc::<u8>::new(&CRC_7_MMC);

/// Whether a command index belongs to the application-specific set that
/// must be preceded on the wire by CMD55.
pub fn is_app_command(cmd: u8) -> bool {
    matches!(
        cmd,
        ACMD_SEND_NUM_WR_BLOCKS
            | ACMD_SET_WR_BLK_ERASE_COUNT
            | ACMD_SD_SEND_OP_COND
            | ACMD_SET_CLR_CARD_DETECT
    )
}

/// Build the 6-byte command frame: `[cmd|0x40, arg BE, (crc7 << 1) | 1]`.
///
/// With the runtime CRC flag off the trailer is the bare stop bit, except
/// for CMD0 and CMD8 which always carry a valid CRC7 so the handshake works
/// before CMD59 has been negotiated.
pub fn command_frame(cmd: u8, arg: u32, with_crc: bool) -> [u8; 6] {
    let mut frame = [0u8; 6];
    frame[0] = 0x40 | (cmd & 0x3F);
    frame[1..5].copy_from_slice(&arg.to_be_bytes());
    frame[5] = if with_crc || cmd == CMD_GO_IDLE_STATE || cmd == CMD_SEND_IF_COND {
        (CRC7.checksum(&frame[..5]) << 1) | 0x01
    } else {
        0x01
    };
    frame
}

/// How many trailer bytes follow a valid R1 for this command.
pub fn trailer_len(cmd: u8) -> usize {
    match cmd {
        CMD_SEND_STATUS => 1,
        CMD_SEND_IF_COND | CMD_READ_OCR => 4,
        _ => 0,
    }
}

/// R1 response plus the optional R2/R3/R7 trailer collected after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdResponse {
    r1: u8,
    trailer: u32,
}

impl SdResponse {
    pub fn new(r1: u8) -> Self {
        SdResponse { r1, trailer: 0 }
    }

    pub fn with_trailer(r1: u8, trailer: u32) -> Self {
        SdResponse { r1, trailer }
    }

    pub fn r1(&self) -> u8 {
        self.r1
    }

    /// Second status byte of an R2 response (CMD13).
    pub fn r2(&self) -> u8 {
        self.trailer as u8
    }

    /// 32-bit payload of an R3 response (CMD58).
    pub fn ocr(&self) -> u32 {
        self.trailer
    }

    /// 32-bit payload of an R7 response (CMD8).
    pub fn r7(&self) -> u32 {
        self.trailer
    }

    /// True when the card answered and reported no error bits.
    pub fn accepted(&self) -> bool {
        self.r1 <= R1_IDLE_STATE
    }
}

/// Map a failed R1 to the matching error kind.
pub fn r1_error(r1: u8) -> SdSpiError {
    if r1 == R1_NO_RESPONSE {
        SdSpiError::CommandTimeout
    } else {
        SdSpiError::CommandError(r1)
    }
}
