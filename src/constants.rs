//! Wire-level constants for the SD/MMC SPI protocol.

/* Command indices */
pub const CMD_GO_IDLE_STATE: u8 = 0;
pub const CMD_SEND_OP_COND: u8 = 1;
pub const CMD_SEND_IF_COND: u8 = 8;
pub const CMD_SEND_CSD: u8 = 9;
pub const CMD_SEND_CID: u8 = 10;
pub const CMD_STOP_TRANSMISSION: u8 = 12;
pub const CMD_SEND_STATUS: u8 = 13;
pub const CMD_SET_BLOCKLEN: u8 = 16;
pub const CMD_READ_SINGLE_BLOCK: u8 = 17;
pub const CMD_READ_MULTIPLE_BLOCK: u8 = 18;
pub const CMD_WRITE_BLOCK: u8 = 24;
pub const CMD_WRITE_MULTIPLE_BLOCK: u8 = 25;
pub const CMD_APP_CMD: u8 = 55;
pub const CMD_READ_OCR: u8 = 58;
pub const CMD_CRC_ON_OFF: u8 = 59;

/* Application-specific commands, preceded on the wire by CMD55 */
pub const ACMD_SEND_NUM_WR_BLOCKS: u8 = 22;
pub const ACMD_SET_WR_BLK_ERASE_COUNT: u8 = 23;
pub const ACMD_SD_SEND_OP_COND: u8 = 41;
pub const ACMD_SET_CLR_CARD_DETECT: u8 = 42;

/* R1 response token */
pub const R1_IDLE_STATE: u8 = 0x01;
pub const R1_CRC_ERROR: u8 = 0x08;
pub const R1_NO_RESPONSE: u8 = 0xFF;

/* Data transport tokens */
pub const TOKEN_START_BLOCK: u8 = 0xFE;
pub const TOKEN_START_BLOCK_MULTI: u8 = 0xFC;
pub const TOKEN_STOP_TRAN: u8 = 0xFD;

/* Write data-response, low 5 bits of the byte following a data block */
pub const DATA_RESP_MASK: u8 = 0x1F;
pub const DATA_RESP_ACCEPTED: u8 = 0x05;
pub const DATA_RESP_CRC_ERROR: u8 = 0x0A;
pub const DATA_RESP_WRITE_ERROR: u8 = 0x0C;

/* OCR register bits */
pub const OCR_VOLTAGE_3V2_3V3: u32 = 1 << 20;
pub const OCR_HIGH_CAPACITY: u32 = 1 << 30;

/* Command arguments */
pub const IF_COND_CHECK_ARG: u32 = 0x0000_01AA;
pub const OP_COND_VOLTAGE_ARG: u32 = 0x0010_0000;
pub const OP_COND_HIGH_CAPACITY_ARG: u32 = 0x4010_0000;

pub const BLOCK_SIZE: usize = 512;
pub const CSD_SIZE: usize = 16;
pub const CID_SIZE: usize = 16;

/// Idle pattern; clocking it out lets the card drive MISO.
pub const DUMMY_BYTE: u8 = 0xFF;
pub const DUMMY_WORD: u16 = 0xFFFF;

/* Clocking */
pub const INIT_CLOCK_HZ: u32 = 400_000;
pub const MAX_CLOCK_SD_HZ: u32 = 25_000_000;
pub const MAX_CLOCK_MMC_HZ: u32 = 20_000_000;
/// 80 clocks with chip-select high puts the card into SPI mode.
pub const POWER_UP_IDLE_BYTES: usize = 10;

/* Bounded waits, in 1 ms polling steps */
pub const READY_TIMEOUT_MS: u32 = 500;
pub const TOKEN_TIMEOUT_MS: u32 = 200;
pub const OP_COND_TIMEOUT_MS: u32 = 1000;

/* Retry budgets */
pub const RESPONSE_POLL_BYTES: usize = 10;
pub const COMMAND_RETRIES: u32 = 3;
pub const BLOCK_RETRIES: u32 = 3;
