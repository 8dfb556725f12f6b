//! Scripted mock card for protocol tests.
//!
//! Implements [`SdSpiOps`] with a small SPI-mode card model: it parses
//! command frames off MOSI, answers with scripted R1 values and trailers,
//! streams data blocks for read commands, and captures data blocks for
//! write commands. Unscripted commands answer R1 = 0x00; the scripted value
//! 0xFF means "never respond".

use std::collections::{BTreeMap, VecDeque};

use crc::{Crc, CRC_16_XMODEM};

use crate::card::CardType;
use crate::constants::*;
use crate::core::{SdConfig, SdSpiHost};
use crate::disk::DiskStatus;
use crate::host::{SdSpiOps, SdSpiResult};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// One decoded command frame, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenCommand {
    pub index: u8,
    pub arg: u32,
    /// True when the frame was preceded by CMD55.
    pub app: bool,
}

/// One captured write block.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub token: u8,
    pub data: Vec<u8>,
    pub crc: u16,
}

impl WriteRecord {
    pub fn crc_matches(&self) -> bool {
        self.crc == CRC16.checksum(&self.data)
    }
}

struct ReadBlock {
    token: u8,
    data: Vec<u8>,
    crc: u16,
}

struct Capture {
    token: u8,
    buf: Vec<u8>,
    need: usize,
}

pub struct MockHost {
    /// Raw card-detect line level.
    pub present_level: bool,
    /// When set, MISO is stuck at 0x00 (card never ready).
    pub busy_forever: bool,
    pub cs_low: bool,
    /// Chip-select level after every change; true = asserted.
    pub cs_trace: Vec<bool>,
    pub clocks: Vec<u32>,
    pub delayed_ms: u32,
    pub seen: Vec<SeenCommand>,
    pub writes: Vec<WriteRecord>,
    /// Stop-tran tokens observed while a stream write was open.
    pub stop_trans: usize,
    r1_scripts: BTreeMap<u8, VecDeque<u8>>,
    r1_defaults: BTreeMap<u8, u8>,
    trailer_scripts: BTreeMap<u8, VecDeque<u32>>,
    read_blocks: VecDeque<ReadBlock>,
    write_tokens: VecDeque<u8>,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    app_pending: bool,
    expect_token: Option<u8>,
    capture: Option<Capture>,
    streaming: bool,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost {
            present_level: true,
            busy_forever: false,
            cs_low: false,
            cs_trace: Vec::new(),
            clocks: Vec::new(),
            delayed_ms: 0,
            seen: Vec::new(),
            writes: Vec::new(),
            stop_trans: 0,
            r1_scripts: BTreeMap::new(),
            r1_defaults: BTreeMap::new(),
            trailer_scripts: BTreeMap::new(),
            read_blocks: VecDeque::new(),
            write_tokens: VecDeque::new(),
            out: VecDeque::new(),
            frame: Vec::new(),
            app_pending: false,
            expect_token: None,
            capture: None,
            streaming: false,
        }
    }

    pub fn push_r1(&mut self, cmd: u8, r1: u8) {
        self.r1_scripts.entry(cmd).or_default().push_back(r1);
    }

    pub fn default_r1(&mut self, cmd: u8, r1: u8) {
        self.r1_defaults.insert(cmd, r1);
    }

    pub fn push_trailer(&mut self, cmd: u8, trailer: u32) {
        self.trailer_scripts.entry(cmd).or_default().push_back(trailer);
    }

    pub fn push_read(&mut self, data: &[u8]) {
        self.read_blocks.push_back(ReadBlock {
            token: TOKEN_START_BLOCK,
            data: data.to_vec(),
            crc: CRC16.checksum(data),
        });
    }

    pub fn push_read_bad_crc(&mut self, data: &[u8]) {
        self.read_blocks.push_back(ReadBlock {
            token: TOKEN_START_BLOCK,
            data: data.to_vec(),
            crc: CRC16.checksum(data) ^ 0xFFFF,
        });
    }

    /// Queue a non-0xFE token with no payload (card aborts the read).
    pub fn push_read_error_token(&mut self, token: u8) {
        self.read_blocks.push_back(ReadBlock {
            token,
            data: Vec::new(),
            crc: 0,
        });
    }

    pub fn push_write_token(&mut self, token: u8) {
        self.write_tokens.push_back(token);
    }

    pub fn commands_with_index(&self, index: u8) -> usize {
        self.seen.iter().filter(|c| c.index == index).count()
    }

    pub fn args_for(&self, index: u8) -> Vec<u32> {
        self.seen
            .iter()
            .filter(|c| c.index == index)
            .map(|c| c.arg)
            .collect()
    }

    fn next_r1(&mut self, cmd: u8) -> u8 {
        if let Some(script) = self.r1_scripts.get_mut(&cmd) {
            if let Some(r1) = script.pop_front() {
                return r1;
            }
        }
        self.r1_defaults.get(&cmd).copied().unwrap_or(0x00)
    }

    fn emit_read_block(&mut self) {
        if let Some(block) = self.read_blocks.pop_front() {
            self.out.push_back(DUMMY_BYTE);
            self.out.push_back(block.token);
            if block.token == TOKEN_START_BLOCK {
                self.out.extend(block.data.iter().copied());
                self.out.extend(block.crc.to_be_bytes());
            }
        }
    }

    fn decode_frame(&mut self) {
        let cmd = self.frame[0] & 0x3F;
        let arg = u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
        let app = self.app_pending;
        self.frame.clear();
        self.seen.push(SeenCommand {
            index: cmd,
            arg,
            app,
        });

        // A new command always interrupts whatever the card was sending.
        self.out.clear();
        self.streaming = false;

        let r1 = self.next_r1(cmd);
        // Response gap; CMD12 also swallows the stuff byte the host clocks.
        let gap = if cmd == CMD_STOP_TRANSMISSION { 2 } else { 1 };
        for _ in 0..gap {
            self.out.push_back(DUMMY_BYTE);
        }
        if r1 != R1_NO_RESPONSE {
            self.out.push_back(r1);
        }

        if r1 <= R1_IDLE_STATE && r1 != R1_NO_RESPONSE {
            match cmd {
                CMD_SEND_IF_COND | CMD_READ_OCR => {
                    let trailer = self
                        .trailer_scripts
                        .get_mut(&cmd)
                        .and_then(|q| q.pop_front())
                        .unwrap_or(0);
                    self.out.extend(trailer.to_be_bytes());
                }
                CMD_SEND_STATUS => {
                    let r2 = self
                        .trailer_scripts
                        .get_mut(&cmd)
                        .and_then(|q| q.pop_front())
                        .unwrap_or(0);
                    self.out.push_back(r2 as u8);
                }
                _ => {}
            }
        }

        if r1 == 0x00 {
            match cmd {
                CMD_SEND_CSD | CMD_SEND_CID | CMD_READ_SINGLE_BLOCK => self.emit_read_block(),
                ACMD_SEND_NUM_WR_BLOCKS if app => self.emit_read_block(),
                CMD_READ_MULTIPLE_BLOCK => {
                    self.streaming = true;
                    self.emit_read_block();
                }
                CMD_WRITE_BLOCK => self.expect_token = Some(TOKEN_START_BLOCK),
                CMD_WRITE_MULTIPLE_BLOCK => self.expect_token = Some(TOKEN_START_BLOCK_MULTI),
                _ => {}
            }
        }

        if cmd == CMD_STOP_TRANSMISSION {
            self.expect_token = None;
            // Brief programming window after aborting a stream.
            self.out.push_back(0x00);
            self.out.push_back(DUMMY_BYTE);
        }

        self.app_pending = cmd == CMD_APP_CMD;
    }

    fn finish_capture(&mut self) {
        let capture = self.capture.take().expect("no capture in progress");
        let mut data = capture.buf;
        let crc_hi = data[BLOCK_SIZE];
        let crc_lo = data[BLOCK_SIZE + 1];
        data.truncate(BLOCK_SIZE);
        self.writes.push(WriteRecord {
            token: capture.token,
            data,
            crc: u16::from_be_bytes([crc_hi, crc_lo]),
        });

        let resp = self.write_tokens.pop_front().unwrap_or(DATA_RESP_ACCEPTED);
        self.out.clear();
        // The response shows up in the byte after the CRC trailer.
        self.out.push_back(DUMMY_BYTE);
        self.out.push_back(resp);
        // Programming time, then ready.
        self.out.push_back(0x00);
        self.out.push_back(DUMMY_BYTE);

        if capture.token == TOKEN_START_BLOCK {
            self.expect_token = None;
        }
    }

    fn feed(&mut self, mosi: u8) {
        if let Some(capture) = self.capture.as_mut() {
            capture.buf.push(mosi);
            if capture.buf.len() == capture.need {
                self.finish_capture();
            }
            return;
        }
        if !self.frame.is_empty() {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                self.decode_frame();
            }
            return;
        }
        if mosi & 0xC0 == 0x40 {
            self.frame.push(mosi);
            return;
        }
        if let Some(token) = self.expect_token {
            if mosi == token {
                self.capture = Some(Capture {
                    token,
                    buf: Vec::new(),
                    need: BLOCK_SIZE + 2,
                });
            } else if mosi == TOKEN_STOP_TRAN {
                self.stop_trans += 1;
                self.expect_token = None;
                self.out.clear();
                self.out.push_back(0x00);
                self.out.push_back(DUMMY_BYTE);
            }
        }
    }
}

impl SdSpiOps for MockHost {
    fn spi_transfer(&mut self, byte: u8) -> SdSpiResult<u8> {
        if self.busy_forever {
            return Ok(0x00);
        }
        self.feed(byte);
        if self.out.is_empty() && self.streaming && !self.read_blocks.is_empty() {
            self.emit_read_block();
        }
        Ok(self.out.pop_front().unwrap_or(DUMMY_BYTE))
    }

    fn spi_transfer_wide(&mut self, word: u16) -> SdSpiResult<u16> {
        let hi = self.spi_transfer((word >> 8) as u8)?;
        let lo = self.spi_transfer(word as u8)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn spi_set_clock(&mut self, hz: u32) -> SdSpiResult<()> {
        self.clocks.push(hz);
        Ok(())
    }

    fn cs_assert(&mut self) -> SdSpiResult<()> {
        self.cs_low = true;
        self.cs_trace.push(true);
        Ok(())
    }

    fn cs_deassert(&mut self) -> SdSpiResult<()> {
        self.cs_low = false;
        self.cs_trace.push(false);
        Ok(())
    }

    fn cd_level(&mut self) -> bool {
        self.present_level
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delayed_ms += ms;
    }
}

/// Script the full SDHC handshake of a fresh card.
pub fn script_sdhc_init(mock: &mut MockHost) {
    mock.push_r1(CMD_GO_IDLE_STATE, 0x01);
    mock.push_r1(CMD_CRC_ON_OFF, 0x01);
    mock.push_r1(CMD_SEND_IF_COND, 0x01);
    mock.push_trailer(CMD_SEND_IF_COND, 0x0000_01AA);
    mock.push_r1(CMD_READ_OCR, 0x01);
    mock.push_trailer(CMD_READ_OCR, OCR_VOLTAGE_3V2_3V3);
    mock.default_r1(CMD_APP_CMD, 0x01);
    mock.push_r1(ACMD_SD_SEND_OP_COND, 0x01);
    mock.push_r1(ACMD_SD_SEND_OP_COND, 0x01);
    mock.push_r1(ACMD_SD_SEND_OP_COND, 0x00);
    mock.push_r1(CMD_READ_OCR, 0x00);
    mock.push_trailer(CMD_READ_OCR, 0x40FF_8000);
    mock.push_r1(ACMD_SET_CLR_CARD_DETECT, 0x00);
}

/// Script the handshake of a standard-capacity SDv1 card.
pub fn script_sd_init(mock: &mut MockHost) {
    mock.push_r1(CMD_GO_IDLE_STATE, 0x01);
    mock.push_r1(CMD_CRC_ON_OFF, 0x01);
    mock.default_r1(CMD_SEND_IF_COND, 0x05);
    mock.push_r1(CMD_READ_OCR, 0x01);
    mock.push_trailer(CMD_READ_OCR, OCR_VOLTAGE_3V2_3V3);
    mock.default_r1(CMD_APP_CMD, 0x01);
    mock.push_r1(ACMD_SD_SEND_OP_COND, 0x01);
    mock.push_r1(ACMD_SD_SEND_OP_COND, 0x00);
}

fn initialized_host(mock: MockHost, expected: CardType) -> SdSpiHost<MockHost> {
    let mut config = SdConfig::default();
    config.set_hz(25_000_000);
    let mut host = SdSpiHost::new(mock, config);
    let status = host.initialize();
    assert!(!status.contains(DiskStatus::NOINIT));
    assert_eq!(host.card_type(), expected);
    host.ops_mut().seen.clear();
    host.ops_mut().cs_trace.clear();
    host
}

/// A driver holding an initialized SDHC card, ready for block-op tests.
pub fn sdhc_host() -> SdSpiHost<MockHost> {
    let mut mock = MockHost::new();
    script_sdhc_init(&mut mock);
    initialized_host(mock, CardType::Sdhc)
}

/// A driver holding an initialized standard-capacity SD card.
pub fn sd_host() -> SdSpiHost<MockHost> {
    let mut mock = MockHost::new();
    script_sd_init(&mut mock);
    initialized_host(mock, CardType::Sd)
}
