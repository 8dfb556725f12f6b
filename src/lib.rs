//! SD/MMC memory card driver speaking the SPI-mode protocol.
//!
//! The driver owns the wire protocol end to end: card detection, the
//! initialization handshake that classifies the card (SDHC / SD / MMC),
//! CRC7-framed commands with bounded response polling, 512-byte data block
//! transport protected by CRC16, and CSD-based geometry reporting. A
//! filesystem layer consumes it through the [`BlockDevice`] trait; the
//! platform plugs in underneath through the [`SdSpiOps`] trait (an adapter
//! over `embedded-hal` 1.x is provided behind the default `hal` feature).

#![cfg_attr(not(test), no_std)]

pub mod card;
pub mod commands;
pub mod constants;
pub mod core;
pub mod disk;
pub mod host;

pub use crate::card::{CardType, Cid, Csd};
pub use crate::core::{CardDetect, SdConfig, SdSpiHost};
pub use crate::disk::{BlockDevice, DiskError, DiskStatus};
#[cfg(feature = "hal")]
pub use crate::host::hal::HalSpiHost;
pub use crate::host::{DetectMode, SdSpiError, SdSpiOps, SdSpiResult};
