//! The filesystem-facing surface: status word, result codes, and the
//! block-device trait a filesystem layer consumes.

use bitflags::bitflags;

use crate::host::SdSpiError;

bitflags! {
    /// Media status word, shared with the card-detect interrupt handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        /// Medium has not been initialized.
        const NOINIT = 0x01;
        /// No medium in the socket. Implies NOINIT.
        const NODISK = 0x02;
        /// Medium is write protected. Set only by external means.
        const PROTECT = 0x04;
    }
}

/// Result codes a filesystem layer sees; diagnostic detail stays internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// The medium is missing or not initialized.
    NotReady,
    /// The medium is write protected.
    WriteProtected,
    /// The operation failed.
    Failed,
}

impl From<SdSpiError> for DiskError {
    fn from(err: SdSpiError) -> Self {
        match err {
            SdSpiError::NotReady => DiskError::NotReady,
            SdSpiError::WriteProtected => DiskError::WriteProtected,
            _ => DiskError::Failed,
        }
    }
}

/// A sector-addressed storage medium.
///
/// All transfers are in whole 512-byte sectors; `lba` is the index of the
/// first sector and `count` the number of consecutive sectors.
pub trait BlockDevice {
    /// Initialize the medium if present and uninitialized. Idempotent.
    fn initialize(&mut self) -> DiskStatus;

    /// Refresh card presence and report the status word.
    fn status(&mut self) -> DiskStatus;

    /// Read `count` sectors starting at `lba` into `buffer`.
    fn read(&mut self, buffer: &mut [u8], lba: u64, count: usize) -> Result<(), DiskError>;

    /// Write `count` sectors starting at `lba` from `buffer`.
    fn write(&mut self, buffer: &[u8], lba: u64, count: usize) -> Result<(), DiskError>;

    /// Block until any internal write processing has completed.
    fn sync(&mut self) -> Result<(), DiskError>;

    /// Total sector count of the medium, or 0 if it cannot be determined.
    fn sectors(&mut self) -> u64;
}
