use crate::{Geometry, Result};

/// The contract a filesystem engine drives all persistent I/O through.
pub trait BlockDevice {
    /// Acquires the backing store and establishes its geometry.
    fn open(&mut self) -> Result<()>;

    /// Reads `block_count` sectors starting at `block_id` into `buf`.
    /// `buf.len()` must be at least `block_count * sector_size`.
    fn bread(&mut self, buf: &mut [u8], block_id: u64, block_count: u32) -> Result<()>;

    /// Writes `block_count` sectors starting at `block_id` from `buf`.
    fn bwrite(&mut self, buf: &[u8], block_id: u64, block_count: u32) -> Result<()>;

    /// Releases the backing store. Never fails.
    fn close(&mut self) -> Result<()>;

    /// Geometry established by the last successful `open`, `None` when closed.
    fn geometry(&self) -> Option<Geometry>;

    fn sector_size(&self) -> u32 {
        crate::config::SECTOR_SIZE
    }
}
