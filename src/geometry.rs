//! Size and offset facts about a backing store, established once at open.
//!
//! Two ways of finding the size exist. Seeking to the end works for image
//! files and most device nodes; on macOS raw disk nodes report nonsense for
//! that, so the block count and block size are queried with ioctls instead.
//! Which one is used is fixed per platform by [`SizeProbe::PLATFORM`].

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use log::error;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub sector_count: u64,
    /// Always zero, the adapter does no sub-partitioning.
    pub partition_offset: u64,
    /// `sector_count * sector_size`. Trailing bytes short of a full sector
    /// are not addressable.
    pub partition_size: u64,
}

impl Geometry {
    pub fn from_size(size: u64, sector_size: u32) -> Self {
        let sector_count = size / u64::from(sector_size);
        Geometry {
            sector_size,
            sector_count,
            partition_offset: 0,
            partition_size: sector_count * u64::from(sector_size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeProbe {
    /// Position to end-of-handle and read back the offset.
    Seek,
    /// Ask the OS for block count and block size.
    DeviceQuery,
}

impl SizeProbe {
    #[cfg(target_os = "macos")]
    pub const PLATFORM: SizeProbe = SizeProbe::DeviceQuery;
    #[cfg(not(target_os = "macos"))]
    pub const PLATFORM: SizeProbe = SizeProbe::Seek;
}

/// Total size in bytes by seeking to the end of `fd`. Leaves the file
/// position at the end.
pub fn seek_size(fd: BorrowedFd<'_>) -> Result<u64> {
    let end = unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_END) };
    if end < 0 {
        error!("lseek to end failed: {}", io::Error::last_os_error());
        return Err(Error::SizeDiscovery);
    }
    Ok(end as u64)
}

fn ioctl_read<T>(fd: BorrowedFd<'_>, request: u64, name: &str, out: &mut T) -> Result<()> {
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, out as *mut T) };
    if rc < 0 {
        error!("ioctl {name} failed: {}", io::Error::last_os_error());
        return Err(Error::SizeDiscovery);
    }
    Ok(())
}

/// Total size in bytes from the device's block count and block size.
#[cfg(target_os = "macos")]
pub fn query_size(fd: BorrowedFd<'_>) -> Result<u64> {
    // _IOR('d', 25, u64) and _IOR('d', 24, u32) from <sys/disk.h>
    const DKIOCGETBLOCKCOUNT: u64 = 0x4008_6419;
    const DKIOCGETBLOCKSIZE: u64 = 0x4004_6418;

    let mut count: u64 = 0;
    ioctl_read(fd, DKIOCGETBLOCKCOUNT, "DKIOCGETBLOCKCOUNT", &mut count)?;
    let mut block_size: u32 = 0;
    ioctl_read(fd, DKIOCGETBLOCKSIZE, "DKIOCGETBLOCKSIZE", &mut block_size)?;
    count.checked_mul(u64::from(block_size)).ok_or(Error::SizeDiscovery)
}

/// Total size in bytes from the device's logical sector size and capacity.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn query_size(fd: BorrowedFd<'_>) -> Result<u64> {
    // _IO(0x12, 104) and _IOR(0x12, 114, size_t) from <linux/fs.h>
    const BLKSSZGET: u64 = 0x1268;
    const BLKGETSIZE64: u64 = 0x8000_1272 | ((core::mem::size_of::<usize>() as u64) << 16);

    let mut block_size: libc::c_int = 0;
    ioctl_read(fd, BLKSSZGET, "BLKSSZGET", &mut block_size)?;
    let mut bytes: u64 = 0;
    ioctl_read(fd, BLKGETSIZE64, "BLKGETSIZE64", &mut bytes)?;
    let block_size = u64::try_from(block_size)
        .ok()
        .filter(|&b| b > 0)
        .ok_or(Error::SizeDiscovery)?;
    Ok(bytes / block_size * block_size)
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "android")))]
pub fn query_size(_fd: BorrowedFd<'_>) -> Result<u64> {
    error!("device size query is not supported on this platform");
    Err(Error::SizeDiscovery)
}
