//! Backend strategies. Both variants own exactly one descriptor and do
//! positioned transfers as seek followed by a full read or write; they
//! differ in what sits between the adapter and the descriptor.

mod raw;
mod stream;

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::path::Path;

use log::{error, trace};

pub use raw::RawDev;
pub use stream::StreamDev;

use crate::geometry::{self, SizeProbe};
use crate::handoff::{Helper, HelperPolicy};
use crate::{Error, Result, SECTOR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Unbuffered descriptor I/O.
    #[default]
    Raw,
    /// Buffered stream I/O. Reads go through a buffer that is discarded on
    /// every seek, writes are issued to the OS immediately.
    Stream,
}

#[derive(Debug)]
pub enum Backend {
    Raw(RawDev),
    Stream(StreamDev),
}

impl Backend {
    /// Acquires exclusive read-write access to `path`. With a helper whose
    /// policy is [`HelperPolicy::Always`] the descriptor always comes from
    /// the helper; with [`HelperPolicy::OnDenied`] only when the direct open
    /// is refused for lack of rights.
    pub fn open(kind: BackendKind, path: &Path, helper: Option<&Helper>) -> Result<Self> {
        let fd = match helper {
            Some(helper) if helper.policy() == HelperPolicy::Always => {
                log::info!("opening {} through {}", path.display(), helper.program().display());
                helper.open(path)?
            }
            _ => Self::open_direct(path, helper)?,
        };
        if let Err(e) = lock_exclusive(fd.as_fd()) {
            error!("{} is in use: {e}", path.display());
            release(fd);
            return Err(Error::Open);
        }
        Ok(Self::from_fd(kind, fd))
    }

    fn open_direct(path: &Path, helper: Option<&Helper>) -> Result<OwnedFd> {
        let fd = match (open_rdwr(path), helper) {
            (Ok(fd), _) => fd,
            (Err(e), Some(helper)) if e.kind() == io::ErrorKind::PermissionDenied => {
                log::info!(
                    "open of {} refused ({e}), asking {}",
                    path.display(),
                    helper.program().display()
                );
                helper.open(path)?
            }
            (Err(e), _) => {
                error!("open of {} failed: {e}", path.display());
                return Err(Error::Open);
            }
        };
        Ok(fd)
    }

    /// Wraps an already opened and locked descriptor.
    pub fn from_fd(kind: BackendKind, fd: OwnedFd) -> Self {
        match kind {
            BackendKind::Raw => Backend::Raw(RawDev::new(fd)),
            BackendKind::Stream => Backend::Stream(StreamDev::new(fd)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Raw(_) => BackendKind::Raw,
            Backend::Stream(_) => BackendKind::Stream,
        }
    }

    /// Total addressable size in bytes.
    pub fn size(&mut self, probe: SizeProbe) -> Result<u64> {
        match probe {
            SizeProbe::Seek => match self {
                Backend::Raw(dev) => dev.size(),
                Backend::Stream(dev) => dev.size(),
            },
            SizeProbe::DeviceQuery => geometry::query_size(self.as_fd()),
        }
    }

    pub fn read(&mut self, block_id: u64, block_count: u32, buf: &mut [u8]) -> Result<()> {
        let (offset, len) = span(block_id, block_count, buf.len())?;
        self.seek(offset)?;
        if len == 0 {
            return Ok(());
        }
        trace!("read {len} bytes at {offset}");
        match self {
            Backend::Raw(dev) => dev.read_exact(&mut buf[..len]),
            Backend::Stream(dev) => dev.read_exact(&mut buf[..len]),
        }
    }

    pub fn write(&mut self, block_id: u64, block_count: u32, buf: &[u8]) -> Result<()> {
        let (offset, len) = span(block_id, block_count, buf.len())?;
        self.seek(offset)?;
        if len == 0 {
            return Ok(());
        }
        trace!("write {len} bytes at {offset}");
        match self {
            Backend::Raw(dev) => dev.write_all(&buf[..len])?,
            Backend::Stream(dev) => dev.write_all(&buf[..len])?,
        }
        drop_cache(self.as_fd());
        Ok(())
    }

    /// Releases the descriptor. A failing close is logged and otherwise
    /// ignored.
    pub fn close(self) {
        let fd = match self {
            Backend::Raw(dev) => dev.into_fd(),
            Backend::Stream(dev) => dev.into_fd(),
        };
        release(fd);
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        match self {
            Backend::Raw(dev) => dev.seek(offset),
            Backend::Stream(dev) => dev.seek(offset),
        }
    }
}

impl AsFd for Backend {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Backend::Raw(dev) => dev.as_fd(),
            Backend::Stream(dev) => dev.as_fd(),
        }
    }
}

/// Byte offset and length of a sector range. The buffer is checked before
/// anything touches the descriptor.
fn span(block_id: u64, block_count: u32, buf_len: usize) -> Result<(u64, usize)> {
    let len = usize::try_from(u64::from(block_count) * u64::from(SECTOR_SIZE))
        .map_err(|_| Error::BufferTooSmall)?;
    if buf_len < len {
        error!("buffer of {buf_len} bytes cannot hold {block_count} sectors");
        return Err(Error::BufferTooSmall);
    }
    let offset = block_id.checked_mul(u64::from(SECTOR_SIZE)).ok_or_else(|| {
        error!("sector {block_id} is beyond the addressable range");
        Error::Seek
    })?;
    Ok((offset, len))
}

fn open_rdwr(path: &Path) -> io::Result<OwnedFd> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Ok(file.into())
}

fn lock_exclusive(fd: BorrowedFd<'_>) -> io::Result<()> {
    if unsafe { libc::flock(fd.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn release(fd: OwnedFd) {
    let raw = fd.into_raw_fd();
    if unsafe { libc::close(raw) } < 0 {
        log::debug!("close of fd {raw} failed: {}", io::Error::last_os_error());
    }
}

#[cfg(all(feature = "drop-cache", any(target_os = "linux", target_os = "android")))]
fn drop_cache(fd: BorrowedFd<'_>) {
    let raw = fd.as_raw_fd();
    unsafe {
        if libc::fdatasync(raw) < 0 {
            log::debug!("fdatasync before cache drop failed: {}", io::Error::last_os_error());
            return;
        }
        let rc = libc::posix_fadvise(raw, 0, 0, libc::POSIX_FADV_DONTNEED);
        if rc != 0 {
            log::debug!("page cache drop failed: {}", io::Error::from_raw_os_error(rc));
        }
    }
}

#[cfg(not(all(feature = "drop-cache", any(target_os = "linux", target_os = "android"))))]
#[inline(always)]
fn drop_cache(_fd: BorrowedFd<'_>) {}
