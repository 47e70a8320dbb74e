use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use log::error;

use crate::{Error, Result, geometry};

/// Direct descriptor I/O. Nothing is buffered in user space.
#[derive(Debug)]
pub struct RawDev {
    fd: OwnedFd,
}

impl RawDev {
    pub fn new(fd: OwnedFd) -> Self {
        #[cfg(target_os = "macos")]
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_NOCACHE, 1) } < 0 {
            log::debug!("F_NOCACHE failed: {}", io::Error::last_os_error());
        }
        RawDev { fd }
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        let offset = libc::off_t::try_from(offset).map_err(|_| {
            error!("lseek to {offset} failed: offset out of range");
            Error::Seek
        })?;
        if unsafe { libc::lseek(self.fd.as_raw_fd(), offset, libc::SEEK_SET) } < 0 {
            error!("lseek to {offset} failed: {}", io::Error::last_os_error());
            return Err(Error::Seek);
        }
        Ok(())
    }

    /// Fills `buf` completely. Running into end-of-device is a read error.
    pub fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            match n {
                0 => {
                    error!("read failed: {} bytes short at end of device", buf.len());
                    return Err(Error::Read);
                }
                n if n < 0 => {
                    let e = io::Error::last_os_error();
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("read failed: {e}");
                    return Err(Error::Read);
                }
                n => buf = &mut buf[n as usize..],
            }
        }
        Ok(())
    }

    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
            match n {
                0 => {
                    error!("write failed: device accepted no more data");
                    return Err(Error::Write);
                }
                n if n < 0 => {
                    let e = io::Error::last_os_error();
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!("write failed: {e}");
                    return Err(Error::Write);
                }
                n => buf = &buf[n as usize..],
            }
        }
        Ok(())
    }

    pub fn size(&mut self) -> Result<u64> {
        geometry::seek_size(self.fd.as_fd())
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for RawDev {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
