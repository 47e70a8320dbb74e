use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use log::error;

use crate::config::STREAM_BUF_SIZE;
use crate::{Error, Result};

/// Buffered stream I/O.
///
/// Only reads are buffered. Every transfer starts with a seek, which
/// discards whatever the buffer holds, and writes bypass it so they reach
/// the OS before `write_all` returns.
#[derive(Debug)]
pub struct StreamDev {
    inner: BufReader<File>,
}

impl StreamDev {
    pub fn new(fd: OwnedFd) -> Self {
        StreamDev {
            inner: BufReader::with_capacity(STREAM_BUF_SIZE, File::from(fd)),
        }
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset)).map_err(|e| {
            error!("stream seek to {offset} failed: {e}");
            Error::Seek
        })?;
        Ok(())
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            match e.kind() {
                io::ErrorKind::UnexpectedEof => error!("stream read failed: short read at end of device"),
                _ => error!("stream read failed: {e}"),
            }
            Error::Read
        })
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        debug_assert!(self.inner.buffer().is_empty());
        self.inner.get_mut().write_all(buf).map_err(|e| {
            error!("stream write failed: {e}");
            Error::Write
        })
    }

    pub fn size(&mut self) -> Result<u64> {
        self.inner.seek(SeekFrom::End(0)).map_err(|e| {
            error!("stream seek to end failed: {e}");
            Error::SizeDiscovery
        })
    }

    pub fn into_fd(self) -> OwnedFd {
        self.inner.into_inner().into()
    }
}

impl AsFd for StreamDev {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.get_ref().as_fd()
    }
}
