//! Common utilities for tests

use std::fs::{self, File};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;

use filedev::{BlockDevice, Error, Geometry, Result, SECTOR_SIZE};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr) => {
        println!("{}[test] {}{}", crate::common::ORANGE, $msg, crate::common::RESET)
    };
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

/// Scratch path under the target tmp dir, removed on drop.
pub struct Scratch {
    path: PathBuf,
}

impl Scratch {
    pub fn path_for(name: &str) -> Self {
        let path = Path::new(env!("CARGO_TARGET_TMPDIR"))
            .join(format!("{name}-{}", std::process::id()));
        let _ = fs::remove_file(&path);
        Scratch { path }
    }

    /// Zero-filled image of `size` bytes.
    pub fn image(name: &str, size: u64) -> Self {
        let scratch = Scratch::path_for(&format!("{name}.img"));
        File::create(&scratch.path).unwrap().set_len(size).unwrap();
        scratch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Number of descriptors the test process holds.
pub fn open_fds() -> usize {
    let dir = if Path::new("/proc/self/fd").exists() { "/proc/self/fd" } else { "/dev/fd" };
    fs::read_dir(dir).unwrap().count()
}

/// Sends one message over `sock` carrying `fds` in a single SCM_RIGHTS
/// record.
pub fn send_fds(sock: BorrowedFd<'_>, fds: &[RawFd]) {
    let mut payload = *b"x";
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let data_len = mem::size_of_val(fds) as libc::c_uint;
    let space = unsafe { libc::CMSG_SPACE(data_len) } as usize;
    let mut control = vec![0u64; space.div_ceil(8)];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;
        ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), fds.len());
        assert!(libc::sendmsg(sock.as_raw_fd(), &msg, 0) > 0);
    }
}

/// In-memory reference device.
pub struct RamDisk {
    data: Vec<u8>,
    open: bool,
}

impl RamDisk {
    pub fn new(num_sectors: usize) -> Self {
        RamDisk {
            data: vec![0u8; num_sectors * SECTOR_SIZE as usize],
            open: false,
        }
    }

    fn range(&self, buf_len: usize, block_id: u64, block_count: u32) -> Result<std::ops::Range<usize>> {
        let len = block_count as usize * SECTOR_SIZE as usize;
        if buf_len < len {
            return Err(Error::BufferTooSmall);
        }
        let start = block_id as usize * SECTOR_SIZE as usize;
        Ok(start..start + len)
    }
}

impl BlockDevice for RamDisk {
    fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(Error::AlreadyOpen);
        }
        self.open = true;
        Ok(())
    }

    fn bread(&mut self, buf: &mut [u8], block_id: u64, block_count: u32) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        let range = self.range(buf.len(), block_id, block_count)?;
        let len = range.len();
        if len == 0 {
            return Ok(());
        }
        let data = self.data.get(range).ok_or(Error::Read)?;
        buf[..len].copy_from_slice(data);
        Ok(())
    }

    fn bwrite(&mut self, buf: &[u8], block_id: u64, block_count: u32) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        let range = self.range(buf.len(), block_id, block_count)?;
        let len = range.len();
        if len == 0 {
            return Ok(());
        }
        let data = self.data.get_mut(range).ok_or(Error::Write)?;
        data.copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn geometry(&self) -> Option<Geometry> {
        self.open
            .then(|| Geometry::from_size(self.data.len() as u64, SECTOR_SIZE))
    }
}

/// Round-trips distinct patterns through every kind of range a filesystem
/// engine issues, then checks the close policy.
pub fn check_contract<D: BlockDevice>(dev: &mut D) {
    dev.open().unwrap();
    let geometry = dev.geometry().unwrap();
    assert_eq!(
        geometry.sector_count * u64::from(geometry.sector_size),
        geometry.partition_size
    );
    let sector = geometry.sector_size as usize;
    let last = geometry.sector_count - 1;

    for (block_id, block_count) in [(0u64, 1u32), (1, 7), (last, 1), (last - 3, 4)] {
        let src: Vec<u8> = (0..block_count as usize * sector)
            .map(|i| (i as u64 ^ block_id) as u8)
            .collect();
        dev.bwrite(&src, block_id, block_count).unwrap();
        let mut dst = vec![0u8; src.len()];
        dev.bread(&mut dst, block_id, block_count).unwrap();
        assert_eq!(src, dst, "range {block_id}+{block_count}");
    }

    dev.bread(&mut [], 1 << 30, 0).unwrap();
    dev.bwrite(&[], 0, 0).unwrap();

    dev.close().unwrap();
    assert_eq!(dev.geometry(), None);
    let mut buf = vec![0u8; sector];
    assert_eq!(dev.bread(&mut buf, 0, 1), Err(Error::NotOpen));
    assert_eq!(dev.bwrite(&buf, 0, 1), Err(Error::NotOpen));
    dev.close().unwrap();
}
