//! Privileged open through a trusted helper.
//!
//! Some device nodes can only be opened by a privileged path. Rather than
//! running with elevated rights, the adapter spawns a helper, lets it do the
//! authorization and the `open`, and receives the resulting descriptor over
//! a socket as `SCM_RIGHTS` ancillary data. Only the capability crosses the
//! channel, never device contents.
//!
//! One hand-off goes through these stages:
//! 1. create a connected socket pair,
//! 2. spawn the helper with one end as its stdout,
//! 3. close our copy of that end and block for one message,
//! 4. validate the ancillary record and extract the descriptor.
//!
//! The channel lives for exactly one hand-off. The helper is not waited on
//! by `open`: once the descriptor is in hand it is given to a reaper thread,
//! and on any failure after the spawn it is killed and reaped before
//! returning.

use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::ptr;
use std::thread;

use log::{debug, warn};

use crate::Error;
use crate::config::{HELPER_ARGS, HELPER_OPEN_FLAGS, HELPER_PATH};

/// Creates the two connected endpoints of a helper channel.
pub type ChannelFactory = fn() -> io::Result<(UnixStream, UnixStream)>;

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("cannot create helper channel: {0}")]
    Channel(#[source] io::Error),
    #[error("cannot spawn helper: {0}")]
    Spawn(#[source] io::Error),
    #[error("receive from helper failed: {0}")]
    Io(#[source] io::Error),
    #[error("helper closed the channel without handing off a descriptor")]
    HelperClosed,
    #[error("helper broke the hand-off contract: {0}")]
    Protocol(&'static str),
}

impl From<HandoffError> for Error {
    fn from(e: HandoffError) -> Self {
        warn!("privileged open failed: {e}");
        Error::Open
    }
}

/// When the adapter turns to the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelperPolicy {
    /// Only after a direct open was refused for lack of rights.
    #[default]
    OnDenied,
    /// Always, for targets known to require elevation.
    Always,
}

#[derive(Debug, Clone)]
pub struct Helper {
    program: PathBuf,
    args: Vec<OsString>,
    channel: ChannelFactory,
    policy: HelperPolicy,
}

impl Helper {
    /// The platform's authorization helper at its fixed location.
    pub fn system() -> Self {
        Helper {
            program: PathBuf::from(HELPER_PATH),
            args: HELPER_ARGS
                .iter()
                .map(OsString::from)
                .chain([OsString::from(HELPER_OPEN_FLAGS.to_string())])
                .collect(),
            channel: UnixStream::pair,
            policy: HelperPolicy::OnDenied,
        }
    }

    /// Helper enabled by default on this platform.
    pub fn platform() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Helper::system())
        } else {
            None
        }
    }

    /// Helper at `program`, invoked with the standard flags.
    ///
    /// This overrides the fixed [`HELPER_PATH`]. It exists for tests and for
    /// platforms whose authorization helper lives elsewhere; production code
    /// on macOS should use [`Helper::system`].
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Helper {
            program: program.into(),
            ..Helper::system()
        }
    }

    /// Replaces the arguments placed ahead of the target path. Like
    /// [`Helper::new`], meant for tests and non-standard helpers.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_channel(mut self, channel: ChannelFactory) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_policy(mut self, policy: HelperPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> HelperPolicy {
        self.policy
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Runs one hand-off for `path` and returns the descriptor the helper
    /// opened.
    pub fn open(&self, path: &Path) -> Result<OwnedFd, HandoffError> {
        let (ours, theirs) = (self.channel)().map_err(HandoffError::Channel)?;
        let mut child = self.spawn(theirs, path)?;

        match recv_fd(&ours) {
            Ok(fd) => {
                debug!("helper {} handed off fd {}", child.id(), fd.as_raw_fd());
                detach(child);
                Ok(fd)
            }
            Err(e) => {
                // Already exited is fine, the wait below reaps it either way.
                let _ = child.kill();
                if let Err(e) = child.wait() {
                    warn!("cannot reap helper {}: {e}", child.id());
                }
                Err(e)
            }
        }
    }

    fn spawn(&self, endpoint: UnixStream, path: &Path) -> Result<Child, HandoffError> {
        // The Command, and with it our copy of `endpoint`, is dropped at the
        // end of this statement so the helper holds the only one.
        Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdout(Stdio::from(OwnedFd::from(endpoint)))
            .spawn()
            .map_err(HandoffError::Spawn)
    }
}

fn detach(mut child: Child) {
    match child.try_wait() {
        Ok(Some(status)) => debug!("helper {} exited: {status}", child.id()),
        _ => {
            let pid = child.id();
            let reaper = thread::Builder::new()
                .name("helper-reaper".into())
                .spawn(move || match child.wait() {
                    Ok(status) => debug!("helper {pid} exited: {status}"),
                    Err(e) => warn!("cannot reap helper {pid}: {e}"),
                });
            if let Err(e) = reaper {
                warn!("cannot start reaper for helper {pid}: {e}");
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Receives exactly one descriptor from `channel`.
///
/// The message must carry a single `SOL_SOCKET`/`SCM_RIGHTS` record with a
/// single descriptor and no truncated control data. Anything else is a
/// [`HandoffError::Protocol`]; descriptors that arrived alongside a
/// violation are closed.
pub fn recv_fd(channel: &UnixStream) -> Result<OwnedFd, HandoffError> {
    let mut payload = [0u8; 16];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    // Room for one extra descriptor so over-delivery is seen rather than
    // truncated away.
    let space = unsafe { libc::CMSG_SPACE(2 * mem::size_of::<RawFd>() as libc::c_uint) } as usize;
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let n = loop {
        let n = unsafe { libc::recvmsg(channel.as_raw_fd(), &mut msg, RECV_FLAGS) };
        if n >= 0 {
            break n;
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(HandoffError::Io(e));
        }
    };
    if n == 0 {
        return Err(HandoffError::HelperClosed);
    }

    let (mut fds, foreign) = unsafe { take_records(&msg) };
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(HandoffError::Protocol("ancillary data truncated"));
    }
    if foreign {
        return Err(HandoffError::Protocol("unexpected ancillary record"));
    }
    let fd = match (fds.pop(), fds.is_empty()) {
        (Some(fd), true) => fd,
        (Some(_), false) => return Err(HandoffError::Protocol("more than one descriptor passed")),
        (None, _) => return Err(HandoffError::Protocol("no descriptor passed")),
    };
    set_cloexec(&fd)?;
    Ok(fd)
}

/// Takes ownership of every descriptor carried in `SCM_RIGHTS` records and
/// reports whether any other kind of record was present.
///
/// # Safety
/// `msg` must have been filled in by a successful `recvmsg`.
unsafe fn take_records(msg: &libc::msghdr) -> (Vec<OwnedFd>, bool) {
    let mut fds = Vec::new();
    let mut foreign = false;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let len = (hdr.cmsg_len as usize).saturating_sub(libc::CMSG_LEN(0) as usize);
                for i in 0..len / mem::size_of::<RawFd>() {
                    let raw = ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            } else {
                foreign = true;
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    (fds, foreign)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_cloexec(_fd: &OwnedFd) -> Result<(), HandoffError> {
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: &OwnedFd) -> Result<(), HandoffError> {
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(HandoffError::Io(io::Error::last_os_error()));
    }
    Ok(())
}
