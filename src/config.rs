pub const SECTOR_SIZE: u32 = 512;

/// Target opened when `set_target` was never called.
pub const DEFAULT_TARGET: &str = "ext2";

/// Trusted helper used to open device nodes the caller has no rights on.
pub const HELPER_PATH: &str = "/usr/libexec/authopen";
/// Flags passed ahead of the target path: hand the descriptor back over
/// stdout, open with the `open(2)` flags that follow.
pub const HELPER_ARGS: [&str; 2] = ["-stdoutpipe", "-o"];
/// `open(2)` flags the helper is asked to use.
pub const HELPER_OPEN_FLAGS: libc::c_int = libc::O_RDWR;

/// Capacity of the read buffer kept by the stream backend.
pub const STREAM_BUF_SIZE: usize = SECTOR_SIZE as usize * 8;
