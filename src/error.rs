/// Error kinds surfaced to the filesystem engine. OS error codes stop at the
/// adapter boundary and only show up in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("target cannot be opened")]
    Open,
    #[error("device size could not be determined")]
    SizeDiscovery,
    #[error("seek failed")]
    Seek,
    #[error("read failed")]
    Read,
    #[error("write failed")]
    Write,
    #[error("device is not open")]
    NotOpen,
    #[error("device is already open")]
    AlreadyOpen,
    #[error("buffer smaller than the requested sectors")]
    BufferTooSmall,
}

pub type Result<T> = core::result::Result<T, Error>;
