//! Filedev is the block-device adapter a filesystem engine sits on. It
//! exposes a fixed-size-sector open/bread/bwrite/close contract over an
//! image file or a device node and hides how sectors actually get there.
//!
//! Layers (from bottom to top):
//! 1. Backend: owns the descriptor, does seek + full transfer.    Raw descriptor | Buffered stream
//! 2. Handoff: descriptor from a privileged helper over SCM_RIGHTS. Only when the direct open is refused
//! 3. Geometry: sector size/count, established once at open.      Seek | Device query (per platform)
//! 4. FileDev: the adapter implementing [`BlockDevice`].           One instance per device
//!
//! Every operation is blocking and is not retried. Failures surface as the
//! small closed [`Error`] set; OS detail goes to the `log` facade.

mod config;
mod block_dev;
mod error;
mod geometry;
mod backend;
mod handoff;
mod file_dev;

pub use block_dev::BlockDevice;
pub use config::*;
pub use geometry::{Geometry, SizeProbe, query_size, seek_size};
pub use backend::{Backend, BackendKind, RawDev, StreamDev};
pub use handoff::{ChannelFactory, HandoffError, Helper, HelperPolicy, recv_fd};
pub use file_dev::FileDev;
pub use error::Error;
pub use error::Result;
