use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::backend::{Backend, BackendKind};
use crate::geometry::SizeProbe;
use crate::handoff::Helper;
use crate::{BlockDevice, DEFAULT_TARGET, Error, Geometry, Result, SECTOR_SIZE};

/// Block device backed by an image file or a device node.
///
/// Each instance owns its target and, while open, exactly one descriptor.
/// After `close`, `bread`/`bwrite` return [`Error::NotOpen`] and a further
/// `close` does nothing. Dropping an open device closes it.
#[derive(Debug)]
pub struct FileDev {
    target: PathBuf,
    kind: BackendKind,
    helper: Option<Helper>,
    opened: Option<Opened>,
}

#[derive(Debug)]
struct Opened {
    backend: Backend,
    geometry: Geometry,
}

impl FileDev {
    pub fn new(kind: BackendKind) -> Self {
        FileDev {
            target: PathBuf::from(DEFAULT_TARGET),
            kind,
            helper: Helper::platform(),
            opened: None,
        }
    }

    /// Falls back to `helper` when the target cannot be opened directly for
    /// lack of rights.
    pub fn with_helper(mut self, helper: Helper) -> Self {
        self.helper = Some(helper);
        self
    }

    pub fn without_helper(mut self) -> Self {
        self.helper = None;
        self
    }

    /// Sets the path opened by the next `open`. Refused while open.
    pub fn set_target(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.opened.is_some() {
            warn!("target change to {} refused while open", path.as_ref().display());
            return Err(Error::AlreadyOpen);
        }
        self.target = path.as_ref().to_path_buf();
        Ok(())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        self.opened.is_some()
    }

    fn backend(&mut self, op: &str) -> Result<&mut Backend> {
        match self.opened.as_mut() {
            Some(opened) => Ok(&mut opened.backend),
            None => {
                warn!("{op} on closed device {}", self.target.display());
                Err(Error::NotOpen)
            }
        }
    }
}

impl Default for FileDev {
    fn default() -> Self {
        FileDev::new(BackendKind::default())
    }
}

impl BlockDevice for FileDev {
    fn open(&mut self) -> Result<()> {
        if self.opened.is_some() {
            warn!("{} is already open", self.target.display());
            return Err(Error::AlreadyOpen);
        }
        let mut backend = Backend::open(self.kind, &self.target, self.helper.as_ref())?;
        let size = match backend.size(SizeProbe::PLATFORM) {
            Ok(size) => size,
            Err(e) => {
                backend.close();
                return Err(e);
            }
        };
        let geometry = Geometry::from_size(size, SECTOR_SIZE);
        debug!(
            "opened {} ({:?}): {} sectors of {} bytes",
            self.target.display(),
            self.kind,
            geometry.sector_count,
            geometry.sector_size
        );
        self.opened = Some(Opened { backend, geometry });
        Ok(())
    }

    fn bread(&mut self, buf: &mut [u8], block_id: u64, block_count: u32) -> Result<()> {
        self.backend("bread")?.read(block_id, block_count, buf)
    }

    fn bwrite(&mut self, buf: &[u8], block_id: u64, block_count: u32) -> Result<()> {
        self.backend("bwrite")?.write(block_id, block_count, buf)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(opened) = self.opened.take() {
            opened.backend.close();
            debug!("closed {}", self.target.display());
        }
        Ok(())
    }

    fn geometry(&self) -> Option<Geometry> {
        self.opened.as_ref().map(|opened| opened.geometry)
    }
}

impl Drop for FileDev {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
