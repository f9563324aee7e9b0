// vim: tw=80
//! The write/read primitive used to move pattern data to and from volumes

use nix::libc;
use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io,
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::{Path, PathBuf},
};
use tracing::debug;

#[cfg(test)] use mockall::automock;

use crate::types::VolumeId;

/// Synchronous block I/O against the volumes of the storage service.
///
/// Both operations block until the device has acknowledged them.  There is no
/// timeout: if the device hangs, so does the caller.
#[cfg_attr(test, automock)]
pub trait BlockIo: Send + Sync {
    /// Write all of `buf` at `offset`, returning only once the write is
    /// durable from the device's point of view.
    fn write(&self, volume: VolumeId, offset: u64, buf: &[u8])
        -> io::Result<()>;

    /// Read exactly `len` bytes at `offset`.
    fn read(&self, volume: VolumeId, offset: u64, len: usize)
        -> io::Result<Vec<u8>>;
}

/// `BlockIo` for volumes exposed to the host as block devices or files.
#[derive(Clone, Debug, Default)]
pub struct FileBlockIo {
    devices: BTreeMap<VolumeId, PathBuf>,
}

impl FileBlockIo {
    /// Route I/O for `volume` to the device at `path`.
    pub fn attach<P: AsRef<Path>>(&mut self, volume: VolumeId, path: P) {
        self.devices.insert(volume, path.as_ref().to_owned());
    }

    fn path(&self, volume: VolumeId) -> io::Result<&Path> {
        self.devices.get(&volume)
            .map(PathBuf::as_path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound,
                format!("no device attached for volume {volume}")))
    }
}

impl BlockIo for FileBlockIo {
    fn write(&self, volume: VolumeId, offset: u64, buf: &[u8])
        -> io::Result<()>
    {
        let path = self.path(volume)?;
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(path)?;
        file.write_all_at(buf, offset)?;
        file.sync_data()?;
        debug!(volume, offset, len = buf.len(), path = %path.display(),
               "wrote");
        Ok(())
    }

    fn read(&self, volume: VolumeId, offset: u64, len: usize)
        -> io::Result<Vec<u8>>
    {
        let path = self.path(volume)?;
        let file = OpenOptions::new().read(true).open(path)?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}
