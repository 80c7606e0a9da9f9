//! File-backed device
//!
//! Exposes a regular file (or a raw block device node) as a namespace.
//! Commands are executed with positioned I/O when polled, and writes are
//! synced before their completions are delivered.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{NvlogError, Result};

use super::queue_pair::{CompletionOrder, Medium, PolledQueuePair};
use super::{BlockDevice, DeviceError, Geometry, QueuePair};

/// Default transfer limit, in sectors, for file-backed namespaces
const DEFAULT_MAX_SECTORS_PER_IO: u32 = 256;

struct FileMedium {
    file: File,
    sector_size: u64,
}

impl FileMedium {
    fn media_error(lba: u64, e: std::io::Error) -> DeviceError {
        DeviceError::Media {
            lba,
            reason: e.to_string(),
        }
    }
}

impl Medium for FileMedium {
    fn read_at(&self, lba: u64, buf: &mut [u8]) -> std::result::Result<(), DeviceError> {
        self.file
            .read_exact_at(buf, lba * self.sector_size)
            .map_err(|e| Self::media_error(lba, e))
    }

    fn write_at(&self, lba: u64, buf: &[u8]) -> std::result::Result<(), DeviceError> {
        self.file
            .write_all_at(buf, lba * self.sector_size)
            .map_err(|e| Self::media_error(lba, e))
    }

    fn flush(&self) -> std::result::Result<(), DeviceError> {
        self.file
            .sync_data()
            .map_err(|e| Self::media_error(0, e))
    }
}

/// Namespace stored in a file
pub struct FileDevice {
    path: PathBuf,
    geometry: Geometry,
    medium: Arc<FileMedium>,
}

impl FileDevice {
    /// Create (or resize) an image file of `capacity_bytes`
    pub fn create(path: impl AsRef<Path>, sector_size: u32, capacity_bytes: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity_bytes)?;
        Self::from_file(path, file, sector_size)
    }

    /// Open an existing image; its length defines the capacity
    pub fn open(path: impl AsRef<Path>, sector_size: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(path, file, sector_size)
    }

    fn from_file(path: &Path, file: File, sector_size: u32) -> Result<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(NvlogError::Config(format!(
                "Sector size {} must be a power of two",
                sector_size
            )));
        }
        let len = file.metadata()?.len();
        let geometry = Geometry {
            sector_size,
            max_sectors_per_io: DEFAULT_MAX_SECTORS_PER_IO,
            capacity_sectors: len / sector_size as u64,
        };
        tracing::debug!(
            "Opened file device {} ({} sectors of {} bytes)",
            path.display(),
            geometry.capacity_sectors,
            sector_size
        );
        Ok(Self {
            path: path.to_path_buf(),
            geometry,
            medium: Arc::new(FileMedium {
                file,
                sector_size: sector_size as u64,
            }),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn alloc_queue_pair(&self, depth: u32) -> Result<Box<dyn QueuePair>> {
        Ok(Box::new(PolledQueuePair::new(
            Arc::clone(&self.medium),
            self.geometry,
            depth,
            CompletionOrder::Fifo,
        )))
    }
}
