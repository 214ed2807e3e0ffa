//! The metadata sidecar: a tiny text file next to the disk image holding
//! its geometry and the monotonically growing inode id counter.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default block size, in bytes.
pub const DEFAULT_BLOCK_SIZE: u64 = 32;
/// Default size reserved for the inode table, in bytes.
pub const DEFAULT_INDEX_SIZE: u64 = 1024 * 1024 * 2;
/// Default total size of the disk image, in bytes.
pub const DEFAULT_FS_SIZE: u64 = 1024 * 1024 * 80;
/// Default width of the name field, in bytes.
pub const DEFAULT_NAME_SIZE: u64 = 36;

/// The geometry and id-counter state persisted next to a disk image at
/// `<image_path>.dt`.
///
/// The file is a single line of comma-separated decimal fields, in this
/// exact order: `file_system_path, file_index_size, block_size,
/// file_system_size, file_name_size, current_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Path to the backing disk image (not the sidecar itself).
    pub file_system_path: String,
    /// Bytes reserved for the inode table.
    pub file_index_size: u64,
    /// The block size, in bytes.
    pub block_size: u64,
    /// The total size of the disk image, in bytes.
    pub file_system_size: u64,
    /// The width of the name field, in bytes.
    pub file_name_size: u64,
    /// The next inode id to be handed out.
    pub current_id: u32,
}

impl Metadata {
    /// Builds a fresh set of specs for a new image, with `current_id`
    /// starting at 1 (id 0 is reserved for the root directory).
    pub fn new(
        file_system_path: impl Into<String>,
        file_index_size: u64,
        block_size: u64,
        file_system_size: u64,
        file_name_size: u64,
    ) -> Self {
        Self {
            file_system_path: file_system_path.into(),
            file_index_size,
            block_size,
            file_system_size,
            file_name_size,
            current_id: 1,
        }
    }

    /// Returns the path of the sidecar file for the given image path.
    pub fn sidecar_path(image_path: &Path) -> PathBuf {
        let mut s = image_path.as_os_str().to_owned();
        s.push(".dt");
        PathBuf::from(s)
    }

    /// Loads the sidecar next to `image_path`.
    pub fn load(image_path: &Path) -> Result<Self> {
        let sidecar = Self::sidecar_path(image_path);
        let data = fs::read_to_string(&sidecar).map_err(|_| Error::MetadataMissing {
            path: sidecar.clone(),
        })?;

        let fields: Vec<&str> = data.trim().split(',').collect();
        if fields.len() != 6 {
            return Err(Error::Corruption {
                detail: format!("malformed metadata sidecar at {}", sidecar.display()),
            });
        }

        let parse = |s: &str| -> Result<u64> {
            s.parse().map_err(|_| Error::Corruption {
                detail: format!("malformed metadata field `{s}`"),
            })
        };

        Ok(Self {
            file_system_path: fields[0].to_owned(),
            file_index_size: parse(fields[1])?,
            block_size: parse(fields[2])?,
            file_system_size: parse(fields[3])?,
            file_name_size: parse(fields[4])?,
            current_id: parse(fields[5])? as u32,
        })
    }

    /// Writes the sidecar to disk, overwriting it if present.
    pub fn save(&self, image_path: &Path) -> Result<()> {
        let sidecar = Self::sidecar_path(image_path);
        let line = format!(
            "{},{},{},{},{},{}",
            self.file_system_path,
            self.file_index_size,
            self.block_size,
            self.file_system_size,
            self.file_name_size,
            self.current_id,
        );
        fs::write(&sidecar, line)?;
        Ok(())
    }

    /// Allocates and returns the next inode id, persisting the sidecar.
    ///
    /// Mirrors the original's `MetadataManager.increment_id`, which writes
    /// the sidecar back to disk on every allocation rather than batching.
    pub fn allocate_id(&mut self, image_path: &Path) -> Result<u32> {
        let id = self.current_id;
        self.current_id += 1;
        self.save(image_path)?;
        log::trace!("allocated inode id {id}");
        Ok(id)
    }
}
