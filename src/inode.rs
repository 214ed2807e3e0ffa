//! The inode record and its fixed-width binary codec.

use crate::config::Config;
use crate::error::{Error, Result};

/// id of the root directory. Always named `root`, always a directory.
pub const ROOT_ID: u32 = 0;

/// The record for one file or directory.
///
/// Serializes to a fixed-width entry whose layout is pinned by
/// [`Config::index_entry_size`]; see [`Inode::encode`]/[`Inode::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Unique, monotonically assigned id. `0` iff this is the root.
    pub id: u32,
    /// File or directory name, at most `file_name_size` UTF-8 bytes.
    pub name: String,
    /// Index of the first block of this inode's contiguous run.
    pub start_block: u32,
    /// Length of the contiguous run, in blocks. Always `>= 1`.
    pub blocks: u32,
    /// Whether this inode is a directory.
    pub is_directory: bool,
    /// Number of children (`0` for files).
    pub children_count: u32,
    /// Seconds since the Unix epoch, set once at creation.
    pub created_at: u32,
    /// Seconds since the Unix epoch, updated on every index write.
    pub modified_at: u32,
}

impl Inode {
    /// Builds a fresh root directory inode, occupying block 0.
    pub fn root(now: u32) -> Self {
        Self {
            id: ROOT_ID,
            name: "root".to_owned(),
            start_block: 0,
            blocks: 1,
            is_directory: true,
            children_count: 0,
            created_at: now,
            modified_at: now,
        }
    }

    /// Encodes this inode into a buffer of exactly `cfg.index_entry_size`
    /// bytes. Fails with [`Error::NameTooLong`] if the name, encoded as
    /// UTF-8, exceeds `cfg.file_name_size` bytes.
    pub fn encode(&self, cfg: &Config) -> Result<Vec<u8>> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() as u64 > cfg.file_name_size {
            return Err(Error::NameTooLong {
                name: self.name.clone(),
                limit: cfg.file_name_size as usize,
            });
        }

        let w = cfg.max_file_blocks_width;
        let mut buf = Vec::with_capacity(cfg.index_entry_size as usize);

        buf.extend_from_slice(&self.id.to_be_bytes());

        let mut name_field = vec![0u8; cfg.file_name_size as usize];
        name_field[..name_bytes.len()].copy_from_slice(name_bytes);
        buf.extend_from_slice(&name_field);

        push_be(&mut buf, self.blocks, w);
        push_be(&mut buf, self.start_block, w);
        buf.push(if self.is_directory { 0x01 } else { 0x00 });
        push_be(&mut buf, self.children_count, w);
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        buf.extend_from_slice(&self.modified_at.to_be_bytes());

        debug_assert_eq!(buf.len() as u64, cfg.index_entry_size);
        Ok(buf)
    }

    /// Decodes an entry of exactly `cfg.index_entry_size` bytes. Returns
    /// `Ok(None)` for an all-zero entry (a free slot).
    pub fn decode(data: &[u8], cfg: &Config) -> Result<Option<Self>> {
        if data.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let w = cfg.max_file_blocks_width;
        let mut pos = 0usize;

        let id = take_u32(data, &mut pos);

        let name_field = &data[pos..pos + cfg.file_name_size as usize];
        pos += cfg.file_name_size as usize;
        let name_len = name_field
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| Error::Corruption {
                detail: "inode name is not valid UTF-8".to_owned(),
            })?
            .to_owned();

        let blocks = take_be(data, &mut pos, w);
        let start_block = take_be(data, &mut pos, w);
        let is_directory = data[pos] == 0x01;
        pos += 1;
        let children_count = take_be(data, &mut pos, w);
        let created_at = take_u32(data, &mut pos);
        let modified_at = take_u32(data, &mut pos);

        Ok(Some(Self {
            id,
            name,
            start_block,
            blocks,
            is_directory,
            children_count,
            created_at,
            modified_at,
        }))
    }
}

fn push_be(buf: &mut Vec<u8>, value: u32, width: usize) {
    let bytes = value.to_be_bytes();
    buf.extend_from_slice(&bytes[4 - width..]);
}

fn take_be(data: &[u8], pos: &mut usize, width: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes[4 - width..].copy_from_slice(&data[*pos..*pos + width]);
    *pos += width;
    u32::from_be_bytes(bytes)
}

fn take_u32(data: &[u8], pos: &mut usize) -> u32 {
    let v = u32::from_be_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    fn cfg() -> Config {
        Config::from_metadata(&Metadata::new("disk.img", 1024 * 1024, 32, 1024 * 1024 * 80, 32))
    }

    #[test]
    fn decode_encode_roundtrips_modulo_modified_at() {
        let cfg = cfg();
        let inode = Inode {
            id: 42,
            name: "hello.txt".to_owned(),
            start_block: 7,
            blocks: 3,
            is_directory: false,
            children_count: 0,
            created_at: 1000,
            modified_at: 2000,
        };

        let encoded = inode.encode(&cfg).unwrap();
        assert_eq!(encoded.len() as u64, cfg.index_entry_size);

        let decoded = Inode::decode(&encoded, &cfg).unwrap().unwrap();
        assert_eq!(decoded, inode);
    }

    #[test]
    fn all_zero_entry_decodes_to_none() {
        let cfg = cfg();
        let data = vec![0u8; cfg.index_entry_size as usize];
        assert!(Inode::decode(&data, &cfg).unwrap().is_none());
    }

    #[test]
    fn name_too_long_is_rejected_not_truncated() {
        let cfg = cfg();
        let inode = Inode {
            id: 1,
            name: "x".repeat(cfg.file_name_size as usize + 1),
            start_block: 0,
            blocks: 1,
            is_directory: false,
            children_count: 0,
            created_at: 0,
            modified_at: 0,
        };

        let err = inode.encode(&cfg).unwrap_err();
        assert!(matches!(err, Error::NameTooLong { .. }));
    }

    #[test]
    fn root_inode_matches_invariants() {
        let root = Inode::root(123);
        assert_eq!(root.id, ROOT_ID);
        assert_eq!(root.name, "root");
        assert!(root.is_directory);
        assert_eq!(root.start_block, 0);
        assert!(root.blocks >= 1);
    }
}
