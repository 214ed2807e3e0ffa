//! The index manager: the fixed-size inode table and its in-memory
//! `id -> inode` / `id -> slot` caches.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::inode::Inode;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as seconds since the Unix epoch, truncated to
/// `u32` (the on-disk timestamp width).
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as u32
}

/// Owns the on-disk inode table and its in-memory caches.
pub struct IndexManager {
    by_id: HashMap<u32, Inode>,
    slot_of: HashMap<u32, u64>,
}

impl IndexManager {
    /// Scans every slot of the index table; non-zero entries are decoded
    /// and cached.
    pub fn load(image: &mut File, cfg: &Config) -> Result<Self> {
        let mut by_id = HashMap::new();
        let mut slot_of = HashMap::new();

        let mut buf = vec![0u8; cfg.index_entry_size as usize];
        for slot in 0..cfg.max_index_entries {
            image.seek(SeekFrom::Start(cfg.index_slot_offset(slot)))?;
            image.read_exact(&mut buf)?;

            if let Some(inode) = Inode::decode(&buf, cfg)? {
                slot_of.insert(inode.id, slot);
                by_id.insert(inode.id, inode);
            }
        }

        Ok(Self { by_id, slot_of })
    }

    /// Looks up a live inode by id.
    pub fn get(&self, id: u32) -> Option<&Inode> {
        self.by_id.get(&id)
    }

    /// Finds the first live inode with the given name. Used only to
    /// discover the root directory on first open.
    pub fn find_by_name(&self, name: &str) -> Option<&Inode> {
        self.by_id.values().find(|i| i.name == name)
    }

    /// Returns every live inode.
    pub fn list_all(&self) -> impl Iterator<Item = &Inode> {
        self.by_id.values()
    }

    /// Writes an inode. If its id is already known, its existing slot is
    /// overwritten; otherwise the first all-zero slot is claimed. Sets
    /// `modified_at` before encoding. Fails with [`Error::NoIndexSpace`]
    /// if the table is full.
    pub fn write(&mut self, image: &mut File, cfg: &Config, mut inode: Inode) -> Result<()> {
        inode.modified_at = now_secs();

        let slot = match self.slot_of.get(&inode.id) {
            Some(&slot) => slot,
            None => self.find_free_slot(image, cfg)?,
        };

        let encoded = inode.encode(cfg)?;
        image.seek(SeekFrom::Start(cfg.index_slot_offset(slot)))?;
        image.write_all(&encoded)?;
        image.sync_data()?;

        log::debug!("wrote inode {} (`{}`) to slot {slot}", inode.id, inode.name);
        self.slot_of.insert(inode.id, slot);
        self.by_id.insert(inode.id, inode);
        Ok(())
    }

    /// Overwrites the cached entry for `inode.id` without touching disk or
    /// `slot_of`. Used by directory child-list helpers that mutate a
    /// parent's `children_count`/`start_block`/`blocks` in memory; the
    /// change reaches disk the next time the caller composes an explicit
    /// `write` for that id.
    pub fn put_cached(&mut self, inode: Inode) {
        self.by_id.insert(inode.id, inode);
    }

    fn find_free_slot(&self, image: &mut File, cfg: &Config) -> Result<u64> {
        let mut buf = vec![0u8; cfg.index_entry_size as usize];
        for slot in 0..cfg.max_index_entries {
            if self.slot_of.values().any(|&s| s == slot) {
                continue;
            }
            image.seek(SeekFrom::Start(cfg.index_slot_offset(slot)))?;
            image.read_exact(&mut buf)?;
            if buf.iter().all(|&b| b == 0) {
                return Ok(slot);
            }
        }
        Err(Error::NoIndexSpace)
    }

    /// Zeroes an inode's slot and removes it from both maps. Idempotent
    /// if the id is not present.
    pub fn delete(&mut self, image: &mut File, cfg: &Config, id: u32) -> Result<()> {
        let Some(slot) = self.slot_of.remove(&id) else {
            return Ok(());
        };
        self.by_id.remove(&id);

        let zeros = vec![0u8; cfg.index_entry_size as usize];
        image.seek(SeekFrom::Start(cfg.index_slot_offset(slot)))?;
        image.write_all(&zeros)?;
        image.sync_data()?;

        log::debug!("deleted inode {id} from slot {slot}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use std::fs::OpenOptions;

    fn image_and_cfg() -> (tempfile::TempDir, File, Config) {
        let meta = Metadata::new("disk.img", 1024 * 64, 32, 1024 * 1024, 16);
        let cfg = Config::from_metadata(&meta);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(cfg.required_image_size()).unwrap();
        (dir, file, cfg)
    }

    #[test]
    fn write_then_load_roundtrips() {
        let (_dir, mut image, cfg) = image_and_cfg();
        let mut idx = IndexManager::load(&mut image, &cfg).unwrap();

        let inode = Inode::root(now_secs());
        idx.write(&mut image, &cfg, inode.clone()).unwrap();

        let reloaded = IndexManager::load(&mut image, &cfg).unwrap();
        assert_eq!(reloaded.get(0).unwrap().name, "root");
        let _ = inode;
    }

    #[test]
    fn write_reuses_existing_slot_on_update() {
        let (_dir, mut image, cfg) = image_and_cfg();
        let mut idx = IndexManager::load(&mut image, &cfg).unwrap();

        let mut inode = Inode::root(now_secs());
        idx.write(&mut image, &cfg, inode.clone()).unwrap();
        let slot_before = idx.slot_of[&0];

        inode.name = "root".to_owned();
        inode.children_count = 1;
        idx.write(&mut image, &cfg, inode).unwrap();

        assert_eq!(idx.slot_of[&0], slot_before);
        assert_eq!(idx.get(0).unwrap().children_count, 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, mut image, cfg) = image_and_cfg();
        let mut idx = IndexManager::load(&mut image, &cfg).unwrap();
        idx.delete(&mut image, &cfg, 999).unwrap();
        idx.delete(&mut image, &cfg, 999).unwrap();
    }

    #[test]
    fn no_index_space_when_full() {
        let meta = Metadata::new("disk.img", 96, 32, 1024 * 1024, 16);
        let cfg = Config::from_metadata(&meta);
        assert!(cfg.max_index_entries >= 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(cfg.required_image_size()).unwrap();
        let mut image = file;

        let mut idx = IndexManager::load(&mut image, &cfg).unwrap();
        for i in 0..cfg.max_index_entries {
            let mut inode = Inode::root(now_secs());
            inode.id = i as u32;
            idx.write(&mut image, &cfg, inode).unwrap();
        }

        let mut overflow = Inode::root(now_secs());
        overflow.id = cfg.max_index_entries as u32;
        let err = idx.write(&mut image, &cfg, overflow).unwrap_err();
        assert!(matches!(err, Error::NoIndexSpace));
    }
}
