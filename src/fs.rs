//! The engine facade: opens a disk image, wires together the bitmap, the
//! index and the transaction manager, and exposes file/directory
//! operations over it.

use crate::bitmap::Bitmap;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{self, IndexManager};
use crate::inode::{self, Inode};
use crate::metadata::{self, Metadata};
use crate::path;
use crate::transaction::Transaction;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Geometry overrides for initializing a fresh image. Fields default to
/// the same values the original tooling shipped with.
#[derive(Debug, Clone, Copy)]
pub struct OpenSpecs {
    pub file_index_size: u64,
    pub block_size: u64,
    pub file_system_size: u64,
    pub file_name_size: u64,
}

impl Default for OpenSpecs {
    fn default() -> Self {
        Self {
            file_index_size: metadata::DEFAULT_INDEX_SIZE,
            block_size: metadata::DEFAULT_BLOCK_SIZE,
            file_system_size: metadata::DEFAULT_FS_SIZE,
            file_name_size: metadata::DEFAULT_NAME_SIZE,
        }
    }
}

/// One open disk image. Binds the backing file handle to its bitmap,
/// index and geometry. Not `Clone`: two handles over the same image file
/// would race each other, and the engine does not protect against that.
pub struct FileSystem {
    image_path: PathBuf,
    image: std::fs::File,
    metadata: Metadata,
    cfg: Config,
    bitmap: Bitmap,
    index: IndexManager,
}

impl FileSystem {
    /// Opens `image_path`. If `specs` is given and no sidecar exists yet,
    /// initializes a fresh image (geometry, zeroed regions, root inode).
    /// Otherwise loads the existing sidecar and index.
    pub fn open(image_path: impl AsRef<Path>, specs: Option<OpenSpecs>) -> Result<Self> {
        let image_path = image_path.as_ref().to_path_buf();

        let (metadata, fresh) = match specs {
            Some(specs) => {
                let meta = Metadata::new(
                    image_path.to_string_lossy().into_owned(),
                    specs.file_index_size,
                    specs.block_size,
                    specs.file_system_size,
                    specs.file_name_size,
                );
                meta.save(&image_path)?;
                (meta, true)
            }
            None => (Metadata::load(&image_path)?, false),
        };

        let cfg = Config::from_metadata(&metadata);

        let mut image = OpenOptions::new()
            .read(true)
            .write(true)
            .create(fresh)
            .open(&image_path)?;
        if fresh {
            image.set_len(cfg.required_image_size())?;
        }

        let bitmap = Bitmap::load(&mut image, cfg.bitmap_size, cfg.num_blocks)?;
        let index = IndexManager::load(&mut image, &cfg)?;

        let mut fs = Self {
            image_path,
            image,
            metadata,
            cfg,
            bitmap,
            index,
        };

        if fresh {
            fs.bitmap.mark(&mut fs.image, 0)?;
            fs.zero_range(0, 1)?;
            let root = Inode::root(index::now_secs());
            fs.index.write(&mut fs.image, &fs.cfg, root)?;
            log::info!("initialized fresh image at {}", fs.image_path.display());
        } else if fs.index.get(inode::ROOT_ID).is_none() {
            return Err(Error::Corruption {
                detail: "root inode missing from index".to_owned(),
            });
        }

        Ok(fs)
    }

    /// Flushes the image and consumes this handle. Prefer this over
    /// letting `Drop` run when the caller wants to observe I/O errors.
    pub fn close(mut self) -> Result<()> {
        self.image.sync_all()?;
        Ok(())
    }

    // ---- path resolution ------------------------------------------------

    /// Resolves `path` to its inode.
    pub fn resolve_path(&mut self, path: &str) -> Result<Inode> {
        let components = path::split_components(path);
        let (_, target) = self.descend(&components)?;
        Ok(target)
    }

    /// Resolves `path` to its `(parent, target)` pair. For root, both are
    /// the root inode.
    pub fn resolve_with_parent(&mut self, path: &str) -> Result<(Inode, Inode)> {
        let components = path::split_components(path);
        self.descend(&components)
    }

    fn descend(&mut self, components: &[String]) -> Result<(Inode, Inode)> {
        let root = self
            .index
            .get(inode::ROOT_ID)
            .cloned()
            .ok_or_else(|| Error::Corruption {
                detail: "root inode missing".to_owned(),
            })?;

        if components.is_empty() {
            return Ok((root.clone(), root));
        }

        let mut parent = root.clone();
        let mut current = root;
        for name in components {
            if !current.is_directory {
                return Err(Error::NotADirectory {
                    path: current.name.clone(),
                });
            }
            match self.find_child(&current, name)? {
                Some(next) => {
                    parent = current;
                    current = next;
                }
                None => {
                    return Err(Error::NotFound {
                        path: name.clone(),
                    })
                }
            }
        }
        Ok((parent, current))
    }

    fn find_child(&mut self, dir: &Inode, name: &str) -> Result<Option<Inode>> {
        for id in self.read_children(dir)? {
            if let Some(candidate) = self.index.get(id) {
                if candidate.name == name {
                    return Ok(Some(candidate.clone()));
                }
            }
        }
        Ok(None)
    }

    pub fn exists(&mut self, path: &str) -> bool {
        self.resolve_path(path).is_ok()
    }

    pub fn is_directory(&mut self, path: &str) -> Result<bool> {
        Ok(self.resolve_path(path)?.is_directory)
    }

    /// Size occupied on disk, in bytes: `blocks * block_size`, not the
    /// trailing-zero-trimmed logical length `read_file` returns.
    pub fn get_file_size(&mut self, path: &str) -> Result<u64> {
        let inode = self.resolve_path(path)?;
        Ok(inode.blocks as u64 * self.cfg.block_size)
    }

    // ---- raw block I/O ---------------------------------------------------

    fn zero_range(&mut self, start: u32, count: u32) -> Result<()> {
        let zeros = vec![0u8; count as usize * self.cfg.block_size as usize];
        self.image.seek(SeekFrom::Start(self.cfg.block_offset(start)))?;
        self.image.write_all(&zeros)?;
        self.image.sync_data()?;
        Ok(())
    }

    fn read_raw_bytes(&mut self, start: u32, blocks: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; blocks as usize * self.cfg.block_size as usize];
        self.image.seek(SeekFrom::Start(self.cfg.block_offset(start)))?;
        self.image.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_padded(&mut self, start: u32, blocks: u32, data: &[u8]) -> Result<()> {
        let total = blocks as usize * self.cfg.block_size as usize;
        let mut buf = vec![0u8; total];
        let n = data.len().min(total);
        buf[..n].copy_from_slice(&data[..n]);
        self.image.seek(SeekFrom::Start(self.cfg.block_offset(start)))?;
        self.image.write_all(&buf)?;
        self.image.sync_data()?;
        Ok(())
    }

    fn read_children(&mut self, dir: &Inode) -> Result<Vec<u32>> {
        let raw = self.read_raw_bytes(dir.start_block, dir.blocks)?;
        let count = dir.children_count as usize;
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let off = i * 4;
            ids.push(u32::from_be_bytes(raw[off..off + 4].try_into().unwrap()));
        }
        Ok(ids)
    }

    fn write_children(&mut self, dir: &Inode, ids: &[u32]) -> Result<()> {
        let mut buf = Vec::with_capacity(ids.len() * 4);
        for id in ids {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        self.image
            .seek(SeekFrom::Start(self.cfg.block_offset(dir.start_block)))?;
        self.image.write_all(&buf)?;
        self.image.sync_data()?;
        Ok(())
    }

    fn read_file_bytes(&mut self, inode: &Inode) -> Result<Vec<u8>> {
        let raw = self.read_raw_bytes(inode.start_block, inode.blocks)?;
        let len = raw.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
        Ok(raw[..len].to_vec())
    }

    // ---- transactional primitives ---------------------------------------
    //
    // These are the `do` halves of the (do, undo) pairs composed by the
    // higher-level operations below. Their inverses are each other:
    // mark_range <-> free_range, add_child <-> remove_child,
    // index.write <-> index.delete (for a brand new id) or index.write of
    // the prior snapshot (for an update to an existing id).

    fn op_mark_range(&mut self, start: u32, count: u32) -> Result<()> {
        self.bitmap.mark_range(&mut self.image, start, count)
    }

    fn op_free_range(&mut self, start: u32, count: u32) -> Result<()> {
        self.bitmap.free_range(&mut self.image, start, count)
    }

    fn op_zero_blocks(&mut self, start: u32, count: u32) -> Result<()> {
        self.zero_range(start, count)
    }

    fn op_index_write(&mut self, inode: Inode) -> Result<()> {
        self.index.write(&mut self.image, &self.cfg, inode)
    }

    fn op_index_delete(&mut self, id: u32) -> Result<()> {
        self.index.delete(&mut self.image, &self.cfg, id)
    }

    fn op_add_child(&mut self, parent_id: u32, child_id: u32) -> Result<()> {
        let mut parent = self
            .index
            .get(parent_id)
            .cloned()
            .ok_or_else(|| Error::Corruption {
                detail: format!("missing parent inode {parent_id}"),
            })?;

        let needed_bytes = 4u64 * (parent.children_count as u64 + 1);
        if needed_bytes > parent.blocks as u64 * self.cfg.block_size {
            let need_blocks = needed_bytes.div_ceil(self.cfg.block_size) as u32;
            let factor = need_blocks.div_ceil(parent.blocks).max(2);
            parent = self.realign(parent, factor)?;
        }

        let mut ids = self.read_children(&parent)?;
        ids.push(child_id);
        self.write_children(&parent, &ids)?;
        parent.children_count = ids.len() as u32;
        self.index.put_cached(parent);

        log::debug!("added child {child_id} to directory {parent_id}");
        Ok(())
    }

    fn op_remove_child(&mut self, parent_id: u32, child_name: String) -> Result<()> {
        let parent = self
            .index
            .get(parent_id)
            .cloned()
            .ok_or_else(|| Error::Corruption {
                detail: format!("missing parent inode {parent_id}"),
            })?;

        let mut ids = self.read_children(&parent)?;
        let pos = ids
            .iter()
            .position(|&id| self.index.get(id).map(|i| i.name.as_str()) == Some(child_name.as_str()))
            .ok_or_else(|| Error::NotFound {
                path: child_name.clone(),
            })?;
        ids.remove(pos);
        self.write_children(&parent, &ids)?;

        let mut updated = parent;
        updated.children_count = ids.len() as u32;
        self.index.put_cached(updated);

        log::debug!("removed `{child_name}` from directory {parent_id}");
        Ok(())
    }

    /// Grows `target`'s block run to `target.blocks * factor` blocks,
    /// relocating its content (file bytes, padded to the new run's full
    /// width, or a directory's packed child-id list). Not itself
    /// transactional: a mid-realign failure is surfaced and leaves only
    /// this one inode's placement inconsistent, never the wider operation.
    fn realign(&mut self, mut target: Inode, factor: u32) -> Result<Inode> {
        let new_blocks = target.blocks * factor;

        if target.is_directory {
            let ids = self.read_children(&target)?;
            self.bitmap
                .free_range(&mut self.image, target.start_block, target.blocks)?;
            let (start, end) = self.bitmap.find_free_run(new_blocks)?;
            target.start_block = start;
            target.blocks = end - start;
            self.bitmap.mark_range(&mut self.image, target.start_block, target.blocks)?;
            self.write_children(&target, &ids)?;
        } else {
            let data = self.read_file_bytes(&target)?;
            self.bitmap
                .free_range(&mut self.image, target.start_block, target.blocks)?;
            let (start, end) = self.bitmap.find_free_run(new_blocks)?;
            target.start_block = start;
            target.blocks = end - start;
            self.bitmap.mark_range(&mut self.image, target.start_block, target.blocks)?;
            self.write_padded(target.start_block, target.blocks, &data)?;
        }

        self.index.put_cached(target.clone());
        log::info!("realigned inode {} to {} block(s)", target.id, target.blocks);
        Ok(target)
    }

    // ---- file operations --------------------------------------------------

    pub fn create_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let (parent_components, name) = path::split_parent(path);
        let name = name.ok_or_else(|| Error::AlreadyExists {
            path: "/".to_owned(),
        })?;
        let (_, parent) = self.descend(&parent_components)?;
        if !parent.is_directory {
            return Err(Error::NotADirectory {
                path: parent.name.clone(),
            });
        }
        if self.find_child(&parent, &name)?.is_some() {
            return Err(Error::AlreadyExists { path: name });
        }

        let n = (data.len() as u64).div_ceil(self.cfg.block_size).max(1) as u32;
        let (start, end) = self.bitmap.find_free_run(n)?;
        let count = end - start;

        let file_data = data.to_vec();
        let id = self.metadata.allocate_id(&self.image_path)?;
        let now = index::now_secs();
        let new_inode = Inode {
            id,
            name: name.clone(),
            start_block: start,
            blocks: count,
            is_directory: false,
            children_count: 0,
            created_at: now,
            modified_at: now,
        };

        let old_parent = parent.clone();
        let mut txn: Transaction<FileSystem> = Transaction::new();

        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_mark_range(start, count)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_free_range(start, count))),
        );
        txn.push(Box::new(move |fs: &mut FileSystem| fs.op_zero_blocks(start, count)), None);
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.write_padded(start, count, &file_data)),
            None,
        );

        let parent_id = parent.id;
        let child_id = id;
        let child_name = name.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_add_child(parent_id, child_id)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_remove_child(parent_id, child_name))),
        );

        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_index_write(new_inode.clone())),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_delete(id))),
        );

        let restore_parent = old_parent.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| {
                let updated = fs.index.get(parent_id).cloned().ok_or_else(|| Error::Corruption {
                    detail: "parent vanished mid-transaction".to_owned(),
                })?;
                fs.op_index_write(updated)
            }),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_parent))),
        );

        txn.commit(self)?;
        log::info!("created file {path} ({count} block(s))");
        Ok(())
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let inode = self.resolve_path(path)?;
        if inode.is_directory {
            return Err(Error::IsADirectory {
                path: path.to_owned(),
            });
        }
        self.read_file_bytes(&inode)
    }

    pub fn edit_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut inode = self.resolve_path(path)?;
        if inode.is_directory {
            return Err(Error::IsADirectory {
                path: path.to_owned(),
            });
        }

        let need = (data.len() as u64).div_ceil(self.cfg.block_size).max(1) as u32;
        if need > inode.blocks {
            let factor = need.div_ceil(inode.blocks).max(2);
            inode = self.realign(inode, factor)?;
        }

        self.write_padded(inode.start_block, inode.blocks, data)?;
        self.index.write(&mut self.image, &self.cfg, inode)?;
        log::info!("edited file {path}");
        Ok(())
    }

    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        let (parent, target) = self.resolve_with_parent(path)?;
        if target.is_directory {
            return Err(Error::IsADirectory {
                path: path.to_owned(),
            });
        }

        let old_parent = parent.clone();
        let mut txn: Transaction<FileSystem> = Transaction::new();

        let (start, count) = (target.start_block, target.blocks);
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_free_range(start, count)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_mark_range(start, count))),
        );

        let parent_id = parent.id;
        let child_id = target.id;
        let child_name = target.name.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_remove_child(parent_id, child_name)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_add_child(parent_id, child_id))),
        );

        let restore_target = target.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_index_delete(child_id)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_target))),
        );

        let restore_parent = old_parent.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| {
                let updated = fs.index.get(parent_id).cloned().ok_or_else(|| Error::Corruption {
                    detail: "parent vanished mid-transaction".to_owned(),
                })?;
                fs.op_index_write(updated)
            }),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_parent))),
        );

        txn.commit(self)?;
        log::info!("deleted file {path}");
        Ok(())
    }

    /// No uniqueness check across the tree; callers above the engine may
    /// add one.
    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<()> {
        let mut inode = self.resolve_path(path)?;
        inode.name = new_name.to_owned();
        self.index.write(&mut self.image, &self.cfg, inode)?;
        log::info!("renamed {path} to {new_name}");
        Ok(())
    }

    pub fn copy_file(&mut self, src: &str, dst: &str) -> Result<()> {
        let data = self.read_file(src)?;
        self.create_file(dst, &data)
    }

    /// The inode, and thus its data blocks, does not move; only parent
    /// membership changes.
    pub fn move_file(&mut self, src: &str, dst_dir: &str) -> Result<()> {
        let (src_parent, target) = self.resolve_with_parent(src)?;
        let dst = self.resolve_path(dst_dir)?;
        if !dst.is_directory {
            return Err(Error::NotADirectory {
                path: dst_dir.to_owned(),
            });
        }
        if self.find_child(&dst, &target.name)?.is_some() {
            return Err(Error::AlreadyExists {
                path: target.name.clone(),
            });
        }

        let old_src_parent = src_parent.clone();
        let old_dst = dst.clone();
        let mut txn: Transaction<FileSystem> = Transaction::new();

        let src_parent_id = src_parent.id;
        let child_id = target.id;
        let child_name = target.name.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_remove_child(src_parent_id, child_name)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_add_child(src_parent_id, child_id))),
        );

        let dst_id = dst.id;
        let child_name_again = target.name.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_add_child(dst_id, child_id)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_remove_child(dst_id, child_name_again))),
        );

        let restore_src_parent = old_src_parent.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| {
                let updated = fs.index.get(src_parent_id).cloned().ok_or_else(|| Error::Corruption {
                    detail: "source parent vanished mid-transaction".to_owned(),
                })?;
                fs.op_index_write(updated)
            }),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_src_parent))),
        );

        let restore_dst = old_dst.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| {
                let updated = fs.index.get(dst_id).cloned().ok_or_else(|| Error::Corruption {
                    detail: "destination directory vanished mid-transaction".to_owned(),
                })?;
                fs.op_index_write(updated)
            }),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_dst))),
        );

        txn.commit(self)?;
        log::info!("moved {src} into {dst_dir}");
        Ok(())
    }

    // ---- directory operations ----------------------------------------

    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let (parent_components, name) = path::split_parent(path);
        let name = name.ok_or_else(|| Error::AlreadyExists {
            path: "/".to_owned(),
        })?;
        let (_, parent) = self.descend(&parent_components)?;
        if !parent.is_directory {
            return Err(Error::NotADirectory {
                path: parent.name.clone(),
            });
        }
        if self.find_child(&parent, &name)?.is_some() {
            return Err(Error::AlreadyExists { path: name });
        }

        let (start, end) = self.bitmap.find_free_run(1)?;
        let count = end - start;
        let id = self.metadata.allocate_id(&self.image_path)?;
        let now = index::now_secs();
        let new_inode = Inode {
            id,
            name: name.clone(),
            start_block: start,
            blocks: count,
            is_directory: true,
            children_count: 0,
            created_at: now,
            modified_at: now,
        };

        let old_parent = parent.clone();
        let mut txn: Transaction<FileSystem> = Transaction::new();

        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_mark_range(start, count)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_free_range(start, count))),
        );
        txn.push(Box::new(move |fs: &mut FileSystem| fs.op_zero_blocks(start, count)), None);

        let parent_id = parent.id;
        let child_id = id;
        let child_name = name.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_add_child(parent_id, child_id)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_remove_child(parent_id, child_name))),
        );

        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_index_write(new_inode.clone())),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_delete(id))),
        );

        let restore_parent = old_parent.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| {
                let updated = fs.index.get(parent_id).cloned().ok_or_else(|| Error::Corruption {
                    detail: "parent vanished mid-transaction".to_owned(),
                })?;
                fs.op_index_write(updated)
            }),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_parent))),
        );

        txn.commit(self)?;
        log::info!("created directory {path}");
        Ok(())
    }

    pub fn list_directory_contents(&mut self, path: &str) -> Result<Vec<String>> {
        let inode = self.resolve_path(path)?;
        if !inode.is_directory {
            return Err(Error::NotADirectory {
                path: path.to_owned(),
            });
        }
        let ids = self.read_children(&inode)?;
        ids.into_iter()
            .map(|id| {
                self.index
                    .get(id)
                    .map(|i| i.name.clone())
                    .ok_or_else(|| Error::Corruption {
                        detail: format!("child id {id} not present in index"),
                    })
            })
            .collect()
    }

    /// Frees descendants before the directory's own range/entry
    /// (post-order), so in-memory child ids stay valid for the whole walk.
    pub fn delete_directory(&mut self, path: &str) -> Result<()> {
        let (parent, target) = self.resolve_with_parent(path)?;
        if !target.is_directory {
            return Err(Error::NotADirectory {
                path: path.to_owned(),
            });
        }
        self.delete_directory_inner(&parent, &target, path)
    }

    fn delete_directory_inner(&mut self, parent: &Inode, target: &Inode, path: &str) -> Result<()> {
        let children = self.read_children(target)?;
        for child_id in children {
            let child = self.index.get(child_id).cloned().ok_or_else(|| Error::Corruption {
                detail: format!("child id {child_id} not present in index"),
            })?;
            let child_path = format!("{}/{}", path.trim_end_matches('/'), child.name);
            if child.is_directory {
                self.delete_directory_inner(target, &child, &child_path)?;
            } else {
                self.delete_file(&child_path)?;
            }
        }

        let old_parent = parent.clone();
        let mut txn: Transaction<FileSystem> = Transaction::new();

        let (start, count) = (target.start_block, target.blocks);
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_free_range(start, count)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_mark_range(start, count))),
        );

        let parent_id = parent.id;
        let child_id = target.id;
        let child_name = target.name.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_remove_child(parent_id, child_name)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_add_child(parent_id, child_id))),
        );

        let restore_target = target.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| fs.op_index_delete(child_id)),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_target))),
        );

        let restore_parent = old_parent.clone();
        txn.push(
            Box::new(move |fs: &mut FileSystem| {
                let updated = fs.index.get(parent_id).cloned().ok_or_else(|| Error::Corruption {
                    detail: "parent vanished mid-transaction".to_owned(),
                })?;
                fs.op_index_write(updated)
            }),
            Some(Box::new(move |fs: &mut FileSystem| fs.op_index_write(restore_parent))),
        );

        txn.commit(self)?;
        Ok(())
    }

    pub fn copy_directory(&mut self, src: &str, dst_path: &str) -> Result<()> {
        let source = self.resolve_path(src)?;
        if !source.is_directory {
            return Err(Error::NotADirectory {
                path: src.to_owned(),
            });
        }
        self.create_directory(dst_path)?;

        for child_id in self.read_children(&source)? {
            let child = self.index.get(child_id).cloned().ok_or_else(|| Error::Corruption {
                detail: format!("child id {child_id} not present in index"),
            })?;
            let child_src = format!("{}/{}", src.trim_end_matches('/'), child.name);
            let child_dst = format!("{}/{}", dst_path.trim_end_matches('/'), child.name);
            if child.is_directory {
                self.copy_directory(&child_src, &child_dst)?;
            } else {
                self.copy_file(&child_src, &child_dst)?;
            }
        }

        log::info!("copied directory {src} to {dst_path}");
        Ok(())
    }

    // ---- whole-image queries --------------------------------------------

    /// Sum of inter-run gaps divided by the highest occupied block plus
    /// one, as a percentage in `[0, 100)`.
    pub fn calculate_fragmentation(&self) -> f64 {
        let mut runs: Vec<(u32, u32)> = self
            .index
            .list_all()
            .map(|i| (i.start_block, i.start_block + i.blocks))
            .collect();
        runs.sort_by_key(|r| r.0);

        let Some(&(_, last_end)) = runs.last() else {
            return 0.0;
        };
        if last_end == 0 {
            return 0.0;
        }

        let mut gap_sum: u64 = 0;
        for pair in runs.windows(2) {
            let (_, end0) = pair[0];
            let (start1, _) = pair[1];
            if start1 > end0 {
                gap_sum += (start1 - end0) as u64;
            }
        }

        (gap_sum as f64 / last_end as f64) * 100.0
    }

    pub fn free_blocks_count(&self) -> u64 {
        self.bitmap.free_blocks_count()
    }

    pub fn list_all_files(&self) -> Vec<Inode> {
        self.index.list_all().cloned().collect()
    }

    /// Compacts every live run toward block 0, in `start_block` order, in
    /// a single synchronous pass. Not transactional: a mid-defrag failure
    /// leaves only the one inode being relocated in an inconsistent state.
    pub fn defragment(&mut self) -> Result<()> {
        let mut inodes: Vec<Inode> = self.index.list_all().cloned().collect();
        inodes.sort_by_key(|i| i.start_block);

        let mut cursor: u32 = 0;
        for inode in inodes {
            let blocks = inode.blocks;
            if inode.start_block != cursor {
                let data = self.read_raw_bytes(inode.start_block, blocks)?;
                self.bitmap.free_range(&mut self.image, inode.start_block, blocks)?;
                self.image.seek(SeekFrom::Start(self.cfg.block_offset(cursor)))?;
                self.image.write_all(&data)?;
                self.image.sync_data()?;
                self.bitmap.mark_range(&mut self.image, cursor, blocks)?;

                let mut moved = inode;
                moved.start_block = cursor;
                self.index.write(&mut self.image, &self.cfg, moved)?;
            }
            cursor += blocks;
        }

        log::info!("defragmented image");
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if let Err(err) = self.image.sync_all() {
            log::error!("failed to sync image on drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_specs() -> OpenSpecs {
        OpenSpecs {
            file_index_size: 1_048_576,
            block_size: 32,
            file_system_size: 83_886_080,
            file_name_size: 32,
        }
    }

    #[test]
    fn fresh_image_has_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        let root = fs.index.get(inode::ROOT_ID).unwrap();
        assert_eq!(root.id, 0);
        assert_eq!(root.start_block, 0);
        assert_eq!(root.blocks, 1);
    }

    #[test]
    fn create_then_read_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_file("/root/a.txt", b"hello").unwrap();
        assert_eq!(fs.read_file("/root/a.txt").unwrap(), b"hello");
        assert_eq!(fs.get_file_size("/root/a.txt").unwrap(), 32);
    }

    #[test]
    fn create_duplicate_name_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_file("/root/a.txt", b"hello").unwrap();
        let err = fs.create_file("/root/a.txt", b"x").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[test]
    fn directories_list_children_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_file("/root/a.txt", b"hello").unwrap();
        fs.create_directory("/root/d").unwrap();
        fs.create_file("/root/d/f", b"data").unwrap();

        assert_eq!(
            fs.list_directory_contents("/root/d").unwrap(),
            vec!["f".to_owned()]
        );
        assert_eq!(
            fs.list_directory_contents("/root").unwrap(),
            vec!["a.txt".to_owned(), "d".to_owned()]
        );
    }

    #[test]
    fn delete_frees_block_for_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_file("/root/a.txt", b"hello").unwrap();
        fs.delete_file("/root/a.txt").unwrap();

        let err = fs.read_file("/root/a.txt").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let (start, _) = fs.bitmap.find_free_run(1).unwrap();
        assert_eq!(start, 1);
    }

    #[test]
    fn edit_triggers_realignment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_file("/root/big", &[0u8; 64]).unwrap();
        assert_eq!(fs.resolve_path("/root/big").unwrap().blocks, 2);

        fs.edit_file("/root/big", &[1u8; 256]).unwrap();
        let after = fs.resolve_path("/root/big").unwrap();
        assert!(after.blocks >= 8);
        assert_eq!(fs.read_file("/root/big").unwrap(), vec![1u8; 256]);
    }

    #[test]
    fn move_file_changes_parent_membership_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_directory("/root/a").unwrap();
        fs.create_directory("/root/b").unwrap();
        fs.create_file("/root/a/f.txt", b"data").unwrap();

        fs.move_file("/root/a/f.txt", "/root/b").unwrap();

        assert!(fs.list_directory_contents("/root/a").unwrap().is_empty());
        assert_eq!(
            fs.list_directory_contents("/root/b").unwrap(),
            vec!["f.txt".to_owned()]
        );
        assert_eq!(fs.read_file("/root/b/f.txt").unwrap(), b"data");
    }

    #[test]
    fn delete_directory_removes_whole_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_directory("/root/a").unwrap();
        fs.create_file("/root/a/f.txt", b"data").unwrap();
        fs.create_directory("/root/a/b").unwrap();
        fs.create_file("/root/a/b/g.txt", b"more").unwrap();

        fs.delete_directory("/root/a").unwrap();

        assert!(matches!(
            fs.resolve_path("/root/a").unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(fs.list_directory_contents("/root").unwrap().is_empty());
    }

    #[test]
    fn failed_create_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let specs = OpenSpecs {
            file_index_size: 4096,
            block_size: 32,
            file_system_size: 64,
            file_name_size: 16,
        };
        let mut fs = FileSystem::open(&path, Some(specs)).unwrap();

        let free_before = fs.free_blocks_count();
        let err = fs.create_file("/root/a.txt", &[0u8; 128]).unwrap_err();
        assert!(matches!(err, Error::OutOfSpace { .. }));
        assert_eq!(fs.free_blocks_count(), free_before);
        assert!(fs.list_directory_contents("/root").unwrap().is_empty());
    }

    #[test]
    fn defragment_compacts_without_losing_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut fs = FileSystem::open(&path, Some(scenario_specs())).unwrap();

        fs.create_file("/root/a.txt", b"hello").unwrap();
        fs.create_file("/root/b.txt", b"world").unwrap();
        fs.delete_file("/root/a.txt").unwrap();
        fs.create_file("/root/c.txt", &[7u8; 96]).unwrap();

        let frag_before = fs.calculate_fragmentation();
        fs.defragment().unwrap();
        let frag_after = fs.calculate_fragmentation();

        assert!(frag_after <= frag_before);
        assert_eq!(fs.read_file("/root/b.txt").unwrap(), b"world");
        assert_eq!(fs.read_file("/root/c.txt").unwrap(), vec![7u8; 96]);
    }
}
