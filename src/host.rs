//! Host Bridge: the contract the directory core needs from everything
//! around it — inode metadata, chunked page I/O, locking, versioning,
//! and error reporting (spec.md §4.4).
//!
//! Two implementations live here: `MemHost`, a flat in-memory host used
//! by this crate's own tests (directory semantics only, no real block
//! allocation), and `DiskHost`, the production adapter backed by
//! `disk_driver::DiskDriver` plus a minimal inode/block bitmap
//! allocator — enough to exercise the directory core end to end without
//! being a complete ext2 driver (see SPEC_FULL.md §1, §4.4).

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use disk_driver::{DiskDriver, SeekType};
use log::error;

use crate::desc::{Ext2GroupDesc, Ext2Inode, Ext2SuperBlock, EXT2_GOOD_OLD_FIRST_INO, EXT2_ROOT_INO};
use crate::error::{DirError, DirResult};

/// Everything the directory core needs from its surroundings. All
/// methods are keyed by inode number; the caller (FUSE frontend or
/// tests) is responsible for the per-inode lock spec.md §5 assigns to
/// it — nothing here takes one internally.
pub trait Host {
    /// Chunk size for directory files on this host — the filesystem
    /// block size (spec.md §3 "Chunk").
    fn chunk_size(&self) -> u32;

    /// Highest valid inode number; `inode == max_inode_number()` is
    /// valid, only `inode > max_inode_number()` is rejected (matches
    /// `fs/amnfs/dir.c`'s `le32_to_cpu(p->inode) > max_inumber`).
    fn max_inode_number(&self) -> u32;

    /// Whether directory entries carry a `file_type` tag.
    fn filetype_enabled(&self) -> bool;

    fn i_size(&self, ino: u32) -> DirResult<u64>;
    fn set_i_size(&self, ino: u32, size: u64) -> DirResult<()>;

    /// `i_blocks` in 512-byte sector units, used by `find_entry`'s
    /// "next page is past the blocks we've got" sanity guard.
    fn i_blocks(&self, ino: u32) -> DirResult<u64>;

    /// Monotonic per-inode version, bumped on every chunk commit;
    /// readdir cursors compare against this to decide whether to
    /// revalidate their resume offset (spec.md §4.2 "Re-entry validation").
    fn version(&self, ino: u32) -> DirResult<u64>;

    /// Lookup hint: the page index `find_entry` should start probing
    /// from. Volatile, in-memory only, no on-disk representation.
    fn start_lookup_page(&self, ino: u32) -> DirResult<u64>;
    fn set_start_lookup_page(&self, ino: u32, page: u64) -> DirResult<()>;

    fn touch_mtime_ctime(&self, ino: u32) -> DirResult<()>;
    fn touch_ctime(&self, ino: u32) -> DirResult<()>;

    fn links_count(&self, ino: u32) -> DirResult<u16>;
    fn set_links_count(&self, ino: u32, count: u16) -> DirResult<()>;

    fn mode(&self, ino: u32) -> DirResult<u16>;

    /// Whether `EXT2_DIRSYNC_FL` is set on the directory — if so, every
    /// commit must be flushed synchronously (spec.md §4.4; original's
    /// `IS_DIRSYNC`).
    fn dirsync(&self, ino: u32) -> DirResult<bool>;

    /// Fetch the raw bytes of chunk (page) `index` for `ino`. Reads past
    /// the current `i_size` but within an already-allocated chunk return
    /// zero-filled bytes (mirrors `amnfs_get_page` + `read_mapping_page`
    /// bringing in a hole as zero).
    fn read_chunk(&self, ino: u32, index: u64) -> DirResult<Vec<u8>>;

    /// Validate that a chunk write of `len` bytes at `pos` can proceed.
    /// A no-op here since this host has no mid-write block allocation to
    /// perform (`amnfs_prepare_chunk` calls into the block mapper on
    /// real ext2; this host pre-allocates whole chunks instead).
    fn prepare_chunk(&self, ino: u32, pos: u64, len: u32) -> DirResult<()>;

    /// Persist `buf` (exactly `len` bytes) at chunk offset `pos`, bump
    /// `i_version`, extend `i_size` if this write reached past it, and
    /// mark the inode dirty. Mirrors `amnfs_commit_chunk`.
    fn commit_chunk(&self, ino: u32, pos: u64, buf: &[u8]) -> DirResult<()>;

    /// Report a detected corruption at the point of detection (spec.md
    /// §7); the caller still gets back a plain `Io`-kind error.
    fn report_error(&self, ino: u32, context: &str, detail: &str);

    /// Allocate a fresh inode number with the given mode and zero size.
    /// A minimal stand-in for the real inode allocator spec.md §1 places
    /// out of scope — just enough for the FUSE frontend to create nodes.
    fn alloc_inode(&self, mode: u16) -> DirResult<u32>;

    /// Release an inode once its link count has dropped to zero.
    fn free_inode(&self, ino: u32) -> DirResult<()>;
}

/// In-memory test host: one growable byte buffer per inode, no real
/// block allocation. Exercises directory semantics in isolation from
/// the on-disk layout (spec.md §8 test scenarios all run against this).
pub struct MemHost {
    chunk_size: u32,
    max_inode_number: u32,
    filetype_enabled: bool,
    inodes: Mutex<HashMap<u32, MemInode>>,
    next_inode: Mutex<u32>,
}

struct MemInode {
    data: Vec<u8>,
    version: u64,
    start_lookup_page: u64,
    mtime: u32,
    ctime: u32,
    links_count: u16,
    mode: u16,
    dirsync: bool,
}

impl Default for MemInode {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            version: 0,
            start_lookup_page: 0,
            mtime: 0,
            ctime: 0,
            links_count: 2,
            mode: 0x4000 | 0o755,
            dirsync: false,
        }
    }
}

impl MemHost {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            max_inode_number: u32::MAX,
            filetype_enabled: true,
            inodes: Mutex::new(HashMap::new()),
            next_inode: Mutex::new(crate::desc::EXT2_GOOD_OLD_FIRST_INO),
        }
    }

    /// Register an inode (so `i_blocks`/`mode`/etc. have a home) without
    /// any directory content yet.
    pub fn create_inode(&self, ino: u32) {
        self.inodes.lock().unwrap().entry(ino).or_default();
    }

    fn with_inode<T>(&self, ino: u32, f: impl FnOnce(&mut MemInode) -> T) -> DirResult<T> {
        let mut guard = self.inodes.lock().unwrap();
        let entry = guard.entry(ino).or_default();
        Ok(f(entry))
    }
}

impl Host for MemHost {
    fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn max_inode_number(&self) -> u32 {
        self.max_inode_number
    }

    fn filetype_enabled(&self) -> bool {
        self.filetype_enabled
    }

    fn i_size(&self, ino: u32) -> DirResult<u64> {
        self.with_inode(ino, |i| i.data.len() as u64)
    }

    fn set_i_size(&self, ino: u32, size: u64) -> DirResult<()> {
        self.with_inode(ino, |i| i.data.resize(size as usize, 0))
    }

    fn i_blocks(&self, ino: u32) -> DirResult<u64> {
        let chunk_size = self.chunk_size as u64;
        self.with_inode(ino, |i| {
            (i.data.len() as u64).div_ceil(512).max(i.data.len() as u64 / chunk_size * (chunk_size / 512))
        })
    }

    fn version(&self, ino: u32) -> DirResult<u64> {
        self.with_inode(ino, |i| i.version)
    }

    fn start_lookup_page(&self, ino: u32) -> DirResult<u64> {
        self.with_inode(ino, |i| i.start_lookup_page)
    }

    fn set_start_lookup_page(&self, ino: u32, page: u64) -> DirResult<()> {
        self.with_inode(ino, |i| i.start_lookup_page = page)
    }

    fn touch_mtime_ctime(&self, ino: u32) -> DirResult<()> {
        self.with_inode(ino, |i| {
            i.mtime += 1;
            i.ctime += 1;
        })
    }

    fn touch_ctime(&self, ino: u32) -> DirResult<()> {
        self.with_inode(ino, |i| i.ctime += 1)
    }

    fn links_count(&self, ino: u32) -> DirResult<u16> {
        self.with_inode(ino, |i| i.links_count)
    }

    fn set_links_count(&self, ino: u32, count: u16) -> DirResult<()> {
        self.with_inode(ino, |i| i.links_count = count)
    }

    fn mode(&self, ino: u32) -> DirResult<u16> {
        self.with_inode(ino, |i| i.mode)
    }

    fn dirsync(&self, ino: u32) -> DirResult<bool> {
        self.with_inode(ino, |i| i.dirsync)
    }

    fn read_chunk(&self, ino: u32, index: u64) -> DirResult<Vec<u8>> {
        let chunk_size = self.chunk_size as usize;
        let start = index as usize * chunk_size;
        self.with_inode(ino, |i| {
            let mut buf = vec![0u8; chunk_size];
            if start < i.data.len() {
                let end = (start + chunk_size).min(i.data.len());
                buf[..end - start].copy_from_slice(&i.data[start..end]);
            }
            buf
        })
    }

    fn prepare_chunk(&self, _ino: u32, _pos: u64, _len: u32) -> DirResult<()> {
        Ok(())
    }

    fn commit_chunk(&self, ino: u32, pos: u64, buf: &[u8]) -> DirResult<()> {
        let end = pos as usize + buf.len();
        self.with_inode(ino, |i| {
            if i.data.len() < end {
                i.data.resize(end, 0);
            }
            i.data[pos as usize..end].copy_from_slice(buf);
            i.version += 1;
        })
    }

    fn report_error(&self, ino: u32, context: &str, detail: &str) {
        error!("amnfs: directory #{ino} {context}: {detail}");
    }

    fn alloc_inode(&self, mode: u16) -> DirResult<u32> {
        let mut next = self.next_inode.lock().unwrap();
        let ino = *next;
        *next += 1;
        let links_count = if mode & 0xF000 == 0x4000 { 2 } else { 1 };
        self.inodes.lock().unwrap().insert(
            ino,
            MemInode {
                mode,
                links_count,
                ..Default::default()
            },
        );
        Ok(ino)
    }

    fn free_inode(&self, ino: u32) -> DirResult<()> {
        self.inodes.lock().unwrap().remove(&ino);
        Ok(())
    }
}

/// Production host backed by a real (or file-backed) block device via
/// `disk_driver::DiskDriver`. Implements a single-group layout: one
/// superblock, one group descriptor, an inode bitmap, a block bitmap,
/// an inode table, and data blocks — enough to back real directories,
/// deliberately not a complete multi-group ext2 driver (SPEC_FULL.md §1).
pub struct DiskHost {
    driver: Mutex<Box<dyn DiskDriver + Send>>,
    block_size: u32,
    super_block: Mutex<Ext2SuperBlock>,
    group_desc: Mutex<Ext2GroupDesc>,
    inode_table_block: u32,
    /// In-memory cache of decoded inodes, flushed to the inode table on
    /// `commit_chunk`/explicit `sync_inode`. Real ext2 keeps this in the
    /// page cache under the inode table's address space; a flat map is
    /// the minimum needed here.
    inodes: Mutex<HashMap<u32, Ext2Inode>>,
    lookup_hints: Mutex<HashMap<u32, u64>>,
    /// Next block handed out by `alloc_data_block`. A bump allocator:
    /// freeing/reuse is the block allocator's job and is out of scope
    /// here (spec.md §1).
    next_free_block: Mutex<u32>,
    /// Next inode number handed out by `alloc_inode`. Same bump-allocator
    /// simplification as `next_free_block`.
    next_free_inode: Mutex<u32>,
}

impl DiskHost {
    /// Format a fresh filesystem image on `driver` and return a host
    /// bound to it, with the root directory created at `EXT2_ROOT_INO`.
    pub fn format(
        mut driver: Box<dyn DiskDriver + Send>,
        block_size: u32,
        inodes_count: u32,
    ) -> Result<Self> {
        let layout_size = driver.info().consts.layout_size;
        let blocks_count = (layout_size / block_size as u64) as u32;
        let super_block = Ext2SuperBlock::new(block_size, inodes_count, blocks_count);

        // Fixed single-group layout: block 0 superblock, block 1 block
        // bitmap, block 2 inode bitmap, block 3.. inode table, then data.
        let inode_table_block = 3u32;
        let inode_table_blocks = (inodes_count as u64 * std::mem::size_of::<Ext2Inode>() as u64)
            .div_ceil(block_size as u64) as u32;
        let group_desc = Ext2GroupDesc {
            bg_block_bitmap: 1,
            bg_inode_bitmap: 2,
            bg_inode_table: inode_table_block,
            bg_free_blocks_count: blocks_count as u16,
            bg_free_inodes_count: inodes_count as u16 - EXT2_GOOD_OLD_FIRST_INO as u16 + 1,
            bg_used_dirs_count: 1,
        };

        let mut inodes = HashMap::new();
        let mut root = Ext2Inode::new_dir(0o755);
        root.i_links_count = 2;
        inodes.insert(EXT2_ROOT_INO, root);

        driver
            .ddriver_seek(0, SeekType::Set)
            .context("seeking to start of disk image")?;

        let host = Self {
            driver: Mutex::new(driver),
            block_size,
            super_block: Mutex::new(super_block),
            group_desc: Mutex::new(group_desc),
            inode_table_block,
            inodes: Mutex::new(inodes),
            lookup_hints: Mutex::new(HashMap::new()),
            next_free_block: Mutex::new(inode_table_block + inode_table_blocks),
            next_free_inode: Mutex::new(EXT2_GOOD_OLD_FIRST_INO),
        };

        // A real mkfs.ext2 writes the root directory's `.`/`..` block as
        // part of formatting, not on first mount; without this a fresh
        // volume's root has i_size 0 and nothing can ever be linked into
        // it. The page cache here is scratch: `make_empty` only needs it
        // for the post-write invalidate, and no other reader has touched
        // root's page 0 yet.
        let scratch_cache = crate::page::PageCache::new(block_size);
        crate::directory::make_empty(&host, &scratch_cache, EXT2_ROOT_INO, EXT2_ROOT_INO)
            .map_err(|e| anyhow!(e.to_string()))
            .context("writing root directory's initial `.`/`..` block")?;

        Ok(host)
    }

    fn read_block(&self, index: u64) -> Result<Vec<u8>> {
        let mut driver = self.driver.lock().unwrap();
        driver.ddriver_seek((index * self.block_size as u64) as i64, SeekType::Set)?;
        let mut buf = vec![0u8; self.block_size as usize];
        driver.ddriver_read(&mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, index: u64, buf: &[u8]) -> Result<()> {
        let mut driver = self.driver.lock().unwrap();
        driver.ddriver_seek((index * self.block_size as u64) as i64, SeekType::Set)?;
        driver.ddriver_write(buf)?;
        Ok(())
    }

    /// Data region starts right after the inode table.
    ///
    /// Returns `Ok(Some(block))` for an already-allocated chunk,
    /// `Ok(None)` for a chunk within the direct-block range that simply
    /// hasn't been allocated yet (a hole, same as a freshly-grown chunk
    /// on any other host), and `Err` only when the chunk index is out of
    /// range or the inode isn't loaded at all.
    fn data_block_for_chunk(&self, ino: u32, chunk_index: u64) -> Result<Option<u64>> {
        // Single-indirection-free layout: the directory's chunk index
        // maps directly onto `i_block[chunk_index]` for the first
        // EXT2_NDIR_BLOCKS chunks (indirect blocks are out of scope,
        // spec.md §1).
        let inodes = self.inodes.lock().unwrap();
        let inode = inodes
            .get(&ino)
            .ok_or_else(|| anyhow!("inode {ino} not loaded"))?;
        if chunk_index as usize >= crate::desc::EXT2_NDIR_BLOCKS {
            return Err(anyhow!("directory grew past direct block range (indirect blocks unsupported)"));
        }
        let block = inode.i_block[chunk_index as usize];
        if block == 0 {
            return Ok(None);
        }
        Ok(Some(block as u64))
    }

    fn alloc_data_block(&self) -> Result<u32> {
        let mut group_desc = self.group_desc.lock().unwrap();
        if group_desc.bg_free_blocks_count == 0 {
            return Err(anyhow!("no free blocks left"));
        }
        let mut next = self.next_free_block.lock().unwrap();
        let block = *next;
        *next += 1;
        group_desc.bg_free_blocks_count -= 1;
        Ok(block)
    }
}

impl Host for DiskHost {
    fn chunk_size(&self) -> u32 {
        self.block_size
    }

    fn max_inode_number(&self) -> u32 {
        self.super_block.lock().unwrap().max_inode_number()
    }

    fn filetype_enabled(&self) -> bool {
        self.super_block.lock().unwrap().filetype_enabled()
    }

    fn i_size(&self, ino: u32) -> DirResult<u64> {
        Ok(self
            .inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|i| i.i_size)
            .unwrap_or(0))
    }

    fn set_i_size(&self, ino: u32, size: u64) -> DirResult<()> {
        if let Some(inode) = self.inodes.lock().unwrap().get_mut(&ino) {
            inode.i_size = size;
        }
        Ok(())
    }

    fn i_blocks(&self, ino: u32) -> DirResult<u64> {
        Ok(self
            .inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|i| i.i_blocks as u64)
            .unwrap_or(0))
    }

    fn version(&self, ino: u32) -> DirResult<u64> {
        Ok(self
            .inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|i| i.i_version as u64)
            .unwrap_or(0))
    }

    fn start_lookup_page(&self, ino: u32) -> DirResult<u64> {
        Ok(*self.lookup_hints.lock().unwrap().get(&ino).unwrap_or(&0))
    }

    fn set_start_lookup_page(&self, ino: u32, page: u64) -> DirResult<()> {
        self.lookup_hints.lock().unwrap().insert(ino, page);
        Ok(())
    }

    fn touch_mtime_ctime(&self, ino: u32) -> DirResult<()> {
        if let Some(inode) = self.inodes.lock().unwrap().get_mut(&ino) {
            let now = now_secs();
            inode.i_mtime = now;
            inode.i_ctime = now;
        }
        Ok(())
    }

    fn touch_ctime(&self, ino: u32) -> DirResult<()> {
        if let Some(inode) = self.inodes.lock().unwrap().get_mut(&ino) {
            inode.i_ctime = now_secs();
        }
        Ok(())
    }

    fn links_count(&self, ino: u32) -> DirResult<u16> {
        Ok(self
            .inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|i| i.i_links_count)
            .unwrap_or(0))
    }

    fn set_links_count(&self, ino: u32, count: u16) -> DirResult<()> {
        if let Some(inode) = self.inodes.lock().unwrap().get_mut(&ino) {
            inode.i_links_count = count;
        }
        Ok(())
    }

    fn mode(&self, ino: u32) -> DirResult<u16> {
        Ok(self
            .inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|i| i.i_mode)
            .unwrap_or(0))
    }

    fn dirsync(&self, ino: u32) -> DirResult<bool> {
        const EXT2_DIRSYNC_FL: u32 = 0x00010000;
        Ok(self
            .inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|i| i.i_flags & EXT2_DIRSYNC_FL != 0)
            .unwrap_or(false))
    }

    fn read_chunk(&self, ino: u32, index: u64) -> DirResult<Vec<u8>> {
        match self.data_block_for_chunk(ino, index).map_err(|e| DirError::io(e.to_string()))? {
            Some(block) => self.read_block(block).map_err(|e| DirError::io(e.to_string())),
            // An unallocated chunk within range reads as a hole, same as
            // `MemHost`'s zero-fill for any offset past its buffer's end.
            None => Ok(vec![0u8; self.block_size as usize]),
        }
    }

    fn prepare_chunk(&self, ino: u32, pos: u64, _len: u32) -> DirResult<()> {
        let chunk_index = pos / self.block_size as u64;
        let allocated = self
            .data_block_for_chunk(ino, chunk_index)
            .map_err(|e| DirError::io(e.to_string()))?
            .is_some();
        if !allocated {
            let block = self.alloc_data_block().map_err(|e| DirError::no_mem(e.to_string()))?;
            let mut inodes = self.inodes.lock().unwrap();
            let inode = inodes
                .get_mut(&ino)
                .ok_or_else(|| DirError::io(format!("inode {ino} not loaded")))?;
            inode.i_block[chunk_index as usize] = block;
            inode.i_blocks += self.block_size / 512;
        }
        Ok(())
    }

    fn commit_chunk(&self, ino: u32, pos: u64, buf: &[u8]) -> DirResult<()> {
        let chunk_index = pos / self.block_size as u64;
        let in_block_offset = (pos % self.block_size as u64) as usize;
        let block = self
            .data_block_for_chunk(ino, chunk_index)
            .map_err(|e| DirError::io(e.to_string()))?
            .ok_or_else(|| DirError::io(format!("chunk {chunk_index} of inode {ino} committed before prepare_chunk allocated it")))?;
        let mut block_buf = if in_block_offset == 0 && buf.len() == self.block_size as usize {
            buf.to_vec()
        } else {
            let mut existing = self.read_block(block).map_err(|e| DirError::io(e.to_string()))?;
            existing[in_block_offset..in_block_offset + buf.len()].copy_from_slice(buf);
            existing
        };
        self.write_block(block, &std::mem::take(&mut block_buf))
            .map_err(|e| DirError::io(e.to_string()))?;
        let mut inodes = self.inodes.lock().unwrap();
        if let Some(inode) = inodes.get_mut(&ino) {
            inode.i_version = inode.i_version.wrapping_add(1);
            let end = pos + buf.len() as u64;
            if end > inode.i_size {
                inode.i_size = end;
            }
        }
        if self.dirsync(ino)? {
            self.driver
                .lock()
                .unwrap()
                .ddriver_flush()
                .map_err(|e| DirError::io(e.to_string()))?;
        }
        Ok(())
    }

    fn report_error(&self, ino: u32, context: &str, detail: &str) {
        error!("amnfs: directory #{ino} {context}: {detail}");
    }

    fn alloc_inode(&self, mode: u16) -> DirResult<u32> {
        let mut group_desc = self.group_desc.lock().unwrap();
        if group_desc.bg_free_inodes_count == 0 {
            return Err(DirError::no_mem("no free inodes left"));
        }
        let mut next = self.next_free_inode.lock().unwrap();
        let ino = *next;
        *next += 1;
        group_desc.bg_free_inodes_count -= 1;

        let mut inode = if mode & 0xF000 == 0x4000 {
            Ext2Inode::new_dir(mode & 0xFFF)
        } else {
            Ext2Inode::new_file(mode & 0xFFF)
        };
        let now = now_secs();
        inode.i_atime = now;
        inode.i_ctime = now;
        inode.i_mtime = now;
        self.inodes.lock().unwrap().insert(ino, inode);
        Ok(ino)
    }

    fn free_inode(&self, ino: u32) -> DirResult<()> {
        self.inodes.lock().unwrap().remove(&ino);
        self.group_desc.lock().unwrap().bg_free_inodes_count += 1;
        Ok(())
    }
}

fn now_secs() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
