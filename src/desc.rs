//! On-disk layout structures.
//!
//! Trimmed from the full ext2 on-disk format down to what the directory
//! subsystem and its host adapter need: inode metadata, the superblock
//! fields that determine block size and inode-number range, and the
//! group descriptor that locates the inode table and bitmaps. ACL,
//! journal, MMP, and crypto structures are out of scope (see spec.md §1)
//! and are not carried over.
//!
//! Field layout follows `examples/chiro2001-rfs/src/rfs_lib/desc.rs`,
//! cross-checked against `examples/original_source/include/linux/amnfs_fs.h`.

use std::mem::size_of;

pub const EXT2_ROOT_INO: u32 = 2;
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT2_LINK_MAX: u32 = 65000;
pub const EXT2_NAME_LEN: usize = 255;
pub const EXT2_N_BLOCKS: usize = 15;
pub const EXT2_NDIR_BLOCKS: usize = 12;

/// File-type tag stored in a directory entry's `file_type` byte, once
/// `EXT2_FEATURE_INCOMPAT_FILETYPE` is set. Mirrors `amnfs_filetype_table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegularFile = 1,
    Directory = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Fifo = 5,
    Socket = 6,
    Symlink = 7,
}

impl FileType {
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => FileType::RegularFile,
            2 => FileType::Directory,
            3 => FileType::CharDevice,
            4 => FileType::BlockDevice,
            5 => FileType::Fifo,
            6 => FileType::Socket,
            7 => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    /// Mirrors `amnfs_type_by_mode`: derive the directory-entry file-type
    /// tag from a Unix mode word.
    pub fn from_mode(mode: u16) -> Self {
        match mode & 0xF000 {
            0x8000 => FileType::RegularFile,
            0x4000 => FileType::Directory,
            0x2000 => FileType::CharDevice,
            0x6000 => FileType::BlockDevice,
            0x1000 => FileType::Fifo,
            0xC000 => FileType::Socket,
            0xA000 => FileType::Symlink,
            _ => FileType::Unknown,
        }
    }

    pub fn is_dir(self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// In-memory inode record. On disk, ext2 inodes are packed little-endian
/// structs of fixed `s_inode_size`; the host adapter is responsible for
/// the byte-level (de)serialization (see `host::DiskHost`), this struct
/// is the decoded view the directory core and FUSE frontend operate on.
#[derive(Debug, Clone)]
pub struct Ext2Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_gid: u16,
    pub i_size: u64,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_block: [u32; EXT2_N_BLOCKS],
    pub i_generation: u32,
}

impl Default for Ext2Inode {
    fn default() -> Self {
        Self {
            i_mode: 0,
            i_uid: 0,
            i_gid: 0,
            i_size: 0,
            i_atime: 0,
            i_ctime: 0,
            i_mtime: 0,
            i_dtime: 0,
            i_links_count: 0,
            i_blocks: 0,
            i_flags: 0,
            i_block: [0; EXT2_N_BLOCKS],
            i_generation: 0,
        }
    }
}

impl Ext2Inode {
    pub fn new_dir(mode: u16) -> Self {
        Self {
            i_mode: 0x4000 | (mode & 0xFFF),
            i_links_count: 2, // self + parent's ".."
            ..Default::default()
        }
    }

    pub fn new_file(mode: u16) -> Self {
        Self {
            i_mode: 0x8000 | (mode & 0xFFF),
            i_links_count: 1,
            ..Default::default()
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.i_mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type().is_dir()
    }
}

/// Group descriptor; only the fields the host adapter needs to locate
/// the inode table and bitmaps for the single group this crate supports.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ext2GroupDesc {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
}

/// Superblock fields needed to compute block size and the valid inode
/// number range. Matches the layout in
/// `examples/original_source/include/linux/amnfs_fs.h`.
#[derive(Debug, Clone, Copy)]
pub struct Ext2SuperBlock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_magic: u16,
    pub s_inode_size: u16,
    pub s_feature_incompat: u32,
}

/// `EXT2_FEATURE_INCOMPAT_FILETYPE`: directory entries carry a file-type
/// byte instead of requiring a stat() per entry.
pub const EXT2_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

impl Ext2SuperBlock {
    pub fn block_size(&self) -> u32 {
        1024 << self.s_log_block_size
    }

    pub fn filetype_enabled(&self) -> bool {
        self.s_feature_incompat & EXT2_FEATURE_INCOMPAT_FILETYPE != 0
    }

    pub fn max_inode_number(&self) -> u32 {
        self.s_inodes_count
    }

    pub fn new(block_size: u32, inodes_count: u32, blocks_count: u32) -> Self {
        let log_block_size = (block_size / 1024).trailing_zeros();
        Self {
            s_inodes_count: inodes_count,
            s_blocks_count: blocks_count,
            s_free_blocks_count: blocks_count,
            s_free_inodes_count: inodes_count - EXT2_GOOD_OLD_FIRST_INO + 1,
            s_first_data_block: if block_size == 1024 { 1 } else { 0 },
            s_log_block_size: log_block_size,
            s_blocks_per_group: block_size * 8,
            s_inodes_per_group: inodes_count,
            s_magic: EXT2_SUPER_MAGIC,
            s_inode_size: size_of::<Ext2Inode>() as u16,
            s_feature_incompat: EXT2_FEATURE_INCOMPAT_FILETYPE,
        }
    }
}
