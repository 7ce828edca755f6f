//! Block-device abstraction used to back the on-disk filesystem.
//!
//! This plays the role of the "disk" underneath the directory core:
//! something the Host Bridge reads pages from and writes pages back to.
//! Real block allocation, wear levelling, and I/O scheduling are out of
//! scope here (see spec.md §1); this crate only needs to move fixed-size
//! chunks of bytes to and from a backing store.

use anyhow::Result;

pub mod file;
pub mod memory;

/// Seek origin, mirroring `std::io::SeekFrom` without dragging that type
/// through every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct DiskStats {
    pub read_cnt: u64,
    pub write_cnt: u64,
    pub seek_cnt: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct DiskConst {
    /// Total addressable size of the backing store, in bytes.
    pub layout_size: u64,
    /// Smallest unit the driver will read or write at once, in bytes.
    pub iounit_size: u32,
}

impl Default for DiskConst {
    fn default() -> Self {
        Self {
            layout_size: 64 * 0x400 * 0x400,
            iounit_size: 512,
        }
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct DiskInfo {
    pub stats: DiskStats,
    pub consts: DiskConst,
}

/// Abstract block device.
///
/// Implementations are not expected to be thread-safe on their own; the
/// Host Bridge serializes access the same way it serializes page access
/// (see spec.md §5).
pub trait DiskDriver {
    fn ddriver_open(&mut self, path: &str) -> Result<()>;
    fn ddriver_close(&mut self) -> Result<()>;
    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64>;
    fn ddriver_write(&mut self, buf: &[u8]) -> Result<usize>;
    fn ddriver_read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn ddriver_flush(&mut self) -> Result<()>;
    fn info(&self) -> &DiskInfo;
}
