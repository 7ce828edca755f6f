//! Record Codec: the packed, little-endian, variable-length directory
//! entry format and its alignment/span rules.
//!
//! Grounded in `examples/original_source/fs/amnfs/dir.c`
//! (`amnfs_rec_len_from_disk`, `amnfs_rec_len_to_disk`,
//! `AMNFS_DIR_REC_LEN`). Unlike the original, which reinterprets raw
//! bytes as a C struct, this codec parses defensively from a byte slice
//! so malformed on-disk data produces a typed error instead of undefined
//! behavior — see spec.md §7.

use crate::desc::{FileType, EXT2_NAME_LEN};
use crate::error::{DirError, DirResult};

/// Fixed header size before the name: inode(4) + rec_len(2) + name_len(1)
/// + file_type(1).
pub const ENTRY_HEADER_LEN: u32 = 8;

/// `AMNFS_MAX_REC_LEN` escape value.
const MAX_REC_LEN_ESCAPE: u16 = 0xFFFF;

/// Round `n` up to the next multiple of 4, matching the on-disk
/// alignment rule every entry's `rec_len` must satisfy.
pub fn align4(n: u32) -> u32 {
    (n + 3) & !3
}

/// Minimum `rec_len` needed to store a name of `name_len` bytes:
/// `AMNFS_DIR_REC_LEN` in the original.
pub fn needed(name_len: u8) -> u32 {
    align4(ENTRY_HEADER_LEN + name_len as u32)
}

/// Large-block mode: the 65536 escape value is only meaningful when the
/// chunk size itself can reach 65536 bytes (mirrors the original's
/// `#if PAGE_CACHE_SIZE >= 65536` compile-time gate, made a runtime
/// check since one binary here serves any block size).
pub fn large_blocks(chunk_size: u32) -> bool {
    chunk_size >= 65536
}

/// `amnfs_rec_len_from_disk`.
pub fn decode_rec_len(raw: u16, large_blocks: bool) -> u32 {
    if large_blocks && raw == MAX_REC_LEN_ESCAPE {
        return 1 << 16;
    }
    raw as u32
}

/// `amnfs_rec_len_to_disk`. The original asserts `len <= 1 << 16`; here
/// that assertion becomes a typed error so corrupt or miscomputed
/// lengths never panic.
pub fn encode_rec_len(len: u32, large_blocks: bool) -> DirResult<u16> {
    if large_blocks && len == (1 << 16) {
        return Ok(MAX_REC_LEN_ESCAPE);
    }
    if len > 0xFFFF {
        return Err(DirError::io(format!("rec_len {len} out of encodable range")));
    }
    Ok(len as u16)
}

/// A decoded view of one directory entry: header fields plus the
/// entry's start offset within its page and its on-disk total length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Byte offset of this entry's header within the page.
    pub offset: u32,
    pub inode: u32,
    pub rec_len: u32,
    pub name_len: u8,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn is_free(&self) -> bool {
        self.inode == 0
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_tag(self.file_type)
    }

    /// Bytes used by the header + name, rounded up — i.e. `needed()` for
    /// this entry's actual name, as opposed to `rec_len` which may be
    /// larger (the entry owns trailing free space).
    pub fn used_len(&self) -> u32 {
        needed(self.name_len)
    }

    /// Decode one entry's header + name starting at `offset` within
    /// `buf`. Does not by itself validate alignment/span/inode-range —
    /// that is `page::validate_page`'s job, mirroring how
    /// `amnfs_check_page` validates a whole page up front so that later
    /// per-entry code (`amnfs_next_entry`, `amnfs_match`) can trust the
    /// layout.
    pub fn decode(buf: &[u8], offset: u32, large_blocks: bool) -> DirResult<Self> {
        let off = offset as usize;
        if off + ENTRY_HEADER_LEN as usize > buf.len() {
            return Err(DirError::corruption("entry header runs past page end"));
        }
        let inode = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let rec_len_raw = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap());
        let name_len = buf[off + 6];
        let file_type = buf[off + 7];
        let rec_len = decode_rec_len(rec_len_raw, large_blocks);

        let name_end = off + ENTRY_HEADER_LEN as usize + name_len as usize;
        if name_end > buf.len() {
            return Err(DirError::corruption("entry name runs past page end"));
        }
        let name = buf[off + ENTRY_HEADER_LEN as usize..name_end].to_vec();

        Ok(Self {
            offset,
            inode,
            rec_len,
            name_len,
            file_type,
            name,
        })
    }

    /// Write this entry's header + name back into `buf` at `self.offset`.
    /// Callers are responsible for `rec_len` already reflecting the slot
    /// size they intend to occupy (possibly larger than `used_len()`).
    pub fn encode_into(&self, buf: &mut [u8], large_blocks: bool) -> DirResult<()> {
        if self.name.len() > EXT2_NAME_LEN {
            return Err(DirError::name_too_long(format!(
                "name of {} bytes exceeds {EXT2_NAME_LEN}",
                self.name.len()
            )));
        }
        let off = self.offset as usize;
        let rec_len_raw = encode_rec_len(self.rec_len, large_blocks)?;
        buf[off..off + 4].copy_from_slice(&self.inode.to_le_bytes());
        buf[off + 4..off + 6].copy_from_slice(&rec_len_raw.to_le_bytes());
        buf[off + 6] = self.name_len;
        buf[off + 7] = self.file_type;
        let name_end = off + ENTRY_HEADER_LEN as usize + self.name.len();
        buf[off + ENTRY_HEADER_LEN as usize..name_end].copy_from_slice(&self.name);
        Ok(())
    }

    /// `amnfs_match`: byte-exact name comparison, also requiring a
    /// non-free slot (len == 0 && !inode is rejected by callers
    /// separately, matching the original's `de->inode` check).
    pub fn matches_name(&self, name: &[u8]) -> bool {
        self.inode != 0 && self.name.as_slice() == name
    }
}

/// Set the file-type tag for a new entry given the target inode's mode,
/// respecting the `filetype` feature flag. Mirrors `amnfs_set_de_type`.
pub fn file_type_tag(mode: u16, filetype_enabled: bool) -> u8 {
    if filetype_enabled {
        FileType::from_mode(mode) as u8
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align4_rounds_up() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(8), 8);
        assert_eq!(align4(9), 12);
    }

    #[test]
    fn needed_matches_dir_rec_len_macro() {
        // AMNFS_DIR_REC_LEN(1) used throughout dir.c for "." entries.
        assert_eq!(needed(1), 12);
        assert_eq!(needed(2), 12);
        assert_eq!(needed(0), 8);
    }

    #[test]
    fn rec_len_escape_roundtrip_large_blocks() {
        let encoded = encode_rec_len(65536, true).unwrap();
        assert_eq!(encoded, MAX_REC_LEN_ESCAPE);
        assert_eq!(decode_rec_len(encoded, true), 65536);
    }

    #[test]
    fn rec_len_escape_not_applied_for_small_blocks() {
        // with large_blocks=false, 0xFFFF decodes to itself, not 65536
        assert_eq!(decode_rec_len(0xFFFF, false), 0xFFFF);
    }

    #[test]
    fn decode_then_encode_roundtrip() {
        let mut buf = vec![0u8; 16];
        let entry = DirEntry {
            offset: 0,
            inode: 7,
            rec_len: 12,
            name_len: 1,
            file_type: FileType::Directory as u8,
            name: b".".to_vec(),
        };
        entry.encode_into(&mut buf, false).unwrap();
        let decoded = DirEntry::decode(&buf, 0, false).unwrap();
        assert_eq!(decoded.inode, 7);
        assert_eq!(decoded.rec_len, 12);
        assert_eq!(decoded.name, b".");
    }

    #[test]
    fn encode_rejects_overlong_name() {
        let mut buf = vec![0u8; 512];
        let entry = DirEntry {
            offset: 0,
            inode: 1,
            rec_len: 400,
            name_len: 0,
            file_type: 0,
            name: vec![b'a'; EXT2_NAME_LEN + 1],
        };
        assert!(entry.encode_into(&mut buf, false).is_err());
    }
}
