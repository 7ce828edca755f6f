//! Directory Operations: lookup, iteration, link add/remove, and rename,
//! over the Page View and Record Codec.
//!
//! Every public function here has a named counterpart in
//! `examples/original_source/fs/amnfs/dir.c` or `namei.c`; the doc
//! comment on each names it.

use crate::desc::EXT2_NAME_LEN;
use crate::dirent::{file_type_tag, large_blocks, needed, DirEntry};
use crate::error::{DirError, DirResult};
use crate::host::Host;
use crate::page::{revalidate_offset, PageCache};

/// Result of a successful name lookup: the decoded entry plus the page
/// it was found on, so callers can pass both into `set_link`/
/// `delete_entry` without searching again.
#[derive(Debug, Clone)]
pub struct Found {
    pub entry: DirEntry,
    pub page_index: u64,
}

fn check_name_len(name: &[u8]) -> DirResult<u8> {
    if name.len() > EXT2_NAME_LEN {
        return Err(DirError::name_too_long(format!(
            "name of {} bytes exceeds {EXT2_NAME_LEN}",
            name.len()
        )));
    }
    Ok(name.len() as u8)
}

/// `amnfs_find_entry`: locate `name` in `dir_ino`, starting from the
/// inode's lookup hint and wrapping around the whole directory once.
/// On a hit, advances the hint to the page where the entry was found.
pub fn find_entry(
    host: &dyn Host,
    cache: &PageCache,
    dir_ino: u32,
) -> FindEntry<'_> {
    FindEntry { host, cache, dir_ino }
}

/// Thin builder so `find_entry(..).by_name(name)` reads close to the
/// original's call shape while keeping the function signature short.
pub struct FindEntry<'a> {
    host: &'a dyn Host,
    cache: &'a PageCache,
    dir_ino: u32,
}

impl<'a> FindEntry<'a> {
    pub fn by_name(&self, name: &[u8]) -> DirResult<Option<Found>> {
        find_entry_impl(self.host, self.cache, self.dir_ino, name)
    }
}

fn find_entry_impl(
    host: &dyn Host,
    cache: &PageCache,
    dir_ino: u32,
    name: &[u8],
) -> DirResult<Option<Found>> {
    check_name_len(name)?;
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let i_size = host.i_size(dir_ino)?;
    let npages = i_size / chunk_size as u64;
    if npages == 0 {
        return Ok(None);
    }

    let reclen = needed(name.len() as u8);
    let mut start = host.start_lookup_page(dir_ino)?;
    if start >= npages {
        start = 0;
    }
    let mut n = start;
    let mut dir_has_error = false;
    let max_page = host.i_blocks(dir_ino)? / (chunk_size as u64 / 512).max(1);

    loop {
        match cache.get_page(host, dir_ino, n, dir_has_error) {
            Ok(page) => {
                let bytes = page.read().bytes().to_vec();
                let limit = page.last_byte(i_size).saturating_sub(reclen);
                let mut offs = 0u32;
                while offs <= limit {
                    let entry = DirEntry::decode(&bytes, offs, lb)?;
                    if entry.rec_len == 0 {
                        host.report_error(dir_ino, "amnfs_find_entry", "zero-length directory entry");
                        return Err(DirError::corruption("zero-length directory entry"));
                    }
                    if entry.matches_name(name) {
                        host.set_start_lookup_page(dir_ino, n)?;
                        return Ok(Some(Found {
                            entry,
                            page_index: n,
                        }));
                    }
                    offs += entry.rec_len;
                }
            }
            Err(_) => dir_has_error = true,
        }

        n += 1;
        if n >= npages {
            n = 0;
        }
        if n > max_page {
            host.report_error(
                dir_ino,
                "amnfs_find_entry",
                &format!("dir size {i_size} exceeds block count"),
            );
            return Ok(None);
        }
        if n == start {
            return Ok(None);
        }
    }
}

/// `amnfs_inode_by_name`.
pub fn inode_by_name(host: &dyn Host, cache: &PageCache, dir_ino: u32, name: &[u8]) -> DirResult<Option<u32>> {
    Ok(find_entry(host, cache, dir_ino)
        .by_name(name)?
        .map(|f| f.entry.inode))
}

/// `amnfs_dotdot`: the second entry of the root chunk, i.e. `..`.
pub fn dotdot(host: &dyn Host, cache: &PageCache, dir_ino: u32) -> DirResult<Found> {
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let page = cache.get_page(host, dir_ino, 0, false)?;
    let bytes = page.read().bytes().to_vec();
    let dot = DirEntry::decode(&bytes, 0, lb)?;
    if dot.rec_len == 0 {
        return Err(DirError::corruption("zero-length '.' entry"));
    }
    let entry = DirEntry::decode(&bytes, dot.rec_len, lb)?;
    Ok(Found {
        entry,
        page_index: 0,
    })
}

/// Cursor carried across `readdir` calls: resume position plus the
/// directory version last seen, so a concurrent mutation between calls
/// triggers `amnfs_validate_entry`'s re-entry validation exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadCursor {
    pub pos: u64,
    pub version: u64,
}

/// `amnfs_readdir`: emit every occupied entry from `cursor.pos` onward.
/// `emit` receives each entry's real byte resume position, the value
/// `cursor.pos` will advance to right after this entry, so callers that
/// hand it to a resume-cookie API (like FUSE's `reply.add`) stay in the
/// same unit `cursor.pos` itself is kept in. `emit` returns `false` to
/// stop early (mirrors `dir_emit` returning false when the caller's
/// buffer is full); the cursor is left pointing at the entry that should
/// be emitted next call.
pub fn readdir(
    host: &dyn Host,
    cache: &PageCache,
    dir_ino: u32,
    cursor: &mut ReadCursor,
    mut emit: impl FnMut(u32, u8, &[u8], u64) -> bool,
) -> DirResult<()> {
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let i_size = host.i_size(dir_ino)?;
    let min_len = needed(1) as u64;
    if cursor.pos > i_size.saturating_sub(min_len) {
        return Ok(());
    }

    let mut need_revalidate = cursor.version != host.version(dir_ino)?;
    let mut n = cursor.pos / chunk_size as u64;
    let mut offset = (cursor.pos % chunk_size as u64) as u32;
    let npages = i_size.div_ceil(chunk_size as u64);

    while n < npages {
        let page = cache.get_page(host, dir_ino, n, false)?;
        let bytes = page.read().bytes().to_vec();

        if need_revalidate {
            if offset != 0 {
                offset = revalidate_offset(&bytes, offset, chunk_size, lb);
                cursor.pos = n * chunk_size as u64 + offset as u64;
            }
            cursor.version = host.version(dir_ino)?;
            need_revalidate = false;
        }

        let limit = page.last_byte(i_size).saturating_sub(needed(1));
        let mut de_off = offset;
        while de_off <= limit {
            let entry = DirEntry::decode(&bytes, de_off, lb)?;
            if entry.rec_len == 0 {
                host.report_error(dir_ino, "amnfs_readdir", "zero-length directory entry");
                return Err(DirError::corruption("zero-length directory entry"));
            }
            let next_pos = n * chunk_size as u64 + de_off as u64 + entry.rec_len as u64;
            if entry.inode != 0 && !emit(entry.inode, entry.file_type, &entry.name, next_pos) {
                cursor.pos = n * chunk_size as u64 + de_off as u64;
                return Ok(());
            }
            de_off += entry.rec_len;
            cursor.pos = next_pos;
        }
        n += 1;
        offset = 0;
    }
    Ok(())
}

/// `amnfs_set_link`: rewrite an existing entry's target inode and
/// file-type tag in place, keeping its name and `rec_len`. Releases no
/// page of its own (the caller already holds `found` from a lookup).
pub fn set_link(
    host: &dyn Host,
    cache: &PageCache,
    dir_ino: u32,
    found: &Found,
    new_ino: u32,
    new_mode: u16,
    update_times: bool,
) -> DirResult<()> {
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let pos = found.page_index * chunk_size as u64 + found.entry.offset as u64;

    host.prepare_chunk(dir_ino, pos, found.entry.rec_len)?;
    let mut buf = vec![0u8; found.entry.rec_len as usize];
    let mut entry = found.entry.clone();
    entry.offset = 0;
    entry.inode = new_ino;
    entry.file_type = file_type_tag(new_mode, host.filetype_enabled());
    entry.encode_into(&mut buf, lb)?;
    host.commit_chunk(dir_ino, pos, &buf)?;

    if update_times {
        host.touch_mtime_ctime(dir_ino)?;
    }
    cache.invalidate(found.page_index);
    Ok(())
}

/// `amnfs_add_link`: insert `name -> target_ino` into `dir_ino`, reusing
/// a free slot, splitting an oversized one, or growing the directory by
/// one chunk if nothing fits. Parent directory is assumed locked by the
/// caller.
pub fn add_link(
    host: &dyn Host,
    cache: &PageCache,
    dir_ino: u32,
    name: &[u8],
    target_ino: u32,
    target_mode: u16,
) -> DirResult<()> {
    let name_len = check_name_len(name)?;
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let reclen = needed(name_len);
    let filetype_enabled = host.filetype_enabled();
    let file_type = file_type_tag(target_mode, filetype_enabled);

    let i_size = host.i_size(dir_ino)?;
    let npages = i_size / chunk_size as u64;

    for n in 0..=npages {
        let page = cache.get_page(host, dir_ino, n, false)?;
        let bytes = page.read().bytes().to_vec();
        let dir_end = page.last_byte(i_size);

        // Mirrors `amnfs_add_link`'s `while (de <= kaddr)` bound: the
        // i_size check below must only fire inside this bound, since for
        // an existing fully-packed chunk `dir_end` equals `chunk_size`
        // and would otherwise be misread as free space at the chunk's
        // tail, corrupting the next chunk.
        let bound = chunk_size.saturating_sub(reclen);
        let mut offs = 0u32;
        let slot = loop {
            if offs > bound {
                break None;
            }
            if offs == dir_end {
                // Hit i_size: the rest of this chunk (the whole chunk,
                // for a freshly-grown one) is free.
                break Some((offs, chunk_size, None));
            }
            let entry = DirEntry::decode(&bytes, offs, lb)?;
            if entry.rec_len == 0 {
                host.report_error(dir_ino, "amnfs_add_link", "zero-length directory entry");
                return Err(DirError::corruption("zero-length directory entry"));
            }
            if entry.matches_name(name) {
                return Err(DirError::exists(format!(
                    "entry already exists in directory #{dir_ino}"
                )));
            }
            let existing_used = needed(entry.name_len);
            if entry.is_free() && entry.rec_len >= reclen {
                break Some((offs, entry.rec_len, None));
            }
            if entry.rec_len >= existing_used + reclen {
                break Some((offs, entry.rec_len, Some(entry.clone())));
            }
            offs += entry.rec_len;
        };

        let Some((offs, rec_len, occupant)) = slot else {
            continue;
        };

        let pos = n * chunk_size as u64 + offs as u64;
        host.prepare_chunk(dir_ino, pos, rec_len)?;
        let mut buf = vec![0u8; rec_len as usize];

        let new_entry_offset = if let Some(occupant) = &occupant {
            let existing_used = needed(occupant.name_len);
            let mut kept = occupant.clone();
            kept.offset = 0;
            kept.rec_len = existing_used;
            kept.encode_into(&mut buf, lb)?;
            existing_used
        } else {
            0
        };
        let new_rec_len = rec_len - new_entry_offset;
        let new_entry = DirEntry {
            offset: new_entry_offset,
            inode: target_ino,
            rec_len: new_rec_len,
            name_len,
            file_type,
            name: name.to_vec(),
        };
        new_entry.encode_into(&mut buf, lb)?;
        host.commit_chunk(dir_ino, pos, &buf)?;
        host.touch_mtime_ctime(dir_ino)?;
        cache.invalidate(n);
        return Ok(());
    }

    // npages covers every existing chunk plus one fresh one; reaching
    // here means even the synthetic end-of-data slot didn't fit, which
    // cannot happen for any name within EXT2_NAME_LEN.
    Err(DirError::no_mem(format!(
        "no room for new entry in directory #{dir_ino}"
    )))
}

/// `amnfs_delete_entry`: free `found`'s slot, merging it with the
/// previous entry in the same chunk when one exists, otherwise just
/// zeroing its inode in place.
pub fn delete_entry(host: &dyn Host, cache: &PageCache, dir_ino: u32, found: &Found) -> DirResult<()> {
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let page = cache.get_page(host, dir_ino, found.page_index, false)?;
    let bytes = page.read().bytes().to_vec();

    let chunk_start = found.entry.offset & !(chunk_size - 1);
    let to = found.entry.offset + found.entry.rec_len;

    let mut prev: Option<DirEntry> = None;
    let mut offs = chunk_start;
    while offs < found.entry.offset {
        let entry = DirEntry::decode(&bytes, offs, lb)?;
        if entry.rec_len == 0 {
            host.report_error(dir_ino, "amnfs_delete_entry", "zero-length directory entry");
            return Err(DirError::corruption("zero-length directory entry"));
        }
        offs += entry.rec_len;
        prev = Some(entry);
    }

    let from = prev.as_ref().map(|p| p.offset).unwrap_or(chunk_start);
    let pos = found.page_index * chunk_size as u64 + from as u64;
    let len = to - from;

    host.prepare_chunk(dir_ino, pos, len)?;
    let mut buf = vec![0u8; len as usize];
    if let Some(mut prev) = prev {
        prev.offset = 0;
        prev.rec_len = len;
        prev.encode_into(&mut buf, lb)?;
    } else {
        let mut freed = found.entry.clone();
        freed.offset = 0;
        freed.inode = 0;
        freed.encode_into(&mut buf, lb)?;
    }
    host.commit_chunk(dir_ino, pos, &buf)?;
    host.touch_mtime_ctime(dir_ino)?;
    cache.invalidate(found.page_index);
    Ok(())
}

/// `amnfs_make_empty`: write a directory's root chunk as `.`/`..` only.
/// Used right after a directory inode is allocated.
pub fn make_empty(host: &dyn Host, cache: &PageCache, dir_ino: u32, parent_ino: u32) -> DirResult<()> {
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let filetype_enabled = host.filetype_enabled();
    let dir_mode = host.mode(dir_ino)?;
    let tag = file_type_tag(dir_mode, filetype_enabled);

    host.prepare_chunk(dir_ino, 0, chunk_size)?;

    let mut buf = vec![0u8; chunk_size as usize];
    let dot_len = needed(1);
    let dot = DirEntry {
        offset: 0,
        inode: dir_ino,
        rec_len: dot_len,
        name_len: 1,
        file_type: tag,
        name: b".".to_vec(),
    };
    dot.encode_into(&mut buf, lb)?;

    let dotdot = DirEntry {
        offset: dot_len,
        inode: parent_ino,
        rec_len: chunk_size - dot_len,
        name_len: 2,
        file_type: tag,
        name: b"..".to_vec(),
    };
    dotdot.encode_into(&mut buf, lb)?;

    host.commit_chunk(dir_ino, 0, &buf)?;
    cache.invalidate(0);
    Ok(())
}

/// `amnfs_empty_dir`: true iff every occupied entry is `.` or `..`.
pub fn empty_dir(host: &dyn Host, cache: &PageCache, dir_ino: u32) -> DirResult<bool> {
    let chunk_size = host.chunk_size();
    let lb = large_blocks(chunk_size);
    let i_size = host.i_size(dir_ino)?;
    let npages = i_size.div_ceil(chunk_size as u64);
    let mut dir_has_error = false;

    for n in 0..npages {
        let page = match cache.get_page(host, dir_ino, n, dir_has_error) {
            Ok(page) => page,
            Err(_) => {
                dir_has_error = true;
                continue;
            }
        };
        let bytes = page.read().bytes().to_vec();
        let limit = page.last_byte(i_size).saturating_sub(needed(1));
        let mut offs = 0u32;
        while offs <= limit {
            let entry = DirEntry::decode(&bytes, offs, lb)?;
            if entry.rec_len == 0 {
                host.report_error(dir_ino, "amnfs_empty_dir", "zero-length directory entry");
                return Ok(false);
            }
            if entry.inode != 0 {
                let name = &entry.name;
                if name.first() != Some(&b'.') {
                    return Ok(false);
                }
                if name.len() > 2 {
                    return Ok(false);
                }
                if name.len() < 2 {
                    if entry.inode != dir_ino {
                        return Ok(false);
                    }
                } else if name[1] != b'.' {
                    return Ok(false);
                }
            }
            offs += entry.rec_len;
        }
    }
    Ok(true)
}

/// `amnfs_rename`: move `name` from `old_dir_ino` to `new_name` under
/// `new_dir_ino`, handling the cross-directory `..` rewrite and an
/// existing target at the destination. Both directories are assumed
/// locked by the caller for the duration of the call; if they're the
/// same directory the caller must only acquire one lock.
#[allow(clippy::too_many_arguments)]
pub fn rename(
    host: &dyn Host,
    cache: &PageCache,
    old_dir_ino: u32,
    old_name: &[u8],
    new_dir_ino: u32,
    new_name: &[u8],
    old_inode: u32,
    old_inode_is_dir: bool,
    new_inode: Option<u32>,
) -> DirResult<()> {
    let old_found = find_entry(host, cache, old_dir_ino)
        .by_name(old_name)?
        .ok_or_else(|| DirError::not_found(format!("{old_name:?} not found in directory #{old_dir_ino}")))?;

    let dir_de = if old_inode_is_dir {
        Some(dotdot(host, cache, old_inode)?)
    } else {
        None
    };

    if let Some(new_inode) = new_inode {
        if dir_de.is_some() && !empty_dir(host, cache, new_inode)? {
            return Err(DirError::not_empty(format!(
                "directory #{new_inode} is not empty"
            )));
        }
        let new_found = find_entry(host, cache, new_dir_ino)
            .by_name(new_name)?
            .ok_or_else(|| {
                DirError::not_found(format!("{new_name:?} not found in directory #{new_dir_ino}"))
            })?;
        let old_mode = host.mode(old_inode)?;
        set_link(host, cache, new_dir_ino, &new_found, old_inode, old_mode, true)?;
        host.touch_ctime(new_inode)?;
        let mut links = host.links_count(new_inode)?;
        if dir_de.is_some() {
            links = links.saturating_sub(1);
        }
        links = links.saturating_sub(1);
        host.set_links_count(new_inode, links)?;
    } else {
        let old_mode = host.mode(old_inode)?;
        add_link(host, cache, new_dir_ino, new_name, old_inode, old_mode)?;
        if dir_de.is_some() {
            let links = host.links_count(new_dir_ino)? + 1;
            host.set_links_count(new_dir_ino, links)?;
        }
    }

    host.touch_ctime(old_inode)?;
    delete_entry(host, cache, old_dir_ino, &old_found)?;

    if let Some(dir_de) = dir_de {
        if old_dir_ino != new_dir_ino {
            set_link(host, cache, old_inode, &dir_de, new_dir_ino, host.mode(new_dir_ino)?, false)?;
        }
        let links = host.links_count(old_dir_ino)?.saturating_sub(1);
        host.set_links_count(old_dir_ino, links)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::EXT2_ROOT_INO;
    use crate::host::MemHost;

    const CHUNK: u32 = 1024;

    fn new_dir(host: &MemHost, cache: &PageCache, ino: u32, parent: u32) {
        host.create_inode(ino);
        make_empty(host, cache, ino, parent).unwrap();
    }

    #[test]
    fn create_then_lookup() {
        let host = MemHost::new(CHUNK);
        let cache = PageCache::new(CHUNK);
        new_dir(&host, &cache, EXT2_ROOT_INO, EXT2_ROOT_INO);

        add_link(&host, &cache, EXT2_ROOT_INO, b"hello", 12, 0o100644).unwrap();
        let found = inode_by_name(&host, &cache, EXT2_ROOT_INO, b"hello").unwrap();
        assert_eq!(found, Some(12));
        assert_eq!(inode_by_name(&host, &cache, EXT2_ROOT_INO, b"missing").unwrap(), None);
    }

    #[test]
    fn add_link_rejects_duplicate() {
        let host = MemHost::new(CHUNK);
        let cache = PageCache::new(CHUNK);
        new_dir(&host, &cache, EXT2_ROOT_INO, EXT2_ROOT_INO);
        add_link(&host, &cache, EXT2_ROOT_INO, b"a", 12, 0o100644).unwrap();
        let err = add_link(&host, &cache, EXT2_ROOT_INO, b"a", 13, 0o100644).unwrap_err();
        assert_eq!(err.kind, crate::error::DirErrorKind::Exists);
    }

    #[test]
    fn add_link_grows_directory_when_full() {
        let host = MemHost::new(CHUNK);
        let cache = PageCache::new(CHUNK);
        new_dir(&host, &cache, EXT2_ROOT_INO, EXT2_ROOT_INO);

        // Fill the root chunk with enough distinct short names to force
        // a second chunk to be allocated.
        let mut ino = 100u32;
        for i in 0..200 {
            let name = format!("f{i}");
            if add_link(&host, &cache, EXT2_ROOT_INO, name.as_bytes(), ino, 0o100644).is_err() {
                break;
            }
            ino += 1;
        }
        assert!(host.i_size(EXT2_ROOT_INO).unwrap() > CHUNK as u64);
    }

    #[test]
    fn delete_then_lookup_fails() {
        let host = MemHost::new(CHUNK);
        let cache = PageCache::new(CHUNK);
        new_dir(&host, &cache, EXT2_ROOT_INO, EXT2_ROOT_INO);
        add_link(&host, &cache, EXT2_ROOT_INO, b"victim", 12, 0o100644).unwrap();

        let found = find_entry(&host, &cache, EXT2_ROOT_INO).by_name(b"victim").unwrap().unwrap();
        delete_entry(&host, &cache, EXT2_ROOT_INO, &found).unwrap();
        assert_eq!(inode_by_name(&host, &cache, EXT2_ROOT_INO, b"victim").unwrap(), None);
    }

    #[test]
    fn empty_dir_true_for_fresh_directory() {
        let host = MemHost::new(CHUNK);
        let cache = PageCache::new(CHUNK);
        new_dir(&host, &cache, 50, EXT2_ROOT_INO);
        assert!(empty_dir(&host, &cache, 50).unwrap());

        add_link(&host, &cache, 50, b"child", 51, 0o100644).unwrap();
        assert!(!empty_dir(&host, &cache, 50).unwrap());
    }

    #[test]
    fn readdir_sees_dot_dotdot_and_children() {
        let host = MemHost::new(CHUNK);
        let cache = PageCache::new(CHUNK);
        new_dir(&host, &cache, EXT2_ROOT_INO, EXT2_ROOT_INO);
        add_link(&host, &cache, EXT2_ROOT_INO, b"a", 20, 0o100644).unwrap();
        add_link(&host, &cache, EXT2_ROOT_INO, b"b", 21, 0o100644).unwrap();

        let mut cursor = ReadCursor::default();
        let mut names = Vec::new();
        readdir(&host, &cache, EXT2_ROOT_INO, &mut cursor, |ino, _ft, name, _next_pos| {
            names.push((ino, name.to_vec()));
            true
        })
        .unwrap();

        assert_eq!(names.len(), 4);
        assert_eq!(names[0].1, b".");
        assert_eq!(names[1].1, b"..");
    }

    #[test]
    fn rename_moves_entry_across_directories() {
        let host = MemHost::new(CHUNK);
        let cache = PageCache::new(CHUNK);
        new_dir(&host, &cache, EXT2_ROOT_INO, EXT2_ROOT_INO);
        new_dir(&host, &cache, 30, EXT2_ROOT_INO);
        add_link(&host, &cache, EXT2_ROOT_INO, b"doc", 40, 0o100644).unwrap();

        rename(
            &host,
            &cache,
            EXT2_ROOT_INO,
            b"doc",
            30,
            b"doc2",
            40,
            false,
            None,
        )
        .unwrap();

        assert_eq!(inode_by_name(&host, &cache, EXT2_ROOT_INO, b"doc").unwrap(), None);
        assert_eq!(inode_by_name(&host, &cache, 30, b"doc2").unwrap(), Some(40));
    }
}
