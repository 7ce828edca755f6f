//! FUSE Frontend: translates kernel VFS calls into Directory Operations
//! calls over a `Host` + `PageCache`.
//!
//! Grounded in `examples/chiro2001-rfs/src/rfs_lib/fuse.rs`'s shape (one
//! `impl Filesystem for ...` block, a `prv!`-style trace on entry, a
//! `rep!`-style early-return-on-error helper) but targeting the
//! directory core built in this crate rather than a full inode layer.
//! Per spec.md §1 this is explicitly "the mount/CLI surface", an ambient
//! driver around the core rather than part of it; it implements only
//! enough of a regular file's read/write to exercise the directory
//! operations end to end (mirroring the host's own chunk storage for
//! file data, since a real block-mapped file layer is out of scope).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyWrite, Request,
};
use libc::ENOENT;
use log::{debug, warn};

use crate::desc::{self, FileType};
use crate::directory::{self, Found, ReadCursor};
use crate::error::DirErrorKind;
use crate::host::Host;
use crate::page::PageCache;

const TTL: Duration = Duration::from_secs(1);

fn to_host_ino(fuse_ino: u64) -> u32 {
    if fuse_ino == 1 {
        desc::EXT2_ROOT_INO
    } else {
        fuse_ino as u32
    }
}

fn to_fuse_ino(host_ino: u32) -> u64 {
    if host_ino == desc::EXT2_ROOT_INO {
        1
    } else {
        host_ino as u64
    }
}

fn errno_for(kind: DirErrorKind) -> i32 {
    match kind {
        DirErrorKind::NotFound => libc::ENOENT,
        DirErrorKind::Exists => libc::EEXIST,
        DirErrorKind::NotEmpty => libc::ENOTEMPTY,
        DirErrorKind::NameTooLong => libc::ENAMETOOLONG,
        DirErrorKind::NoMem => libc::ENOSPC,
        DirErrorKind::Io | DirErrorKind::Corruption => libc::EIO,
    }
}

fn fuse_file_type(ft: FileType) -> FuseFileType {
    match ft {
        FileType::Directory => FuseFileType::Directory,
        FileType::RegularFile => FuseFileType::RegularFile,
        FileType::CharDevice => FuseFileType::CharDevice,
        FileType::BlockDevice => FuseFileType::BlockDevice,
        FileType::Fifo => FuseFileType::NamedPipe,
        FileType::Socket => FuseFileType::Socket,
        FileType::Symlink => FuseFileType::Symlink,
        FileType::Unknown => FuseFileType::RegularFile,
    }
}

/// Mounted filesystem state: the host bridge, its page cache, and one
/// `Mutex<()>` per known directory inode so mutating Directory
/// Operations calls are serialized per-directory (spec.md §5 assigns
/// this lock to the caller, not to `Host`/`PageCache`).
pub struct AmnfsFs<H: Host> {
    host: H,
    cache: PageCache,
    dir_locks: Mutex<HashMap<u32, std::sync::Arc<Mutex<()>>>>,
}

impl<H: Host> AmnfsFs<H> {
    pub fn new(host: H) -> Self {
        let chunk_size = host.chunk_size();
        Self {
            host,
            cache: PageCache::new(chunk_size),
            dir_locks: Mutex::new(HashMap::new()),
        }
    }

    fn dir_lock(&self, ino: u32) -> std::sync::Arc<Mutex<()>> {
        self.dir_locks
            .lock()
            .unwrap()
            .entry(ino)
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    fn attr(&self, ino: u32) -> Result<FileAttr, i32> {
        let mode = self.host.mode(ino).map_err(|e| errno_for(e.kind))?;
        let size = self.host.i_size(ino).map_err(|e| errno_for(e.kind))?;
        let links = self.host.links_count(ino).map_err(|e| errno_for(e.kind))?;
        let kind = fuse_file_type(FileType::from_mode(mode));
        let now = SystemTime::now();
        Ok(FileAttr {
            ino: to_fuse_ino(ino),
            size,
            blocks: size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: (mode & 0xFFF) as u16,
            nlink: links as u32,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: self.host.chunk_size(),
            flags: 0,
        })
    }

    fn lookup_child(&self, parent: u32, name: &OsStr) -> Result<u32, i32> {
        let name = name.to_str().ok_or(libc::EINVAL)?.as_bytes();
        directory::inode_by_name(&self.host, &self.cache, parent, name)
            .map_err(|e| errno_for(e.kind))
            .and_then(|found| found.ok_or(ENOENT))
    }

    fn find(&self, parent: u32, name: &OsStr) -> Result<Found, i32> {
        let name = name.to_str().ok_or(libc::EINVAL)?.as_bytes();
        directory::find_entry(&self.host, &self.cache, parent)
            .by_name(name)
            .map_err(|e| errno_for(e.kind))
            .and_then(|found| found.ok_or(ENOENT))
    }

    fn make_node(&self, parent: u32, name: &OsStr, mode: u32) -> Result<u32, i32> {
        let name_bytes = name.to_str().ok_or(libc::EINVAL)?.as_bytes();
        let _guard = self.dir_lock(parent).lock().unwrap();
        let ino = self
            .host
            .alloc_inode(mode as u16)
            .map_err(|e| errno_for(e.kind))?;

        let is_dir = mode as u16 & 0xF000 == 0x4000;
        if is_dir {
            directory::make_empty(&self.host, &self.cache, ino, parent)
                .map_err(|e| errno_for(e.kind))?;
        }
        if let Err(e) = directory::add_link(&self.host, &self.cache, parent, name_bytes, ino, mode as u16) {
            let _ = self.host.free_inode(ino);
            return Err(errno_for(e.kind));
        }
        if is_dir {
            let links = self.host.links_count(parent).map_err(|e| errno_for(e.kind))? + 1;
            self.host
                .set_links_count(parent, links)
                .map_err(|e| errno_for(e.kind))?;
        }
        Ok(ino)
    }
}

impl<H: Host> Filesystem for AmnfsFs<H> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent = to_host_ino(parent);
        match self.lookup_child(parent, name) {
            Ok(ino) => match self.attr(ino) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(errno) => reply.error(errno),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.attr(to_host_ino(ino)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ino = to_host_ino(ino);
        if let Some(size) = size {
            if let Err(e) = self.host.set_i_size(ino, size) {
                reply.error(errno_for(e.kind));
                return;
            }
        }
        let _ = mode; // permission bits beyond the directory core are out of scope
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.make_node(to_host_ino(parent), name, mode) {
            Ok(ino) => match self.attr(ino) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(errno) => reply.error(errno),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.make_node(to_host_ino(parent), name, mode | 0x4000) {
            Ok(ino) => match self.attr(ino) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(errno) => reply.error(errno),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent = to_host_ino(parent);
        let found = match self.find(parent, name) {
            Ok(f) => f,
            Err(errno) => return reply.error(errno),
        };
        let _guard = self.dir_lock(parent).lock().unwrap();
        if let Err(e) = directory::delete_entry(&self.host, &self.cache, parent, &found) {
            return reply.error(errno_for(e.kind));
        }
        let _ = self.host.touch_ctime(found.entry.inode);
        let links = self
            .host
            .links_count(found.entry.inode)
            .unwrap_or(1)
            .saturating_sub(1);
        let _ = self.host.set_links_count(found.entry.inode, links);
        if links == 0 {
            let _ = self.host.free_inode(found.entry.inode);
        }
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent = to_host_ino(parent);
        let found = match self.find(parent, name) {
            Ok(f) => f,
            Err(errno) => return reply.error(errno),
        };
        match directory::empty_dir(&self.host, &self.cache, found.entry.inode) {
            Ok(true) => {}
            Ok(false) => return reply.error(libc::ENOTEMPTY),
            Err(e) => return reply.error(errno_for(e.kind)),
        }
        let _guard = self.dir_lock(parent).lock().unwrap();
        if let Err(e) = directory::delete_entry(&self.host, &self.cache, parent, &found) {
            return reply.error(errno_for(e.kind));
        }
        let _ = self.host.set_i_size(found.entry.inode, 0);
        let _ = self.host.set_links_count(found.entry.inode, 0);
        let _ = self.host.free_inode(found.entry.inode);
        let parent_links = self.host.links_count(parent).unwrap_or(1).saturating_sub(1);
        let _ = self.host.set_links_count(parent, parent_links);
        reply.ok();
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let old_dir = to_host_ino(parent);
        let new_dir = to_host_ino(newparent);
        let (Some(old_name), Some(new_name)) = (name.to_str(), newname.to_str()) else {
            return reply.error(libc::EINVAL);
        };

        let old_found = match self.find(old_dir, name) {
            Ok(f) => f,
            Err(errno) => return reply.error(errno),
        };
        let old_mode = self.host.mode(old_found.entry.inode).unwrap_or(0);
        let old_inode_is_dir = FileType::from_mode(old_mode).is_dir();
        let new_inode = self.lookup_child(new_dir, newname).ok();

        let _old_guard = self.dir_lock(old_dir).lock().unwrap();
        let _new_guard = if new_dir != old_dir {
            Some(self.dir_lock(new_dir).lock().unwrap())
        } else {
            None
        };

        let result = directory::rename(
            &self.host,
            &self.cache,
            old_dir,
            old_name.as_bytes(),
            new_dir,
            new_name.as_bytes(),
            old_found.entry.inode,
            old_inode_is_dir,
            new_inode,
        );
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno_for(e.kind)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ino = to_host_ino(ino);
        let i_size = match self.host.i_size(ino) {
            Ok(s) => s,
            Err(e) => return reply.error(errno_for(e.kind)),
        };
        let offset = offset as u64;
        if offset >= i_size {
            return reply.data(&[]);
        }
        let chunk_size = self.host.chunk_size() as u64;
        let to_read = (size as u64).min(i_size - offset);
        let mut out = Vec::with_capacity(to_read as usize);
        let mut pos = offset;
        while (pos - offset) < to_read {
            let index = pos / chunk_size;
            let within = (pos % chunk_size) as usize;
            match self.host.read_chunk(ino, index) {
                Ok(bytes) => {
                    let take = ((to_read - (pos - offset)) as usize).min(bytes.len() - within);
                    out.extend_from_slice(&bytes[within..within + take]);
                    pos += take as u64;
                }
                Err(e) => return reply.error(errno_for(e.kind)),
            }
        }
        reply.data(&out);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let ino = to_host_ino(ino);
        if let Err(e) = self.host.prepare_chunk(ino, offset as u64, data.len() as u32) {
            return reply.error(errno_for(e.kind));
        }
        if let Err(e) = self.host.commit_chunk(ino, offset as u64, data) {
            return reply.error(errno_for(e.kind));
        }
        reply.written(data.len() as u32);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let ino = to_host_ino(ino);
        let mut cursor = ReadCursor {
            pos: offset as u64,
            version: self.host.version(ino).unwrap_or(0),
        };
        let result = directory::readdir(&self.host, &self.cache, ino, &mut cursor, |child_ino, file_type, name, next_pos| {
            let kind = fuse_file_type(FileType::from_tag(file_type));
            let name = String::from_utf8_lossy(name).to_string();
            !reply.add(to_fuse_ino(child_ino), next_pos as i64, kind, name)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("readdir #{ino} failed: {e}");
                reply.error(errno_for(e.kind));
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create {:?} in #{}", name, parent);
        match self.make_node(to_host_ino(parent), name, mode) {
            Ok(ino) => match self.attr(ino) {
                Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
                Err(errno) => reply.error(errno),
            },
            Err(errno) => reply.error(errno),
        }
    }
}
