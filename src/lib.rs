//! AMNFS directory subsystem: Record Codec, Page View, Directory
//! Operations, and the Host Bridge contract, plus a FUSE frontend that
//! exercises them end to end.

pub mod desc;
pub mod dirent;
pub mod directory;
pub mod error;
pub mod fuse_fs;
pub mod host;
pub mod page;
