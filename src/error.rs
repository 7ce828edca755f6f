//! Typed errors for the directory subsystem.
//!
//! `DirError` covers the kinds spec.md §7 names. It implements
//! `std::error::Error` so it composes with `anyhow::Error` at the host
//! adapter / CLI boundary the same way `chiro2001-rfs` lets its own
//! internal errors flow into `anyhow::Result` call sites.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirErrorKind {
    /// No entry with the requested name exists.
    NotFound,
    /// An entry with that name already exists.
    Exists,
    /// Directory still has entries other than `.`/`..`.
    NotEmpty,
    /// Name exceeds `EXT2_NAME_LEN`.
    NameTooLong,
    /// Directory has no room left and cannot grow (host out of blocks).
    NoMem,
    /// Underlying storage I/O failed.
    Io,
    /// On-disk directory data failed validation (see `page::validate_page`).
    /// Always surfaced to callers as `Io` after being reported once via
    /// `Host::report_error`, per spec.md §7.
    Corruption,
}

impl fmt::Display for DirErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DirErrorKind::NotFound => "not found",
            DirErrorKind::Exists => "already exists",
            DirErrorKind::NotEmpty => "directory not empty",
            DirErrorKind::NameTooLong => "name too long",
            DirErrorKind::NoMem => "no space left",
            DirErrorKind::Io => "i/o error",
            DirErrorKind::Corruption => "corrupted directory data",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DirError {
    pub kind: DirErrorKind,
    pub message: String,
}

impl DirError {
    pub fn new(kind: DirErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DirErrorKind::NotFound, message)
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(DirErrorKind::Exists, message)
    }

    pub fn not_empty(message: impl Into<String>) -> Self {
        Self::new(DirErrorKind::NotEmpty, message)
    }

    pub fn name_too_long(message: impl Into<String>) -> Self {
        Self::new(DirErrorKind::NameTooLong, message)
    }

    pub fn no_mem(message: impl Into<String>) -> Self {
        Self::new(DirErrorKind::NoMem, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(DirErrorKind::Io, message)
    }

    /// Corruption is always reported at the detection site before being
    /// constructed here, then surfaced to the caller as a plain I/O
    /// error (spec.md §7).
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(DirErrorKind::Io, message)
    }
}

impl fmt::Display for DirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DirError {}

pub type DirResult<T> = Result<T, DirError>;
