use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};

use crate::{DiskConst, DiskDriver, DiskInfo, SeekType};

/// Default size of the backing file when none exists yet.
const DEFAULT_DISK_SIZE: u64 = 64 * 0x400 * 0x400;

/// Disk driver backed by a real file on the host filesystem.
///
/// This is the driver the CLI mounts with: `path` names a regular file
/// (or a block device node) that stands in for the storage medium.
pub struct FileDiskDriver {
    info: DiskInfo,
    file: Option<File>,
}

impl FileDiskDriver {
    pub fn new() -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst {
                    layout_size: DEFAULT_DISK_SIZE,
                    ..Default::default()
                },
            },
            file: None,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .context("disk driver used before ddriver_open")
    }
}

impl Default for FileDiskDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskDriver for FileDiskDriver {
    fn ddriver_open(&mut self, path: &str) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("opening backing file {path}"))?;
        let len = file.metadata()?.len();
        if len < self.info.consts.layout_size {
            file.set_len(self.info.consts.layout_size)?;
        } else {
            self.info.consts.layout_size = len;
        }
        self.file = Some(file);
        Ok(())
    }

    fn ddriver_close(&mut self) -> Result<()> {
        if let Some(mut f) = self.file.take() {
            f.flush()?;
        }
        Ok(())
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.info.stats.seek_cnt += 1;
        let layout_size = self.info.consts.layout_size;
        let pos = self.file_mut()?.seek(match whence {
            SeekType::Set => SeekFrom::Start(offset as u64),
            SeekType::Cur => SeekFrom::Current(offset),
            SeekType::End => SeekFrom::Start(layout_size.saturating_sub(offset as u64)),
        })?;
        Ok(pos)
    }

    fn ddriver_write(&mut self, buf: &[u8]) -> Result<usize> {
        self.info.stats.write_cnt += 1;
        self.file_mut()?.write_all(buf)?;
        Ok(buf.len())
    }

    fn ddriver_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.info.stats.read_cnt += 1;
        self.file_mut()?.read_exact(buf)?;
        Ok(buf.len())
    }

    fn ddriver_flush(&mut self) -> Result<()> {
        self.file_mut()?.flush()?;
        Ok(())
    }

    fn info(&self) -> &DiskInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");
        let mut driver = FileDiskDriver::new();
        driver.ddriver_open(path.to_str().unwrap())?;
        driver.ddriver_seek(0, SeekType::Set)?;
        driver.ddriver_write(b"hello")?;
        driver.ddriver_seek(0, SeekType::Set)?;
        let mut buf = [0u8; 5];
        driver.ddriver_read(&mut buf)?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }
}
