use anyhow::{bail, Result};

use crate::{DiskConst, DiskDriver, DiskInfo, SeekType};

/// Disk driver backed by an owned in-memory buffer.
///
/// Used by the `MemHost` test harness and by this crate's own unit
/// tests; nothing here is persisted.
pub struct MemoryDiskDriver {
    info: DiskInfo,
    mem: Vec<u8>,
    pointer: usize,
}

impl MemoryDiskDriver {
    pub fn new(size: u64) -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst {
                    layout_size: size,
                    ..Default::default()
                },
            },
            mem: vec![0u8; size as usize],
            pointer: 0,
        }
    }
}

impl Default for MemoryDiskDriver {
    fn default() -> Self {
        Self::new(DiskConst::default().layout_size)
    }
}

impl DiskDriver for MemoryDiskDriver {
    fn ddriver_open(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn ddriver_close(&mut self) -> Result<()> {
        Ok(())
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.info.stats.seek_cnt += 1;
        let layout_size = self.info.consts.layout_size as i64;
        let pos = match whence {
            SeekType::Set => offset,
            SeekType::Cur => self.pointer as i64 + offset,
            SeekType::End => layout_size - offset,
        };
        if pos < 0 || pos as u64 > self.info.consts.layout_size {
            bail!("seek out of range: {pos}");
        }
        self.pointer = pos as usize;
        Ok(self.pointer as u64)
    }

    fn ddriver_write(&mut self, buf: &[u8]) -> Result<usize> {
        self.info.stats.write_cnt += 1;
        if self.pointer + buf.len() > self.mem.len() {
            bail!("write past end of memory disk");
        }
        self.mem[self.pointer..self.pointer + buf.len()].copy_from_slice(buf);
        self.pointer += buf.len();
        Ok(buf.len())
    }

    fn ddriver_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.info.stats.read_cnt += 1;
        if self.pointer + buf.len() > self.mem.len() {
            bail!("read past end of memory disk");
        }
        buf.copy_from_slice(&self.mem[self.pointer..self.pointer + buf.len()]);
        self.pointer += buf.len();
        Ok(buf.len())
    }

    fn ddriver_flush(&mut self) -> Result<()> {
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
        let mut driver = MemoryDiskDriver::new(4096);
        driver.ddriver_seek(0, SeekType::Set)?;
        driver.ddriver_write(b"abc")?;
        driver.ddriver_seek(0, SeekType::Set)?;
        let mut buf = [0u8; 3];
        driver.ddriver_read(&mut buf)?;
        assert_eq!(&buf, b"abc");
        Ok(())
    }

    #[test]
    fn write_past_end_fails() {
        let mut driver = MemoryDiskDriver::new(4);
        driver.ddriver_seek(0, SeekType::Set).unwrap();
        assert!(driver.ddriver_write(b"abcde").is_err());
    }
}
