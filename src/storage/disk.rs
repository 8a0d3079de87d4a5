use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Synchronous, positional file access for a single database file.
///
/// This is the lowest layer: it knows nothing about pages, only bytes at
/// offsets. Short reads past end-of-file are zero-filled rather than
/// treated as errors, matching what the page manager expects when growing
/// the file via `allocate`.
pub struct FileIo {
    file: File,
}

impl FileIo {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        if offset >= file_len {
            buf.fill(0);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let available = (file_len - offset).min(buf.len() as u64) as usize;
        self.file.read_exact(&mut buf[..available])?;
        if available < buf.len() {
            buf[available..].fill(0);
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn length(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_length(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileIo::open(dir.path().join("data.db")).unwrap();
        io.write_at(0, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn short_read_past_eof_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = FileIo::open(dir.path().join("data.db")).unwrap();
        io.write_at(0, b"ab").unwrap();
        let mut buf = [0xFFu8; 8];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[0..2], b"ab");
        assert_eq!(&buf[2..], &[0u8; 6]);
    }
}
