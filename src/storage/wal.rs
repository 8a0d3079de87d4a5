use super::checksum::crc32;
use super::disk::FileIo;
use super::page::PageId;
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// WAL record kind, stored as a single byte in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Begin = 0,
    PagePreImage = 1,
    PagePostImage = 2,
    FreePage = 3,
    AllocPage = 4,
    Commit = 5,
    Rollback = 6,
    Checkpoint = 7,
}

impl RecordKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => RecordKind::Begin,
            1 => RecordKind::PagePreImage,
            2 => RecordKind::PagePostImage,
            3 => RecordKind::FreePage,
            4 => RecordKind::AllocPage,
            5 => RecordKind::Commit,
            6 => RecordKind::Rollback,
            7 => RecordKind::Checkpoint,
            other => return Err(DbError::Serialization(format!("unknown WAL record kind {other}"))),
        })
    }
}

/// A single logical WAL entry, without its assigned LSN.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub txn_id: u64,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(txn_id: u64, kind: RecordKind, payload: Vec<u8>) -> Self {
        Self { txn_id, kind, payload }
    }

    /// Frame: `[u32 totalLen][u64 LSN][u64 txnId][u8 kind][u32 payloadLen]
    /// [payload][u32 CRC32 of all preceding fields]`. `payloadLen` is a full
    /// `u32` rather than `u16` so a `PagePreImage`/`PagePostImage` record can
    /// carry an entire page even at the largest configurable page size.
    fn encode(&self, lsn: u64) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + 8 + 1 + 4 + self.payload.len());
        body.extend_from_slice(&lsn.to_le_bytes());
        body.extend_from_slice(&self.txn_id.to_le_bytes());
        body.push(self.kind as u8);
        body.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&self.payload);

        let total_len = 4 + body.len() + 4;
        let mut frame = Vec::with_capacity(total_len);
        frame.extend_from_slice(&(total_len as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        let sum = crc32(&frame);
        frame.extend_from_slice(&sum.to_le_bytes());
        frame
    }
}

/// A record read back from the log, with its assigned LSN.
#[derive(Debug, Clone)]
pub struct ReplayedRecord {
    pub lsn: u64,
    pub txn_id: u64,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

/// Encodes a `PagePreImage`/`PagePostImage` payload: the page id followed by
/// that page's full on-disk bytes.
pub fn encode_page_image(page_id: PageId, bytes: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + bytes.len());
    payload.extend_from_slice(&page_id.to_le_bytes());
    payload.extend_from_slice(bytes);
    payload
}

/// Inverse of [`encode_page_image`].
pub fn decode_page_image(payload: &[u8]) -> Result<(PageId, &[u8])> {
    if payload.len() < 4 {
        return Err(DbError::Serialization("page image payload shorter than a page id".into()));
    }
    let page_id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    Ok((page_id, &payload[4..]))
}

struct Inner {
    io: FileIo,
    next_lsn: u64,
    write_offset: u64,
    flushed_lsn: u64,
}

/// Append-only write-ahead log, sibling of the main database file.
///
/// The appender is single-threaded: every `append` call takes the same
/// internal lock, so record order on disk matches LSN order exactly.
pub struct WalManager {
    inner: Mutex<Inner>,
}

impl WalManager {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut io = FileIo::open(path)?;
        let write_offset = io.length()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                io,
                next_lsn: 1,
                write_offset,
                flushed_lsn: 0,
            }),
        })
    }

    pub fn companion_path(main_path: impl AsRef<Path>) -> PathBuf {
        let main_path = main_path.as_ref();
        let stem = main_path.file_stem().and_then(|s| s.to_str()).unwrap_or("db");
        let ext = main_path.extension().and_then(|s| s.to_str()).unwrap_or("tinydb");
        main_path.with_file_name(format!("{stem}-wal.{ext}"))
    }

    #[instrument(skip(self, record))]
    pub fn append(&self, record: LogRecord) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let frame = record.encode(lsn);
        let offset = inner.write_offset;
        inner.io.write_at(offset, &frame)?;
        inner.write_offset += frame.len() as u64;
        debug!(lsn, kind = ?record.kind, "appended WAL record");
        Ok(lsn)
    }

    #[instrument(skip(self))]
    pub fn flush_until(&self, lsn: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.flushed_lsn >= lsn {
            return Ok(());
        }
        inner.io.flush()?;
        inner.flushed_lsn = inner.next_lsn.saturating_sub(1);
        Ok(())
    }

    pub fn flushed_lsn(&self) -> u64 {
        self.inner.lock().flushed_lsn
    }

    pub fn last_lsn(&self) -> u64 {
        self.inner.lock().next_lsn.saturating_sub(1)
    }

    /// Scans the whole log from the start, calling `visitor` for each intact
    /// record in order. Stops at the first truncated or checksum-failing
    /// record and treats everything after it as lost.
    #[instrument(skip(self, visitor))]
    pub fn replay(&self, mut visitor: impl FnMut(ReplayedRecord)) -> Result<()> {
        let mut inner = self.inner.lock();
        let len = inner.io.length()?;
        let mut offset = 0u64;
        let mut max_lsn = 0u64;
        while offset + 4 <= len {
            let mut len_buf = [0u8; 4];
            inner.io.read_at(offset, &mut len_buf)?;
            let total_len = u32::from_le_bytes(len_buf) as u64;
            if total_len < 4 + 8 + 8 + 1 + 4 + 4 || offset + total_len > len {
                warn!(offset, "WAL truncated, stopping replay");
                break;
            }
            let mut frame = vec![0u8; total_len as usize];
            inner.io.read_at(offset, &mut frame)?;
            let stored_crc = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
            let computed = crc32(&frame[..frame.len() - 4]);
            if stored_crc != computed {
                warn!(offset, "WAL record failed checksum, stopping replay");
                break;
            }
            let lsn = u64::from_le_bytes(frame[4..12].try_into().unwrap());
            let txn_id = u64::from_le_bytes(frame[12..20].try_into().unwrap());
            let kind = RecordKind::from_u8(frame[20])?;
            let payload_len = u32::from_le_bytes(frame[21..25].try_into().unwrap()) as usize;
            let payload = frame[25..25 + payload_len].to_vec();
            max_lsn = max_lsn.max(lsn);
            visitor(ReplayedRecord { lsn, txn_id, kind, payload });
            offset += total_len;
        }
        inner.write_offset = offset;
        inner.next_lsn = max_lsn + 1;
        inner.flushed_lsn = max_lsn;
        Ok(())
    }

    /// Truncates the log to just the checkpoint record, discarding history
    /// the caller has confirmed is reflected in flushed data pages.
    pub fn checkpoint(&self, txn_id: u64) -> Result<u64> {
        let lsn = self.append(LogRecord::new(txn_id, RecordKind::Checkpoint, Vec::new()))?;
        self.flush_until(lsn)?;
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalManager::open(dir.path().join("db-wal.tinydb")).unwrap();
        wal.append(LogRecord::new(1, RecordKind::Begin, Vec::new())).unwrap();
        let lsn2 = wal.append(LogRecord::new(1, RecordKind::Commit, vec![9, 9])).unwrap();
        wal.flush_until(lsn2).unwrap();

        let mut seen = Vec::new();
        wal.replay(|rec| seen.push(rec)).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].payload, vec![9, 9]);
        assert_eq!(seen[1].kind, RecordKind::Commit);
    }

    #[test]
    fn replay_stops_at_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db-wal.tinydb");
        let wal = WalManager::open(&path).unwrap();
        wal.append(LogRecord::new(1, RecordKind::Begin, Vec::new())).unwrap();
        drop(wal);

        // Append a few garbage bytes that look like the start of a frame
        // but are cut short, simulating a crash mid-write.
        let mut io = FileIo::open(&path).unwrap();
        let len = io.length().unwrap();
        io.write_at(len, &[0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3]).unwrap();

        let wal = WalManager::open(&path).unwrap();
        let mut seen = Vec::new();
        wal.replay(|rec| seen.push(rec)).unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn companion_path_follows_template() {
        let p = WalManager::companion_path("/tmp/mydb.tinydb");
        assert_eq!(p, std::path::PathBuf::from("/tmp/mydb-wal.tinydb"));
    }
}
