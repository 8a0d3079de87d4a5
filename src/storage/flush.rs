use super::pager::PageManager;
use super::wal::WalManager;
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{instrument, trace};

/// Tracks the group-commit leader/follower protocol for journal flushes.
struct GroupCommitState {
    flushed_lsn: u64,
    in_progress: bool,
}

/// Durability level requested for a single commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConcern {
    /// Return immediately; durability is best-effort.
    None,
    /// Wait until the WAL record is durable.
    #[default]
    Journaled,
    /// Like `Journaled`, then also flush every dirty page touched by the
    /// commit.
    Synced,
}

/// Coalesces commit flushes and runs a background flusher for pages the
/// foreground path never touches again.
pub struct FlushScheduler {
    pager: Arc<PageManager>,
    wal: Arc<WalManager>,
    journal_flush_delay: Duration,
    last_synced_lsn: AtomicU64,
    group_commit: Mutex<GroupCommitState>,
    group_commit_done: Condvar,
    background: Option<(JoinHandle<()>, Arc<AtomicBool>)>,
}

impl FlushScheduler {
    pub fn new(
        pager: Arc<PageManager>,
        wal: Arc<WalManager>,
        journal_flush_delay: Duration,
        background_flush_interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let bg_pager = pager.clone();
        let bg_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("embeddb-flusher".into())
            .spawn(move || {
                while !bg_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(background_flush_interval);
                    if bg_stop.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(err) = bg_pager.flush_all_dirty() {
                        tracing::warn!(?err, "background flush failed");
                    }
                }
            })
            .expect("spawning background flush thread");

        Self {
            pager,
            wal,
            journal_flush_delay,
            last_synced_lsn: AtomicU64::new(0),
            group_commit: Mutex::new(GroupCommitState { flushed_lsn: 0, in_progress: false }),
            group_commit_done: Condvar::new(),
            background: Some((handle, stop)),
        }
    }

    pub fn journal_flush_delay(&self) -> Duration {
        self.journal_flush_delay
    }

    /// Applies the requested write concern for a commit whose WAL record is
    /// `commit_lsn` and whose dirty pages are `dirty_pages`.
    #[instrument(skip(self, dirty_pages))]
    pub fn commit(&self, concern: WriteConcern, commit_lsn: u64, dirty_pages: &[u32]) -> Result<()> {
        match concern {
            WriteConcern::None => {
                trace!(commit_lsn, "write concern None, returning without waiting");
            }
            WriteConcern::Journaled => {
                self.group_flush(commit_lsn)?;
            }
            WriteConcern::Synced => {
                self.group_flush(commit_lsn)?;
                for &page_id in dirty_pages {
                    self.pager.flush_page(page_id)?;
                }
                self.pager.sync()?;
                self.last_synced_lsn.store(commit_lsn, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Batches concurrent commits that arrive within `journal_flush_delay`
    /// of each other into one physical WAL flush. The first caller to find
    /// `commit_lsn` unflushed becomes the leader: it waits out the
    /// coalescing window, then flushes everything appended by the time it
    /// wakes (covering every follower that arrived during the wait), not
    /// just its own record. Followers block on the condvar and simply
    /// recheck once woken, becoming the next leader if their own LSN still
    /// isn't covered.
    #[instrument(skip(self))]
    fn group_flush(&self, commit_lsn: u64) -> Result<()> {
        let mut state = self.group_commit.lock();
        loop {
            if state.flushed_lsn >= commit_lsn {
                return Ok(());
            }
            if state.in_progress {
                self.group_commit_done.wait(&mut state);
                continue;
            }
            state.in_progress = true;
            drop(state);

            std::thread::sleep(self.journal_flush_delay);
            let target = self.wal.last_lsn();
            self.wal.flush_until(target)?;

            state = self.group_commit.lock();
            state.flushed_lsn = state.flushed_lsn.max(target);
            state.in_progress = false;
            self.group_commit_done.notify_all();
            if state.flushed_lsn >= commit_lsn {
                return Ok(());
            }
        }
    }

    pub fn last_synced_lsn(&self) -> u64 {
        self.last_synced_lsn.load(Ordering::Relaxed)
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        if let Some((handle, stop)) = self.background.take() {
            stop.store(true, Ordering::Relaxed);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    #[test]
    fn synced_commit_flushes_pages_and_wal() {
        let dir = tempfile::tempdir().unwrap();
        let pager = Arc::new(PageManager::open(dir.path().join("data.db"), 4096, 16).unwrap());
        let wal = Arc::new(WalManager::open(dir.path().join("data-wal.db")).unwrap());
        let id = pager.allocate(PageType::Data).unwrap();
        let lsn = wal
            .append(crate::storage::wal::LogRecord::new(
                1,
                crate::storage::wal::RecordKind::Commit,
                Vec::new(),
            ))
            .unwrap();

        let scheduler = FlushScheduler::new(pager.clone(), wal.clone(), Duration::from_millis(1), Duration::from_secs(60));
        scheduler.commit(WriteConcern::Synced, lsn, &[id]).unwrap();
        assert_eq!(wal.flushed_lsn(), lsn);
        assert_eq!(scheduler.last_synced_lsn(), lsn);
    }
}
