//! Deferred picture write-back.
//!
//! Mutated pictures are queued by id with the earliest time they may be
//! written. A single worker per bank pops due entries and persists them once
//! they have been left alone for the write delay, so a burst of edits costs
//! one SQL update and one index update.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::cache::PictureCache;
use super::picture::{now_millis, Picture, PictureRecord, WriteBack};
use crate::db::Database;
use crate::error::BankError;
use crate::index::Indexer;
use crate::tags::TagRepository;

#[derive(Default)]
struct QueueState {
    /// Min-heap of `(not_before, id)`.
    heap: BinaryHeap<Reverse<(i64, String)>>,
    pending: HashSet<String>,
    stopped: bool,
}

pub(crate) struct UpdateQueue {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    delay_ms: i64,
}

impl UpdateQueue {
    pub fn new(delay_ms: i64) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
            delay_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn delay_ms(&self) -> i64 {
        self.delay_ms
    }

    /// Queue `id`, modified at `modified_ts`. An id already waiting keeps its
    /// slot; the worker notices the newer modification when it pops it.
    pub fn schedule(&self, id: &str, modified_ts: i64) {
        self.schedule_at(id, modified_ts.saturating_add(self.delay_ms));
    }

    pub fn schedule_at(&self, id: &str, not_before: i64) {
        let mut state = self.lock();
        if state.stopped || state.pending.contains(id) {
            return;
        }
        state.pending.insert(id.to_string());
        state.heap.push(Reverse((not_before, id.to_string())));
        self.wakeup.notify_all();
    }

    /// Block until an entry is due and return its id, or `None` once stopped.
    pub fn take(&self) -> Option<String> {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return None;
            }
            let next_due = state.heap.peek().map(|Reverse((not_before, _))| *not_before);
            match next_due {
                None => {
                    state = self.wakeup.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Some(not_before) => {
                    let now = now_millis();
                    if not_before <= now {
                        let Some(Reverse((_, id))) = state.heap.pop() else {
                            continue;
                        };
                        state.pending.remove(&id);
                        return Some(id);
                    }
                    let wait = Duration::from_millis((not_before - now) as u64);
                    state = self
                        .wakeup
                        .wait_timeout(state, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
    }

    /// Empty the queue, returning every waiting id.
    pub fn drain(&self) -> Vec<String> {
        let mut state = self.lock();
        state.pending.clear();
        state
            .heap
            .drain()
            .map(|Reverse((_, id))| id)
            .collect()
    }

    /// Wake the worker and make it exit. Later schedules are ignored.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.wakeup.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }
}

/// Write-back counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
}

/// Writes pictures to SQL and the index.
pub(crate) struct Persister {
    bank_id: u32,
    db: Arc<Database>,
    indexer: Arc<Indexer>,
    tags: Arc<TagRepository>,
    counters: Counters,
}

impl Persister {
    pub fn new(
        bank_id: u32,
        db: Arc<Database>,
        indexer: Arc<Indexer>,
        tags: Arc<TagRepository>,
    ) -> Self {
        Self {
            bank_id,
            db,
            indexer,
            tags,
            counters: Counters::default(),
        }
    }

    fn store(&self, record: &mut PictureRecord) -> Result<(), BankError> {
        // A tag removed while the picture was dirty must not come back
        let before = record.tags.len();
        record.tags.retain(|tag_id| self.tags.has_tag(*tag_id));
        if record.tags.len() != before {
            tracing::warn!(
                bank_id = self.bank_id,
                picture_id = %record.id,
                dropped = before - record.tags.len(),
                "Dropped assignments of removed tags"
            );
        }
        self.db.update_picture(record)?;
        self.indexer.index_picture(record)?;
        Ok(())
    }

    /// Write `picture` back if it is dirty (and due, given a delay).
    /// Failures are logged and counted; the picture stays dirty.
    pub fn write_back(&self, picture: &Picture, delay: Option<i64>) -> WriteBack {
        match picture.write_back(delay, now_millis(), |record| self.store(record)) {
            Ok(WriteBack::Written) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    bank_id = self.bank_id,
                    picture_id = %picture.id(),
                    "Picture written back"
                );
                WriteBack::Written
            }
            Ok(outcome) => outcome,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    bank_id = self.bank_id,
                    picture_id = %picture.id(),
                    error = %e,
                    "Picture write-back failed"
                );
                WriteBack::Clean
            }
        }
    }

    pub fn stats(&self) -> UpdateStats {
        UpdateStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Start the update worker of a bank.
pub(crate) fn spawn_worker(
    bank_id: u32,
    queue: Arc<UpdateQueue>,
    cache: Arc<PictureCache>,
    persister: Arc<Persister>,
    span: tracing::Span,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("picbank-updater-{bank_id}"))
        .spawn(move || {
            let _enter = span.enter();
            tracing::debug!("Update worker started");

            while let Some(id) = queue.take() {
                // Evicted pictures were written back on the way out
                let Some(picture) = cache.get_if_present(&id) else {
                    continue;
                };
                if let WriteBack::Deferred(not_before) =
                    persister.write_back(&picture, Some(queue.delay_ms()))
                {
                    queue.schedule_at(&id, not_before);
                }
            }

            tracing::debug!("Update worker stopped");
        })
}
