//! Pictures and their in-memory state.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::updater::UpdateQueue;
use crate::error::PictureError;
use crate::tags::{Tag, TagId};

pub const MAX_GRADE: u8 = 5;

/// Persisted attributes of a picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureRecord {
    /// Uppercase hex SHA-256 of the file content.
    pub id: String,
    pub original_name: String,
    pub width: u32,
    pub height: u32,
    /// Epoch milliseconds.
    pub added_ts: i64,
    pub creation_ts: i64,
    /// Bumped by every grade or tag change; never decreases.
    pub modified_ts: i64,
    pub grade: u8,
    pub tags: BTreeSet<TagId>,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of a write-back attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteBack {
    /// Nothing to write.
    Clean,
    /// Modified too recently; try again at the given time.
    Deferred(i64),
    Written,
}

struct PictureState {
    record: PictureRecord,
    dirty: bool,
}

struct PictureInner {
    id: String,
    state: Mutex<PictureState>,
    updates: Arc<UpdateQueue>,
}

/// Shared handle to a cached picture.
///
/// Clones refer to the same state. Every mutation happens under the
/// picture's own lock, marks it dirty and queues it for a deferred
/// write-back.
#[derive(Clone)]
pub struct Picture {
    inner: Arc<PictureInner>,
}

impl std::fmt::Debug for Picture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Picture")
            .field("record", &state.record)
            .field("dirty", &state.dirty)
            .finish()
    }
}

impl Picture {
    pub(crate) fn new(record: PictureRecord, updates: Arc<UpdateQueue>) -> Self {
        Self {
            inner: Arc::new(PictureInner {
                id: record.id.clone(),
                state: Mutex::new(PictureState {
                    record,
                    dirty: false,
                }),
                updates,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PictureState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Snapshot of the current attributes.
    pub fn record(&self) -> PictureRecord {
        self.lock().record.clone()
    }

    pub fn grade(&self) -> u8 {
        self.lock().record.grade
    }

    pub fn tags(&self) -> BTreeSet<TagId> {
        self.lock().record.tags.clone()
    }

    pub fn has_tag(&self, tag_id: TagId) -> bool {
        self.lock().record.tags.contains(&tag_id)
    }

    pub fn modified_ts(&self) -> i64 {
        self.lock().record.modified_ts
    }

    /// True while in-memory state differs from what was last persisted.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn same_as(&self, other: &Picture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Apply `change` under the lock. When it reports a change, bump the
    /// modification time, mark dirty and queue the picture. Edits are refused
    /// once the bank's queue is stopped.
    fn mutate<F>(&self, change: F) -> Result<(), PictureError>
    where
        F: FnOnce(&mut PictureRecord) -> bool,
    {
        let modified_ts = {
            let mut state = self.lock();
            if self.inner.updates.is_stopped() {
                return Err(PictureError::Closed(self.id().to_string()));
            }
            if !change(&mut state.record) {
                return Ok(());
            }
            state.record.modified_ts = now_millis().max(state.record.modified_ts);
            state.dirty = true;
            state.record.modified_ts
        };
        self.inner.updates.schedule(self.id(), modified_ts);
        Ok(())
    }

    pub fn set_grade(&self, grade: u8) -> Result<(), PictureError> {
        if grade > MAX_GRADE {
            return Err(PictureError::InvalidGrade(grade));
        }
        self.mutate(|record| {
            let changed = record.grade != grade;
            record.grade = grade;
            changed
        })
    }

    pub fn add_tag(&self, tag: &Tag) -> Result<(), PictureError> {
        if !tag.selectable {
            return Err(PictureError::UnselectableTag(tag.id));
        }
        self.mutate(|record| record.tags.insert(tag.id))
    }

    pub fn remove_tag(&self, tag_id: TagId) -> Result<(), PictureError> {
        self.mutate(|record| record.tags.remove(&tag_id))
    }

    /// Replace every tag at once.
    pub fn set_tag_list(&self, tags: &[Tag]) -> Result<(), PictureError> {
        if let Some(tag) = tags.iter().find(|t| !t.selectable) {
            return Err(PictureError::UnselectableTag(tag.id));
        }
        let tags: BTreeSet<TagId> = tags.iter().map(|t| t.id).collect();
        self.mutate(|record| {
            let changed = record.tags != tags;
            record.tags = tags;
            changed
        })
    }

    /// Drop a deleted tag. The store already forgot the assignment, so this
    /// neither dirties nor queues the picture.
    pub(crate) fn forget_tag(&self, tag_id: TagId) -> bool {
        self.lock().record.tags.remove(&tag_id)
    }

    /// Persist the picture with `write` while holding its lock.
    ///
    /// With a `delay`, a picture modified less than `delay` ms before `now`
    /// is left alone and [`WriteBack::Deferred`] tells when to come back.
    pub(crate) fn write_back<E, F>(
        &self,
        delay: Option<i64>,
        now: i64,
        write: F,
    ) -> Result<WriteBack, E>
    where
        F: FnOnce(&mut PictureRecord) -> Result<(), E>,
    {
        let mut state = self.lock();
        if !state.dirty {
            return Ok(WriteBack::Clean);
        }
        if let Some(delay) = delay {
            let due = state.record.modified_ts.saturating_add(delay);
            if due > now {
                return Ok(WriteBack::Deferred(due));
            }
        }
        write(&mut state.record)?;
        state.dirty = false;
        Ok(WriteBack::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::ROOT_TAG_ID;

    fn record() -> PictureRecord {
        PictureRecord {
            id: "AB12".to_string(),
            original_name: "cat.png".to_string(),
            width: 10,
            height: 20,
            added_ts: 1_000,
            creation_ts: 1_000,
            modified_ts: 1_000,
            grade: 0,
            tags: BTreeSet::new(),
        }
    }

    fn tag(id: TagId, selectable: bool) -> Tag {
        Tag {
            id,
            name: format!("tag{id}"),
            description: String::new(),
            parent_id: Some(ROOT_TAG_ID),
            selectable,
            editable: true,
        }
    }

    fn picture() -> (Picture, Arc<UpdateQueue>) {
        let queue = Arc::new(UpdateQueue::new(60_000));
        (Picture::new(record(), queue.clone()), queue)
    }

    #[test]
    fn test_set_grade() {
        let (picture, queue) = picture();
        assert!(!picture.is_dirty());

        picture.set_grade(4).unwrap();
        assert_eq!(picture.grade(), 4);
        assert!(picture.is_dirty());
        assert!(picture.modified_ts() > 1_000);
        assert_eq!(queue.len(), 1);

        assert!(matches!(
            picture.set_grade(6),
            Err(PictureError::InvalidGrade(6))
        ));
        assert_eq!(picture.grade(), 4);
    }

    #[test]
    fn test_add_then_remove_tag_round_trip() {
        let (picture, _queue) = picture();
        let before = picture.tags();
        let t0 = picture.modified_ts();

        picture.add_tag(&tag(3, true)).unwrap();
        let t1 = picture.modified_ts();
        assert!(picture.has_tag(3));

        picture.remove_tag(3).unwrap();
        let t2 = picture.modified_ts();

        assert_eq!(picture.tags(), before);
        assert!(t0 <= t1 && t1 <= t2);
        assert!(t1 > t0);
    }

    #[test]
    fn test_unselectable_tags_are_rejected() {
        let (picture, _queue) = picture();
        assert!(matches!(
            picture.add_tag(&tag(1, false)),
            Err(PictureError::UnselectableTag(1))
        ));
        assert!(matches!(
            picture.set_tag_list(&[tag(2, true), tag(1, false)]),
            Err(PictureError::UnselectableTag(1))
        ));
        assert!(picture.tags().is_empty());
        assert!(!picture.is_dirty());
    }

    #[test]
    fn test_set_tag_list() {
        let (picture, _queue) = picture();
        picture.add_tag(&tag(1, true)).unwrap();
        picture.set_tag_list(&[tag(2, true), tag(3, true)]).unwrap();
        assert_eq!(picture.tags(), BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_queued_once() {
        let (picture, queue) = picture();
        picture.set_grade(1).unwrap();
        picture.set_grade(2).unwrap();
        picture.add_tag(&tag(1, true)).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_write_back_respects_delay() {
        let (picture, _queue) = picture();
        picture.set_grade(2).unwrap();
        let modified = picture.modified_ts();

        let outcome = picture
            .write_back(Some(1_000), modified + 10, |_| Ok::<(), ()>(()))
            .unwrap();
        assert_eq!(outcome, WriteBack::Deferred(modified + 1_000));
        assert!(picture.is_dirty());

        let outcome = picture
            .write_back(Some(1_000), modified + 1_000, |r| {
                assert_eq!(r.grade, 2);
                Ok::<(), ()>(())
            })
            .unwrap();
        assert_eq!(outcome, WriteBack::Written);
        assert!(!picture.is_dirty());

        let outcome = picture.write_back(None, 0, |_| Ok::<(), ()>(())).unwrap();
        assert_eq!(outcome, WriteBack::Clean);
    }

    #[test]
    fn test_failed_write_back_stays_dirty() {
        let (picture, _queue) = picture();
        picture.set_grade(2).unwrap();
        assert!(picture.write_back(None, 0, |_| Err("disk full")).is_err());
        assert!(picture.is_dirty());
    }

    #[test]
    fn test_edits_are_refused_once_queue_stopped() {
        let (picture, queue) = picture();
        queue.stop();

        assert!(matches!(picture.set_grade(3), Err(PictureError::Closed(_))));
        assert!(matches!(
            picture.add_tag(&tag(3, true)),
            Err(PictureError::Closed(_))
        ));
        assert_eq!(picture.grade(), 0);
        assert!(!picture.has_tag(3));
        assert!(!picture.is_dirty());
    }
}
