//! Bidirectional cursor over a snapshot of picture ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};

use super::picture::Picture;
use crate::error::{BankError, BrowseError};
use crate::events::{BankEvent, EventBus, SubscriberId};

/// Where a browser gets its pictures from.
pub trait PictureSource: Send + Sync {
    fn bank_id(&self) -> u32;

    fn load(&self, id: &str) -> Result<Picture, BankError>;
}

fn next_browser_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Cursor over the ids a bank returned for a query.
///
/// The id list is fixed at construction, so pictures ingested later don't
/// show up and don't shift positions. The browser holds its bank weakly;
/// once the bank is gone, moves fail with [`BrowseError::Load`].
pub struct Browser {
    id: u64,
    ids: Arc<[String]>,
    position: Option<usize>,
    current: Option<Picture>,
    source: Weak<dyn PictureSource>,
    bus: EventBus,
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("id", &self.id)
            .field("len", &self.ids.len())
            .field("position", &self.position)
            .finish()
    }
}

impl Browser {
    /// Build a browser over `ids`, positioned on (and having loaded) the
    /// first one.
    pub fn new(ids: Vec<String>, source: Weak<dyn PictureSource>) -> Result<Self, BrowseError> {
        let mut browser = Self {
            id: next_browser_id(),
            ids: ids.into(),
            position: None,
            current: None,
            source,
            bus: EventBus::new(),
        };
        if !browser.ids.is_empty() {
            browser.current = Some(browser.load(0)?);
            browser.position = Some(0);
        }
        Ok(browser)
    }

    fn load(&self, index: usize) -> Result<Picture, BrowseError> {
        let id = &self.ids[index];
        let load_error = |source: BankError| BrowseError::Load {
            id: id.clone(),
            source: Box::new(source),
        };
        let source = self.source.upgrade().ok_or_else(|| {
            load_error(BankError::UnknownPicture(id.clone()))
        })?;
        source.load(id).map_err(load_error)
    }

    fn move_to(&mut self, index: usize) -> Result<Picture, BrowseError> {
        let picture = self.load(index)?;
        self.position = Some(index);
        self.current = Some(picture.clone());
        self.bus.publish(BankEvent::PictureChanged {
            picture_id: picture.id().to_string(),
            browser_id: self.id,
        });
        Ok(picture)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn current(&self) -> Option<&Picture> {
        self.current.as_ref()
    }

    /// `None` only for an empty browser.
    pub fn current_index(&self) -> Option<usize> {
        self.position
    }

    pub fn next_index(&self) -> Option<usize> {
        self.position
            .map(|p| p + 1)
            .filter(|&next| next < self.ids.len())
    }

    pub fn previous_index(&self) -> Option<usize> {
        self.position.and_then(|p| p.checked_sub(1))
    }

    pub fn has_next(&self) -> bool {
        self.next_index().is_some()
    }

    pub fn has_previous(&self) -> bool {
        self.previous_index().is_some()
    }

    pub fn next(&mut self) -> Result<Picture, BrowseError> {
        let index = self.next_index().ok_or(BrowseError::NoNext)?;
        self.move_to(index)
    }

    pub fn previous(&mut self) -> Result<Picture, BrowseError> {
        let index = self.previous_index().ok_or(BrowseError::NoPrevious)?;
        self.move_to(index)
    }

    /// Receive a [`BankEvent::PictureChanged`] for every move.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<BankEvent>) {
        self.bus.subscribe()
    }

    pub fn subscribe_sender(&self, sender: mpsc::Sender<BankEvent>) -> SubscriberId {
        self.bus.subscribe_sender(sender)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// The bank this browser reads from, while it is still open.
    pub fn data_source(&self) -> Option<Arc<dyn PictureSource>> {
        self.source.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::picture::PictureRecord;
    use crate::bank::updater::UpdateQueue;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::Mutex;

    /// Source serving any id except the ones marked broken.
    struct FakeSource {
        queue: Arc<UpdateQueue>,
        broken: Mutex<HashSet<String>>,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                queue: Arc::new(UpdateQueue::new(0)),
                broken: Mutex::new(HashSet::new()),
            })
        }
    }

    impl PictureSource for FakeSource {
        fn bank_id(&self) -> u32 {
            9
        }

        fn load(&self, id: &str) -> Result<Picture, BankError> {
            if self.broken.lock().unwrap().contains(id) {
                return Err(BankError::UnknownPicture(id.to_string()));
            }
            let record = PictureRecord {
                id: id.to_string(),
                original_name: String::new(),
                width: 1,
                height: 1,
                added_ts: 0,
                creation_ts: 0,
                modified_ts: 0,
                grade: 0,
                tags: BTreeSet::new(),
            };
            Ok(Picture::new(record, self.queue.clone()))
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ID{i}")).collect()
    }

    fn browser(source: &Arc<FakeSource>, n: usize) -> Browser {
        let weak: Weak<dyn PictureSource> = Arc::downgrade(source) as Weak<dyn PictureSource>;
        Browser::new(ids(n), weak).unwrap()
    }

    #[test]
    fn test_starts_on_first_picture() {
        let source = FakeSource::new();
        let browser = browser(&source, 3);

        assert_eq!(browser.current_index(), Some(0));
        assert_eq!(browser.current().unwrap().id(), "ID0");
        assert!(!browser.has_previous());
        assert!(browser.has_next());
        assert_eq!(browser.data_source().unwrap().bank_id(), 9);
    }

    #[test]
    fn test_walk_forward_and_back() {
        let source = FakeSource::new();
        let mut browser = browser(&source, 3);
        let (_, rx) = browser.subscribe();

        assert_eq!(browser.next().unwrap().id(), "ID1");
        assert!(browser.has_previous());
        assert_eq!(browser.next().unwrap().id(), "ID2");
        assert_eq!(browser.current_index(), Some(2));
        assert!(matches!(browser.next(), Err(BrowseError::NoNext)));
        assert_eq!(browser.current_index(), Some(2));

        assert_eq!(browser.previous().unwrap().id(), "ID1");
        assert_eq!(browser.previous().unwrap().id(), "ID0");
        assert!(matches!(browser.previous(), Err(BrowseError::NoPrevious)));

        let events: Vec<BankEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            BankEvent::PictureChanged {
                picture_id: "ID1".to_string(),
                browser_id: browser.id(),
            }
        );
    }

    #[test]
    fn test_index_tracks_net_moves() {
        let source = FakeSource::new();
        let mut browser = browser(&source, 10);
        for k in 1..=5 {
            browser.next().unwrap();
            assert_eq!(browser.current_index(), Some(k));
        }
        browser.previous().unwrap();
        assert_eq!(browser.current_index(), Some(4));
        assert_eq!(browser.next_index(), Some(5));
        assert_eq!(browser.previous_index(), Some(3));
    }

    #[test]
    fn test_failed_load_does_not_move() {
        let source = FakeSource::new();
        let mut browser = browser(&source, 3);
        source.broken.lock().unwrap().insert("ID1".to_string());

        assert!(matches!(browser.next(), Err(BrowseError::Load { .. })));
        assert_eq!(browser.current_index(), Some(0));
        assert_eq!(browser.current().unwrap().id(), "ID0");
    }

    #[test]
    fn test_empty_browser() {
        let source = FakeSource::new();
        let mut browser = browser(&source, 0);
        assert!(browser.is_empty());
        assert_eq!(browser.current_index(), None);
        assert!(browser.current().is_none());
        assert!(!browser.has_next());
        assert!(!browser.has_previous());
        assert!(matches!(browser.next(), Err(BrowseError::NoNext)));
    }

    #[test]
    fn test_browser_ids_are_unique() {
        let source = FakeSource::new();
        assert_ne!(browser(&source, 1).id(), browser(&source, 1).id());
    }

    #[test]
    fn test_dropped_source() {
        let source = FakeSource::new();
        let mut browser = browser(&source, 2);
        drop(source);
        assert!(browser.data_source().is_none());
        assert!(matches!(browser.next(), Err(BrowseError::Load { .. })));
    }
}
