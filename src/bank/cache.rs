//! Load-once picture cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::picture::Picture;

type Slot = Arc<Mutex<Option<Picture>>>;
type RemovalListener = Box<dyn Fn(&Picture) + Send + Sync>;

/// Concurrent map from picture id to its shared handle.
///
/// Each key has its own slot lock, so a picture is loaded at most once even
/// when several threads miss on it together, while loads of different
/// pictures proceed in parallel. Entries handed out by
/// [`PictureCache::invalidate_all`] go through the removal listener first.
pub(crate) struct PictureCache {
    slots: Mutex<HashMap<String, Slot>>,
    on_remove: RemovalListener,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PictureCache {
    pub fn new<F>(on_remove: F) -> Self
    where
        F: Fn(&Picture) + Send + Sync + 'static,
    {
        Self {
            slots: Mutex::new(HashMap::new()),
            on_remove: Box::new(on_remove),
        }
    }

    /// Cached picture for `id`, loading it with `load` on a miss.
    pub fn get_or_load<E, F>(&self, id: &str, load: F) -> Result<Picture, E>
    where
        F: FnOnce() -> Result<Picture, E>,
    {
        let slot = Arc::clone(
            lock(&self.slots)
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        );

        let mut entry = lock(&slot);
        if let Some(picture) = entry.as_ref() {
            return Ok(picture.clone());
        }

        match load() {
            Ok(picture) => {
                *entry = Some(picture.clone());
                Ok(picture)
            }
            Err(e) => {
                drop(entry);
                // Forget the empty slot unless a retry already reused it
                let mut slots = lock(&self.slots);
                let unused = slots.get(id).is_some_and(|s| {
                    Arc::ptr_eq(s, &slot) && s.try_lock().is_ok_and(|e| e.is_none())
                });
                if unused {
                    slots.remove(id);
                }
                Err(e)
            }
        }
    }

    /// Insert a freshly created picture.
    pub fn insert(&self, picture: Picture) {
        let slot = Arc::new(Mutex::new(Some(picture.clone())));
        lock(&self.slots).insert(picture.id().to_string(), slot);
    }

    pub fn get_if_present(&self, id: &str) -> Option<Picture> {
        let slot = lock(&self.slots).get(id).cloned()?;
        let entry = lock(&slot);
        entry.clone()
    }

    /// Every loaded picture.
    pub fn cached(&self) -> Vec<Picture> {
        let slots: Vec<Slot> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter_map(|slot| lock(slot).clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.cached().len()
    }

    /// Empty the cache, passing every loaded picture to the removal listener.
    pub fn invalidate_all(&self) -> usize {
        let slots = std::mem::take(&mut *lock(&self.slots));
        let mut removed = 0;
        for slot in slots.into_values() {
            let picture = lock(&slot).take();
            if let Some(picture) = picture {
                (self.on_remove)(&picture);
                removed += 1;
            }
        }
        removed
    }
}
