mod schema;
pub mod sqlite;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use schema::{SCHEMA, TAG_ID_HIGH_WATER};

use crate::bank::PictureRecord;
use crate::error::DbError;
use crate::tags::{Tag, TagId};

/// Macro to run a method on the open connection, or fail with `Closed`.
macro_rules! dispatch {
    ($self:expr, $method:ident($($arg:expr),* $(,)?)) => {{
        let mut guard = $self.lock();
        match guard.as_mut() {
            Some(db) => db.$method($($arg),*).map_err(DbError::from),
            None => Err(DbError::Closed),
        }
    }};
}

/// Persistence gateway of one picture bank.
///
/// A single SQLite connection guarded by a mutex. Callers never see SQL;
/// they go through the typed operations below.
pub struct Database {
    inner: Mutex<Option<sqlite::SqliteDb>>,
}

impl Database {
    /// Open (or create) the database file and make sure every table exists.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let db = sqlite::SqliteDb::open(path)?;
        db.initialize()?;
        Ok(Self {
            inner: Mutex::new(Some(db)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DbError> {
        let db = sqlite::SqliteDb::open_in_memory()?;
        db.initialize()?;
        Ok(Self {
            inner: Mutex::new(Some(db)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<sqlite::SqliteDb>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Close the connection. Later calls fail with [`DbError::Closed`].
    pub fn close(&self) -> Result<(), DbError> {
        let db = self.lock().take();
        match db {
            Some(db) => db.close().map_err(DbError::from),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Tag operations
    // ========================================================================

    pub fn insert_tag(&self, tag: &Tag) -> Result<(), DbError> {
        dispatch!(self, insert_tag(tag))
    }

    pub fn update_tag(&self, tag: &Tag) -> Result<usize, DbError> {
        dispatch!(self, update_tag(tag))
    }

    pub fn delete_tag(&self, tag_id: TagId) -> Result<usize, DbError> {
        dispatch!(self, delete_tag(tag_id))
    }

    pub fn load_tags(&self) -> Result<Vec<Tag>, DbError> {
        dispatch!(self, load_tags())
    }

    /// First tag id never handed out before, or `None` once the id space is
    /// exhausted.
    pub fn next_tag_id(&self) -> Result<Option<TagId>, DbError> {
        let high_water = dispatch!(self, tag_id_high_water())?;
        Ok(match high_water {
            Some(id) => id.checked_add(1),
            None => Some(1),
        })
    }

    // ========================================================================
    // Picture operations
    // ========================================================================

    pub fn insert_picture(&self, picture: &PictureRecord, path: &Path) -> Result<(), DbError> {
        let path = path.to_string_lossy();
        dispatch!(self, insert_picture(picture, &path))
    }

    pub fn delete_picture(&self, picture_id: &str) -> Result<usize, DbError> {
        dispatch!(self, delete_picture(picture_id))
    }

    pub fn update_picture(&self, picture: &PictureRecord) -> Result<(), DbError> {
        dispatch!(self, update_picture(picture))
    }

    pub fn count_pictures(&self) -> Result<u64, DbError> {
        dispatch!(self, count_pictures())
    }

    pub fn count_pictures_with_tag(&self, tag_id: TagId) -> Result<u64, DbError> {
        dispatch!(self, count_pictures_with_tag(tag_id))
    }

    pub fn select_picture_ids_by_tag(&self, tag_id: TagId) -> Result<Vec<String>, DbError> {
        dispatch!(self, select_picture_ids_by_tag(tag_id))
    }

    pub fn select_all_picture_ids(&self) -> Result<Vec<String>, DbError> {
        dispatch!(self, select_all_picture_ids())
    }

    pub fn load_picture(&self, picture_id: &str) -> Result<Option<PictureRecord>, DbError> {
        dispatch!(self, load_picture(picture_id))
    }
}
