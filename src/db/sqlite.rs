//! SQLite backend implementation.
//!
//! Every statement goes through the connection's prepared-statement cache,
//! keyed by its SQL text.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Result};

use super::schema::{SCHEMA, TAG_ID_HIGH_WATER};
use crate::bank::PictureRecord;
use crate::tags::{Tag, TagId, ROOT_TAG_ID};

const STATEMENT_CACHE_CAPACITY: usize = 32;

const INSERT_TAG: &str =
    "INSERT INTO tag (id, name, description, parent_id, selectable) VALUES (?, ?, ?, ?, ?)";
const UPDATE_TAG: &str =
    "UPDATE tag SET name = ?, description = ?, parent_id = ?, selectable = ? WHERE id = ?";
const DELETE_TAG: &str = "DELETE FROM tag WHERE id = ?";
const DELETE_TAG_ASSIGNMENTS: &str = "DELETE FROM picture_tag WHERE tag_id = ?";
const LOAD_TAGS: &str = "SELECT id, name, description, parent_id, selectable FROM tag ORDER BY id";
const LOAD_META: &str = "SELECT value FROM bank_meta WHERE key = ?";
const RAISE_META: &str = r#"
    INSERT INTO bank_meta (key, value) VALUES (?1, ?2)
    ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
"#;

const INSERT_PICTURE: &str = r#"
    INSERT INTO picture (
        id, grade, width, height, original_name,
        creation_ts, modified_ts, added_ts, path
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;
const DELETE_PICTURE: &str = "DELETE FROM picture WHERE id = ?";
const UPDATE_PICTURE_GRADE: &str = "UPDATE picture SET grade = ?, modified_ts = ? WHERE id = ?";
/// Assignments of tags that no longer exist are skipped.
const INSERT_PICTURE_TAG: &str = r#"
    INSERT OR IGNORE INTO picture_tag (tag_id, picture_id)
    SELECT ?1, ?2 WHERE EXISTS (SELECT 1 FROM tag WHERE id = ?1)
"#;
const DELETE_PICTURE_TAGS: &str = "DELETE FROM picture_tag WHERE picture_id = ?";
const COUNT_PICTURES: &str = "SELECT COUNT(*) FROM picture";
const COUNT_PICTURES_BY_TAG: &str = "SELECT COUNT(*) FROM picture_tag WHERE tag_id = ?";
const SELECT_PICTURES_BY_TAG: &str =
    "SELECT picture_id FROM picture_tag WHERE tag_id = ? ORDER BY picture_id";
const SELECT_ALL_PICTURES: &str = "SELECT id FROM picture ORDER BY added_ts, rowid";
const LOAD_PICTURE: &str = r#"
    SELECT grade, width, height, original_name, creation_ts, modified_ts, added_ts
    FROM picture
    WHERE id = ?
"#;
const LOAD_TAGS_OF_PICTURE: &str = "SELECT tag_id FROM picture_tag WHERE picture_id = ?";

pub struct SqliteDb {
    pub(crate) conn: Connection,
}

impl SqliteDb {
    pub fn open(path: &Path) -> Result<Self> {
        Self::configure(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(Self { conn })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| e)
    }

    // ========================================================================
    // Tag operations
    // ========================================================================

    /// Insert a tag and raise the id high-water mark in one transaction.
    pub fn insert_tag(&mut self, tag: &Tag) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(INSERT_TAG)?.execute(params![
            tag.id,
            tag.name,
            tag.description,
            stored_parent(tag),
            tag.selectable,
        ])?;
        tx.prepare_cached(RAISE_META)?
            .execute(params![TAG_ID_HIGH_WATER, i64::from(tag.id)])?;
        tx.commit()
    }

    pub fn update_tag(&self, tag: &Tag) -> Result<usize> {
        self.conn.prepare_cached(UPDATE_TAG)?.execute(params![
            tag.name,
            tag.description,
            stored_parent(tag),
            tag.selectable,
            tag.id,
        ])
    }

    /// Delete a tag together with every assignment of it.
    pub fn delete_tag(&mut self, tag_id: TagId) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(DELETE_TAG_ASSIGNMENTS)?.execute([tag_id])?;
        let deleted = tx.prepare_cached(DELETE_TAG)?.execute([tag_id])?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn load_tags(&self) -> Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare_cached(LOAD_TAGS)?;
        let tags = stmt
            .query_map([], |row| {
                let parent_id: i64 = row.get(3)?;
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    parent_id: Some(loaded_parent(parent_id)),
                    selectable: row.get(4)?,
                    editable: true,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(tags)
    }

    /// Highest tag id ever allocated in this bank, removed tags included.
    pub fn tag_id_high_water(&self) -> Result<Option<TagId>> {
        let value: Option<i64> = self
            .conn
            .prepare_cached(LOAD_META)?
            .query_row([TAG_ID_HIGH_WATER], |row| row.get(0))
            .optional()?;
        Ok(value.and_then(|v| TagId::try_from(v).ok()))
    }

    // ========================================================================
    // Picture operations
    // ========================================================================

    /// Insert the picture row and its tag rows in one transaction.
    pub fn insert_picture(&mut self, picture: &PictureRecord, path: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(INSERT_PICTURE)?.execute(params![
            picture.id,
            i64::from(picture.grade),
            i64::from(picture.width),
            i64::from(picture.height),
            picture.original_name,
            picture.creation_ts,
            picture.modified_ts,
            picture.added_ts,
            path,
        ])?;
        {
            let mut insert_tag = tx.prepare_cached(INSERT_PICTURE_TAG)?;
            for tag_id in &picture.tags {
                insert_tag.execute(params![tag_id, picture.id])?;
            }
        }
        tx.commit()
    }

    pub fn delete_picture(&mut self, picture_id: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(DELETE_PICTURE_TAGS)?.execute([picture_id])?;
        let deleted = tx.prepare_cached(DELETE_PICTURE)?.execute([picture_id])?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Write grade, modification time and the full tag list of a picture.
    pub fn update_picture(&mut self, picture: &PictureRecord) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.prepare_cached(UPDATE_PICTURE_GRADE)?.execute(params![
            i64::from(picture.grade),
            picture.modified_ts,
            picture.id,
        ])?;
        tx.prepare_cached(DELETE_PICTURE_TAGS)?.execute([&picture.id])?;
        {
            let mut insert_tag = tx.prepare_cached(INSERT_PICTURE_TAG)?;
            for tag_id in &picture.tags {
                insert_tag.execute(params![tag_id, picture.id])?;
            }
        }
        tx.commit()
    }

    pub fn count_pictures(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .prepare_cached(COUNT_PICTURES)?
            .query_row([], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn count_pictures_with_tag(&self, tag_id: TagId) -> Result<u64> {
        let count: i64 = self
            .conn
            .prepare_cached(COUNT_PICTURES_BY_TAG)?
            .query_row([tag_id], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn select_picture_ids_by_tag(&self, tag_id: TagId) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(SELECT_PICTURES_BY_TAG)?;
        let ids = stmt
            .query_map([tag_id], |row| row.get(0))?
            .collect::<Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn select_all_picture_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(SELECT_ALL_PICTURES)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn load_picture(&self, picture_id: &str) -> Result<Option<PictureRecord>> {
        let row = self
            .conn
            .prepare_cached(LOAD_PICTURE)?
            .query_row([picture_id], |row| {
                let grade: i64 = row.get(0)?;
                let width: i64 = row.get(1)?;
                let height: i64 = row.get(2)?;
                Ok(PictureRecord {
                    id: picture_id.to_string(),
                    grade: grade.clamp(0, 5) as u8,
                    width: u32::try_from(width).unwrap_or(0),
                    height: u32::try_from(height).unwrap_or(0),
                    original_name: row.get(3)?,
                    creation_ts: row.get(4)?,
                    modified_ts: row.get(5)?,
                    added_ts: row.get(6)?,
                    tags: BTreeSet::new(),
                })
            })
            .optional()?;

        match row {
            Some(mut picture) => {
                picture.tags = self.load_tags_of_picture(picture_id)?.into_iter().collect();
                Ok(Some(picture))
            }
            None => Ok(None),
        }
    }

    pub fn load_tags_of_picture(&self, picture_id: &str) -> Result<Vec<TagId>> {
        let mut stmt = self.conn.prepare_cached(LOAD_TAGS_OF_PICTURE)?;
        let tags = stmt
            .query_map([picture_id], |row| row.get(0))?
            .collect::<Result<Vec<TagId>>>()?;
        Ok(tags)
    }
}

/// Top-level tags are stored with parent 0, the root itself with -1.
fn stored_parent(tag: &Tag) -> i64 {
    tag.parent_id.map(i64::from).unwrap_or(-1)
}

fn loaded_parent(parent_id: i64) -> TagId {
    if parent_id <= 0 {
        ROOT_TAG_ID
    } else {
        TagId::try_from(parent_id).unwrap_or(ROOT_TAG_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> SqliteDb {
        let db = SqliteDb::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn tag(id: TagId, name: &str, parent: TagId) -> Tag {
        Tag {
            id,
            name: name.to_string(),
            description: String::new(),
            parent_id: Some(parent),
            selectable: true,
            editable: true,
        }
    }

    fn picture(id: &str, tags: &[TagId]) -> PictureRecord {
        PictureRecord {
            id: id.to_string(),
            original_name: format!("{}.png", id.to_lowercase()),
            width: 640,
            height: 480,
            added_ts: 1_000,
            creation_ts: 1_000,
            modified_ts: 1_000,
            grade: 0,
            tags: tags.iter().copied().collect(),
        }
    }

    #[test]
    fn test_initialize_is_repeatable() {
        let db = db();
        db.initialize().unwrap();
        assert_eq!(db.count_pictures().unwrap(), 0);
    }

    #[test]
    fn test_tag_round_trip_and_high_water() {
        let mut db = db();
        db.insert_tag(&tag(1, "nature", ROOT_TAG_ID)).unwrap();
        db.insert_tag(&tag(2, "trees", 1)).unwrap();

        let tags = db.load_tags().unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].parent_id, Some(ROOT_TAG_ID));
        assert_eq!(tags[1].parent_id, Some(1));

        db.delete_tag(2).unwrap();
        assert_eq!(db.tag_id_high_water().unwrap(), Some(2));
    }

    #[test]
    fn test_duplicate_tag_name_is_rejected() {
        let mut db = db();
        db.insert_tag(&tag(1, "nature", ROOT_TAG_ID)).unwrap();
        assert!(db.insert_tag(&tag(2, "nature", ROOT_TAG_ID)).is_err());
        assert_eq!(db.tag_id_high_water().unwrap(), Some(1));
    }

    #[test]
    fn test_delete_tag_cascades_assignments() {
        let mut db = db();
        db.insert_tag(&tag(1, "nature", ROOT_TAG_ID)).unwrap();
        db.insert_picture(&picture("AA", &[1]), "/p/AA/AA").unwrap();
        assert_eq!(db.count_pictures_with_tag(1).unwrap(), 1);

        db.delete_tag(1).unwrap();

        assert_eq!(db.count_pictures_with_tag(1).unwrap(), 0);
        assert!(db.load_picture("AA").unwrap().unwrap().tags.is_empty());
    }

    #[test]
    fn test_update_picture_replaces_tags() {
        let mut db = db();
        for (id, name) in [(1, "one"), (2, "two"), (3, "three")] {
            db.insert_tag(&tag(id, name, ROOT_TAG_ID)).unwrap();
        }
        db.insert_picture(&picture("AA", &[1, 2]), "/p/AA/AA").unwrap();

        let mut updated = picture("AA", &[3]);
        updated.grade = 4;
        updated.modified_ts = 2_000;
        db.update_picture(&updated).unwrap();

        let loaded = db.load_picture("AA").unwrap().unwrap();
        assert_eq!(loaded, updated);
        assert_eq!(db.select_picture_ids_by_tag(3).unwrap(), vec!["AA".to_string()]);
        assert!(db.select_picture_ids_by_tag(1).unwrap().is_empty());
    }

    #[test]
    fn test_all_ids_follow_insertion_order() {
        let mut db = db();
        db.insert_picture(&picture("BB", &[]), "/p/BB/BB").unwrap();
        db.insert_picture(&picture("AA", &[]), "/p/AA/AA").unwrap();

        assert_eq!(db.select_all_picture_ids().unwrap(), vec!["BB", "AA"]);
        assert_eq!(db.count_pictures().unwrap(), 2);

        db.delete_picture("BB").unwrap();
        assert_eq!(db.select_all_picture_ids().unwrap(), vec!["AA"]);
        assert!(db.load_picture("BB").unwrap().is_none());
    }

    #[test]
    fn test_assignments_of_missing_tags_are_skipped() {
        let mut db = db();
        db.insert_tag(&tag(1, "kept", ROOT_TAG_ID)).unwrap();
        db.insert_picture(&picture("AA", &[]), "/p/AA/AA").unwrap();

        db.update_picture(&picture("AA", &[1, 7])).unwrap();

        assert_eq!(db.load_picture("AA").unwrap().unwrap().tags, BTreeSet::from([1]));
        assert_eq!(db.count_pictures_with_tag(7).unwrap(), 0);
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let mut db = db();
        db.insert_tag(&tag(1, "nature", ROOT_TAG_ID)).unwrap();
        db.insert_picture(&picture("AA", &[1]), "/p/AA/AA").unwrap();

        let orphan = db
            .conn
            .execute("INSERT INTO picture_tag (tag_id, picture_id) VALUES (9, 'AA')", []);
        assert!(orphan.is_err());

        db.conn.execute("DELETE FROM tag WHERE id = 1", []).unwrap();
        assert_eq!(db.count_pictures_with_tag(1).unwrap(), 0);
    }
}
