//! Full-text index of pictures
//!
//! One tantivy document per picture, keyed by its id. The writer lives behind
//! its own mutex; searches run against the reader snapshot, which is
//! reloaded after every commit.

mod query;
mod schema;

pub use query::PictureQuery;
pub use schema::{build_schema, fields, PictureFields};

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::schema::Value;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::bank::PictureRecord;
use crate::error::IndexError;

const WRITER_HEAP_SIZE: usize = 20_000_000;

pub struct Indexer {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    fields: PictureFields,
}

impl Indexer {
    /// Create or open the index stored in `dir`.
    pub fn open(dir: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(dir).map_err(|e| IndexError::Index(e.to_string()))?;

        let directory = MmapDirectory::open(dir)?;
        let index = Index::open_or_create(directory, build_schema())?;
        let fields = PictureFields::resolve(&index.schema())?;

        let writer = index.writer_with_num_threads(1, WRITER_HEAP_SIZE)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(Some(writer)),
            fields,
        })
    }

    fn writer(&self) -> MutexGuard<'_, Option<IndexWriter>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn document(&self, picture: &PictureRecord) -> TantivyDocument {
        let mut doc = TantivyDocument::new();
        doc.add_text(self.fields.id, &picture.id);
        for tag in &picture.tags {
            doc.add_u64(self.fields.tag, u64::from(*tag));
        }
        doc.add_u64(self.fields.grade, u64::from(picture.grade));
        doc.add_u64(self.fields.width, u64::from(picture.width));
        doc.add_u64(self.fields.height, u64::from(picture.height));
        doc.add_i64(self.fields.added_ts, picture.added_ts);
        doc.add_i64(self.fields.creation_ts, picture.creation_ts);
        doc.add_i64(self.fields.modified_ts, picture.modified_ts);
        doc.add_text(self.fields.name, &picture.original_name);
        doc
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<(), IndexError> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Add the picture, replacing any document already stored under its id.
    pub fn index_picture(&self, picture: &PictureRecord) -> Result<(), IndexError> {
        let mut guard = self.writer();
        let writer = guard.as_mut().ok_or(IndexError::Closed)?;

        writer.delete_term(Term::from_field_text(self.fields.id, &picture.id));
        writer.add_document(self.document(picture))?;
        self.commit(writer)
    }

    pub fn remove_picture(&self, picture_id: &str) -> Result<(), IndexError> {
        let mut guard = self.writer();
        let writer = guard.as_mut().ok_or(IndexError::Closed)?;

        writer.delete_term(Term::from_field_text(self.fields.id, picture_id));
        self.commit(writer)
    }

    /// Drop every document and index `pictures` from scratch.
    pub fn reindex_all<'a>(
        &self,
        pictures: impl IntoIterator<Item = &'a PictureRecord>,
    ) -> Result<usize, IndexError> {
        let mut guard = self.writer();
        let writer = guard.as_mut().ok_or(IndexError::Closed)?;

        writer.delete_all_documents()?;
        let mut count = 0;
        for picture in pictures {
            writer.add_document(self.document(picture))?;
            count += 1;
        }
        self.commit(writer)?;
        Ok(count)
    }

    /// Ids of the pictures matching `query`, in engine order.
    pub fn search(&self, query: &PictureQuery, limit: usize) -> Result<Vec<String>, IndexError> {
        if self.is_closed() {
            return Err(IndexError::Closed);
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query = query.build(&self.index, &self.fields)?;
        let top_docs = searcher.search(&*query, &TopDocs::with_limit(limit))?;

        let mut ids = Vec::with_capacity(top_docs.len());
        for (_score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(id) = doc.get_first(self.fields.id).and_then(|v| v.as_str()) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Number of indexed pictures as seen by the current reader.
    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn is_closed(&self) -> bool {
        self.writer().is_none()
    }

    /// Commit pending changes and release the writer lock on the directory.
    pub fn close(&self) -> Result<(), IndexError> {
        let writer = self.writer().take();
        if let Some(mut writer) = writer {
            writer.commit()?;
            writer.wait_merging_threads()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn picture(id: &str, name: &str, tags: &[u32], grade: u8, added_ts: i64) -> PictureRecord {
        PictureRecord {
            id: id.to_string(),
            original_name: name.to_string(),
            width: 800,
            height: 600,
            added_ts,
            creation_ts: added_ts,
            modified_ts: added_ts,
            grade,
            tags: tags.iter().copied().collect(),
        }
    }

    fn sorted(ids: Vec<String>) -> Vec<String> {
        let mut ids = ids;
        ids.sort();
        ids
    }

    fn populated() -> (tempfile::TempDir, Indexer) {
        let dir = tempdir().unwrap();
        let indexer = Indexer::open(&dir.path().join("index")).unwrap();
        indexer
            .index_picture(&picture("AA", "holiday_beach.png", &[1, 2], 5, 1_000))
            .unwrap();
        indexer
            .index_picture(&picture("BB", "holiday_mountain.png", &[1], 2, 2_000))
            .unwrap();
        indexer
            .index_picture(&picture("CC", "office.jpg", &[3], 0, 3_000))
            .unwrap();
        (dir, indexer)
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let (_dir, indexer) = populated();
        let ids = indexer.search(&PictureQuery::new(), 10).unwrap();
        assert_eq!(sorted(ids), vec!["AA", "BB", "CC"]);
        assert_eq!(indexer.num_docs(), 3);
    }

    #[test]
    fn test_tag_criteria() {
        let (_dir, indexer) = populated();

        let all = PictureQuery::new().with_all_tags([1, 2]);
        assert_eq!(indexer.search(&all, 10).unwrap(), vec!["AA"]);

        let any = PictureQuery::new().with_any_tag([2, 3]);
        assert_eq!(sorted(indexer.search(&any, 10).unwrap()), vec!["AA", "CC"]);
    }

    #[test]
    fn test_range_criteria() {
        let (_dir, indexer) = populated();

        let graded = PictureQuery::new().with_grade_between(2, 5);
        assert_eq!(sorted(indexer.search(&graded, 10).unwrap()), vec!["AA", "BB"]);

        let recent = PictureQuery::new().added_between(1_500, 3_000);
        assert_eq!(sorted(indexer.search(&recent, 10).unwrap()), vec!["BB", "CC"]);

        let wide = PictureQuery::new().with_min_width(801);
        assert!(indexer.search(&wide, 10).unwrap().is_empty());
    }

    #[test]
    fn test_text_criteria() {
        let (_dir, indexer) = populated();

        let query = PictureQuery::new().with_text("holiday");
        assert_eq!(sorted(indexer.search(&query, 10).unwrap()), vec!["AA", "BB"]);

        let query = PictureQuery::new().with_text("beach").with_all_tags([1]);
        assert_eq!(indexer.search(&query, 10).unwrap(), vec!["AA"]);
    }

    #[test]
    fn test_malformed_text_is_a_query_error() {
        let (_dir, indexer) = populated();
        let query = PictureQuery::new().with_text("name:(");
        assert!(matches!(indexer.search(&query, 10), Err(IndexError::Query(_))));
    }

    #[test]
    fn test_upsert_replaces_document() {
        let (_dir, indexer) = populated();
        indexer
            .index_picture(&picture("AA", "holiday_beach.png", &[3], 5, 1_000))
            .unwrap();

        assert_eq!(indexer.num_docs(), 3);
        let tagged = PictureQuery::new().with_all_tags([2]);
        assert!(indexer.search(&tagged, 10).unwrap().is_empty());
        let tagged = PictureQuery::new().with_all_tags([3]);
        assert_eq!(sorted(indexer.search(&tagged, 10).unwrap()), vec!["AA", "CC"]);
    }

    #[test]
    fn test_limit() {
        let (_dir, indexer) = populated();
        assert_eq!(indexer.search(&PictureQuery::new(), 2).unwrap().len(), 2);
        assert!(indexer.search(&PictureQuery::new(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_reindex() {
        let (_dir, indexer) = populated();
        indexer.remove_picture("BB").unwrap();
        assert_eq!(sorted(indexer.search(&PictureQuery::new(), 10).unwrap()), vec!["AA", "CC"]);

        let pictures = vec![picture("DD", "new.png", &[], 1, 4_000)];
        assert_eq!(indexer.reindex_all(&pictures).unwrap(), 1);
        assert_eq!(indexer.search(&PictureQuery::new(), 10).unwrap(), vec!["DD"]);
    }

    #[test]
    fn test_close_and_reopen() {
        let (dir, indexer) = populated();
        indexer.close().unwrap();
        indexer.close().unwrap();

        assert!(matches!(
            indexer.index_picture(&picture("DD", "x.png", &[], 0, 0)),
            Err(IndexError::Closed)
        ));
        assert!(matches!(
            indexer.search(&PictureQuery::new(), 10),
            Err(IndexError::Closed)
        ));
        drop(indexer);

        let reopened = Indexer::open(&dir.path().join("index")).unwrap();
        let ids: BTreeSet<String> = reopened
            .search(&PictureQuery::new(), 10)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(ids.len(), 3);
    }
}
