//! Picture search criteria and their translation to tantivy queries.

use std::collections::BTreeSet;
use std::ops::Bound;

use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, RangeQuery, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{Index, Term};

use super::schema::{fields, PictureFields};
use crate::error::IndexError;
use crate::tags::TagId;

/// Conjunction of criteria a picture must meet. The empty query matches
/// every indexed picture.
///
/// ```ignore
/// let query = PictureQuery::new()
///     .with_all_tags([holidays])
///     .with_grade_between(3, 5);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureQuery {
    all_tags: BTreeSet<TagId>,
    any_tags: BTreeSet<TagId>,
    grade: Option<(u8, u8)>,
    min_width: Option<u32>,
    min_height: Option<u32>,
    added: Option<(i64, i64)>,
    modified: Option<(i64, i64)>,
    text: Option<String>,
}

impl PictureQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pictures carrying every one of `tags`.
    pub fn with_all_tags(mut self, tags: impl IntoIterator<Item = TagId>) -> Self {
        self.all_tags.extend(tags);
        self
    }

    /// Pictures carrying at least one of `tags`.
    pub fn with_any_tag(mut self, tags: impl IntoIterator<Item = TagId>) -> Self {
        self.any_tags.extend(tags);
        self
    }

    /// Inclusive grade range.
    pub fn with_grade_between(mut self, min: u8, max: u8) -> Self {
        self.grade = Some((min, max));
        self
    }

    pub fn with_min_width(mut self, width: u32) -> Self {
        self.min_width = Some(width);
        self
    }

    pub fn with_min_height(mut self, height: u32) -> Self {
        self.min_height = Some(height);
        self
    }

    /// Inclusive range of ingestion times, in epoch milliseconds.
    pub fn added_between(mut self, from: i64, to: i64) -> Self {
        self.added = Some((from, to));
        self
    }

    /// Inclusive range of last modification times, in epoch milliseconds.
    pub fn modified_between(mut self, from: i64, to: i64) -> Self {
        self.modified = Some((from, to));
        self
    }

    /// Free text matched against original file names, in tantivy query syntax.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.text = if text.trim().is_empty() { None } else { Some(text) };
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn build(
        &self,
        index: &Index,
        fields: &PictureFields,
    ) -> Result<Box<dyn Query>, IndexError> {
        if self.is_empty() {
            return Ok(Box::new(AllQuery));
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        for tag in &self.all_tags {
            clauses.push((Occur::Must, tag_query(fields, *tag)));
        }

        if !self.any_tags.is_empty() {
            let any: Vec<(Occur, Box<dyn Query>)> = self
                .any_tags
                .iter()
                .map(|tag| (Occur::Should, tag_query(fields, *tag)))
                .collect();
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(any))));
        }

        if let Some((min, max)) = self.grade {
            clauses.push((
                Occur::Must,
                Box::new(RangeQuery::new_u64_bounds(
                    fields::GRADE.to_string(),
                    Bound::Included(u64::from(min)),
                    Bound::Included(u64::from(max)),
                )),
            ));
        }

        if let Some(width) = self.min_width {
            clauses.push((Occur::Must, at_least(fields::WIDTH, width)));
        }
        if let Some(height) = self.min_height {
            clauses.push((Occur::Must, at_least(fields::HEIGHT, height)));
        }

        if let Some((from, to)) = self.added {
            clauses.push((Occur::Must, between(fields::ADDED_TS, from, to)));
        }
        if let Some((from, to)) = self.modified {
            clauses.push((Occur::Must, between(fields::MODIFIED_TS, from, to)));
        }

        if let Some(text) = &self.text {
            let parser = QueryParser::for_index(index, vec![fields.name]);
            clauses.push((Occur::Must, parser.parse_query(text)?));
        }

        Ok(Box::new(BooleanQuery::new(clauses)))
    }
}

fn tag_query(fields: &PictureFields, tag: TagId) -> Box<dyn Query> {
    Box::new(TermQuery::new(
        Term::from_field_u64(fields.tag, u64::from(tag)),
        IndexRecordOption::Basic,
    ))
}

fn at_least(field: &str, value: u32) -> Box<dyn Query> {
    Box::new(RangeQuery::new_u64_bounds(
        field.to_string(),
        Bound::Included(u64::from(value)),
        Bound::Unbounded,
    ))
}

fn between(field: &str, from: i64, to: i64) -> Box<dyn Query> {
    Box::new(RangeQuery::new_i64_bounds(
        field.to_string(),
        Bound::Included(from),
        Bound::Included(to),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates_tags() {
        let query = PictureQuery::new()
            .with_all_tags([3, 1])
            .with_all_tags([3])
            .with_any_tag([7]);
        assert_eq!(query.all_tags.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(query.any_tags.len(), 1);
        assert!(!query.is_empty());
    }

    #[test]
    fn test_blank_text_is_ignored() {
        assert!(PictureQuery::new().with_text("  ").is_empty());
        assert!(!PictureQuery::new().with_text("beach").is_empty());
    }
}
