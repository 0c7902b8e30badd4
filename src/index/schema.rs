//! Tantivy schema of the picture index

use tantivy::schema::{Field, Schema, SchemaBuilder, FAST, INDEXED, STORED, STRING, TEXT};

use crate::error::IndexError;

/// Field names for the picture index
pub mod fields {
    pub const ID: &str = "id";
    pub const TAG: &str = "tag";
    pub const GRADE: &str = "grade";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const ADDED_TS: &str = "added_ts";
    pub const CREATION_TS: &str = "creation_ts";
    pub const MODIFIED_TS: &str = "modified_ts";
    pub const NAME: &str = "name";
}

pub fn build_schema() -> Schema {
    let mut schema_builder = SchemaBuilder::new();

    // Only the id comes back out of a search
    schema_builder.add_text_field(fields::ID, STRING | STORED);

    // One value per attached tag
    schema_builder.add_u64_field(fields::TAG, INDEXED);

    // Range-filterable attributes
    schema_builder.add_u64_field(fields::GRADE, INDEXED | FAST);
    schema_builder.add_u64_field(fields::WIDTH, INDEXED | FAST);
    schema_builder.add_u64_field(fields::HEIGHT, INDEXED | FAST);
    schema_builder.add_i64_field(fields::ADDED_TS, INDEXED | FAST);
    schema_builder.add_i64_field(fields::CREATION_TS, INDEXED | FAST);
    schema_builder.add_i64_field(fields::MODIFIED_TS, INDEXED | FAST);

    schema_builder.add_text_field(fields::NAME, TEXT);

    schema_builder.build()
}

/// Field handles resolved once per index.
#[derive(Debug, Clone, Copy)]
pub struct PictureFields {
    pub id: Field,
    pub tag: Field,
    pub grade: Field,
    pub width: Field,
    pub height: Field,
    pub added_ts: Field,
    pub creation_ts: Field,
    pub modified_ts: Field,
    pub name: Field,
}

impl PictureFields {
    pub fn resolve(schema: &Schema) -> Result<Self, IndexError> {
        Ok(Self {
            id: schema.get_field(fields::ID)?,
            tag: schema.get_field(fields::TAG)?,
            grade: schema.get_field(fields::GRADE)?,
            width: schema.get_field(fields::WIDTH)?,
            height: schema.get_field(fields::HEIGHT)?,
            added_ts: schema.get_field(fields::ADDED_TS)?,
            creation_ts: schema.get_field(fields::CREATION_TS)?,
            modified_ts: schema.get_field(fields::MODIFIED_TS)?,
            name: schema.get_field(fields::NAME)?,
        })
    }
}
