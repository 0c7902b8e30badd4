pub const SCHEMA: &str = r#"
-- Tag vocabulary. The root tag (id 0) is implicit and never stored;
-- top-level tags have parent_id 0.
CREATE TABLE IF NOT EXISTS tag (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    parent_id INTEGER NOT NULL DEFAULT 0,
    selectable INTEGER NOT NULL DEFAULT 1
);

-- Pictures, keyed by the uppercase SHA-256 of their content
CREATE TABLE IF NOT EXISTS picture (
    id TEXT PRIMARY KEY,
    grade INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    original_name TEXT NOT NULL,
    creation_ts INTEGER NOT NULL,
    modified_ts INTEGER NOT NULL,
    added_ts INTEGER NOT NULL,
    path TEXT NOT NULL
);

-- Tag assignments. Requires PRAGMA foreign_keys = ON.
CREATE TABLE IF NOT EXISTS picture_tag (
    tag_id INTEGER NOT NULL REFERENCES tag(id) ON DELETE CASCADE,
    picture_id TEXT NOT NULL REFERENCES picture(id) ON DELETE CASCADE,
    PRIMARY KEY (tag_id, picture_id)
);

-- Bank-wide counters
CREATE TABLE IF NOT EXISTS bank_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_picture_added_ts ON picture(added_ts);
CREATE INDEX IF NOT EXISTS idx_picture_tag_picture ON picture_tag(picture_id);
"#;

/// `bank_meta` key holding the highest tag id ever allocated.
pub const TAG_ID_HIGH_WATER: &str = "tag_id_high_water";
