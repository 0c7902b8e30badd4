//! Error types for every layer of a picture bank.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::tags::TagId;

/// Errors raised by the SQL gateway.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("database connection is closed")]
    Closed,
}

/// Errors raised by the full-text index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index is corrupt: {0}")]
    Corrupt(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("malformed query: {0}")]
    Query(String),

    #[error("index is closed")]
    Closed,
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(e: tantivy::TantivyError) -> Self {
        match e {
            tantivy::TantivyError::DataCorruption(corruption) => {
                IndexError::Corrupt(format!("{corruption:?}"))
            }
            other => IndexError::Index(other.to_string()),
        }
    }
}

impl From<tantivy::query::QueryParserError> for IndexError {
    fn from(e: tantivy::query::QueryParserError) -> Self {
        IndexError::Query(e.to_string())
    }
}

impl From<tantivy::directory::error::OpenDirectoryError> for IndexError {
    fn from(e: tantivy::directory::error::OpenDirectoryError) -> Self {
        IndexError::Index(e.to_string())
    }
}

/// Errors raised by the image processor and the external tools it drives.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("unrecognised identify output: {0}")]
    Parse(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("image processor is shut down")]
    Shutdown,
}

/// Errors raised by tag repository operations.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("there is already a tag named {0:?}")]
    DuplicateTagName(String),

    #[error("the tag name {0:?} is malformed")]
    MalformedTagName(String),

    #[error("{0} isn't a valid tag id for this operation")]
    IllegalTagId(TagId),

    #[error("tag {0} is uneditable")]
    UneditableTag(TagId),

    #[error("tag {0} still has children")]
    TagHasChildren(TagId),

    #[error("no more tag ids available")]
    NoMoreIds,

    #[error("SQL error during the insertion of the tag: {0}")]
    SqlInsertError(#[source] DbError),

    #[error("SQL error during the removal of the tag: {0}")]
    SqlRemovalError(#[source] DbError),
}

/// Errors raised when mutating a picture.
#[derive(Debug, Error)]
pub enum PictureError {
    #[error("grade {0} is out of range (0-5)")]
    InvalidGrade(u8),

    #[error("unknown tag {0}")]
    UnknownTag(TagId),

    #[error("tag {0} is a category and can't be attached to a picture")]
    UnselectableTag(TagId),

    #[error("picture {0} belongs to a closed bank")]
    Closed(String),
}

/// Discriminant of an [`AddError`], used to aggregate directory imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddErrorKind {
    CantRead,
    NotAFile,
    NotADirectory,
    FileNotFound,
    FileAlreadyExists,
    IdentifyExecutionError,
    CopyError,
    IoError,
    SqlInsertError,
    CorruptIndexError,
    IndexError,
    Closed,
}

impl fmt::Display for AddErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddErrorKind::CantRead => "can't read",
            AddErrorKind::NotAFile => "not a file",
            AddErrorKind::NotADirectory => "not a directory",
            AddErrorKind::FileNotFound => "file not found",
            AddErrorKind::FileAlreadyExists => "file already exists",
            AddErrorKind::IdentifyExecutionError => "identify failed",
            AddErrorKind::CopyError => "copy failed",
            AddErrorKind::IoError => "I/O error",
            AddErrorKind::SqlInsertError => "SQL insert failed",
            AddErrorKind::CorruptIndexError => "index corrupt",
            AddErrorKind::IndexError => "index write failed",
            AddErrorKind::Closed => "bank closed",
        };
        f.write_str(name)
    }
}

/// Failure to ingest a picture or a directory.
#[derive(Debug, Error)]
pub enum AddError {
    #[error("can't read {0}")]
    CantRead(PathBuf),

    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("{0} not found")]
    FileNotFound(PathBuf),

    #[error("picture {id} already exists")]
    FileAlreadyExists { id: String },

    #[error("identify failed for picture {id}: {source}")]
    IdentifyExecutionError {
        id: String,
        #[source]
        source: ProcessError,
    },

    #[error("copy failed for picture {id}: {source}")]
    CopyError {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("SQL insert failed for picture {id}: {source}")]
    SqlInsertError {
        id: String,
        #[source]
        source: DbError,
    },

    #[error("index is corrupt, picture {id} not indexed: {source}")]
    CorruptIndexError {
        id: String,
        #[source]
        source: IndexError,
    },

    #[error("index write failed for picture {id}: {source}")]
    IndexError {
        id: String,
        #[source]
        source: IndexError,
    },

    #[error("picture bank {0} is closed")]
    Closed(u32),
}

impl AddError {
    pub fn kind(&self) -> AddErrorKind {
        match self {
            AddError::CantRead(_) => AddErrorKind::CantRead,
            AddError::NotAFile(_) => AddErrorKind::NotAFile,
            AddError::NotADirectory(_) => AddErrorKind::NotADirectory,
            AddError::FileNotFound(_) => AddErrorKind::FileNotFound,
            AddError::FileAlreadyExists { .. } => AddErrorKind::FileAlreadyExists,
            AddError::IdentifyExecutionError { .. } => AddErrorKind::IdentifyExecutionError,
            AddError::CopyError { .. } => AddErrorKind::CopyError,
            AddError::IoError { .. } => AddErrorKind::IoError,
            AddError::SqlInsertError { .. } => AddErrorKind::SqlInsertError,
            AddError::CorruptIndexError { .. } => AddErrorKind::CorruptIndexError,
            AddError::IndexError { .. } => AddErrorKind::IndexError,
            AddError::Closed(_) => AddErrorKind::Closed,
        }
    }

    /// Id of the picture involved, when hashing got far enough to compute it.
    pub fn picture_id(&self) -> Option<&str> {
        match self {
            AddError::FileAlreadyExists { id }
            | AddError::IdentifyExecutionError { id, .. }
            | AddError::CopyError { id, .. }
            | AddError::SqlInsertError { id, .. }
            | AddError::CorruptIndexError { id, .. }
            | AddError::IndexError { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Errors raised while moving a [`crate::Browser`].
#[derive(Debug, Error)]
pub enum BrowseError {
    #[error("no next picture")]
    NoNext,

    #[error("no previous picture")]
    NoPrevious,

    #[error("can't load picture {id}: {source}")]
    Load {
        id: String,
        #[source]
        source: Box<BankError>,
    },
}

/// Errors raised by bank-level operations other than ingestion.
#[derive(Debug, Error)]
pub enum BankError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Picture(#[from] PictureError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Browse(#[from] BrowseError),

    #[error("unknown picture {0}")]
    UnknownPicture(String),

    #[error("can't create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("picture bank {0} is closed")]
    Closed(u32),
}

/// Errors raised by the bank registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("picture bank {0} is not open")]
    NoOpenPictureBank(u32),

    #[error("picture bank {0} is not registered")]
    UnknownPictureBank(u32),
}
