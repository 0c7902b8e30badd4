//! Content-addressed picture bank.
//!
//! A bank stores each picture once, under the uppercase SHA-256 of its bytes,
//! keeps its grade and tags in SQLite and mirrors them into a tantivy index
//! for queries. A [`BankRegistry`] manages several banks and opens the
//! selected ones.

pub mod bank;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod index;
pub mod logging;
pub mod process;
pub mod registry;
pub mod scanner;
pub mod tags;

pub use bank::{AddResult, Browser, Picture, PictureBank, PictureRecord, PictureSource};
pub use config::{Config, ImageTool, PictureBankConfig};
pub use error::{
    AddError, AddErrorKind, BankError, BrowseError, DbError, IndexError, PictureError,
    ProcessError, RegistryError, TagError,
};
pub use events::{BankEvent, EventBus, SubscriberId};
pub use index::PictureQuery;
pub use registry::BankRegistry;
pub use tags::{Tag, TagId, TagRepository, ROOT_TAG_ID};
