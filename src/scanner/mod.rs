pub mod discovery;
pub mod hashing;

pub use discovery::discover_files;
pub use hashing::{hash_file, hash_reader, HASH_CHUNK_SIZE};
