//! Persistent directory tree mapping virtual paths to backing files.

pub mod checker;
pub mod error;
pub mod file_info;
pub mod kv;
pub mod path_index;

pub use checker::{CheckReport, ConsistencyChecker};
pub use error::IndexError;
pub use file_info::{FileId, FileInfo};
pub use kv::{KvStore, WriteBatch};
pub use path_index::{PathIndex, validate_name};
