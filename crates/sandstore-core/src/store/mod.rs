//! Virtual filesystem operations over obfuscated backing files.

pub mod obfuscated;
pub mod path;
pub mod registry;

pub use obfuscated::{CopyOrMoveMode, EntryMetadata, ObfuscatedStore};
pub use path::VirtualPath;
pub use registry::{SharedStore, StoreRegistry};
