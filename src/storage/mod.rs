pub mod mmap;
pub mod snapshot;

pub use mmap::MmapStorage;
pub use snapshot::{load_if_valid, write_atomic, LoadedSnapshot, StoreDirectory};
