#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod core;
pub mod index;
pub mod query;
pub mod stats;
pub mod storage;

pub use crate::core::{CancelToken, IndexConfig, IndexError, Result};
pub use crate::index::{EntryResult, EntrySource, Index};
pub use crate::query::{IntersectingQuery, MatchKind, MatchRule, SubPattern};
pub use crate::stats::IndexStats;
