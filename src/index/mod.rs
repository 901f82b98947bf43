pub mod memory;
pub mod monitor;
pub mod persisted;
pub mod result;
pub mod tiered;

use crate::core::{CancelToken, Result};
use crate::query::matcher::MatchRule;

/// 可被查询组合器驱动的条目来源。
///
/// `Index` 是唯一的生产实现；测试里用它数调用次数。
pub trait EntrySource: Send + Sync {
    /// 来源所属容器（文档名只在同一容器内可比）。
    fn container(&self) -> &str;

    fn query_entries(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<EntryResult>>;
}

impl EntrySource for Index {
    fn container(&self) -> &str {
        self.container_path()
    }

    fn query_entries(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<EntryResult>> {
        self.query_with_cancel(categories, key, rule, cancel)
    }
}

pub use memory::MemoryDelta;
pub use monitor::{ExclusiveAccess, ReadWriteMonitor, SharedAccess};
pub use persisted::PersistedStore;
pub use result::EntryResult;
pub use tiered::Index;
