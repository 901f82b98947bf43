use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::error::{IndexError, Result};

/// 协作式取消令牌：clone 后共享同一个标志位。
///
/// 查询只在粗粒度处检查（每个 category 一次），不在逐字符匹配中检查。
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// 已取消则返回 `Err(IndexError::Cancelled)`。
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        Ok(())
    }
}

/// 可选令牌的便捷检查。
pub(crate) fn check_cancel(cancel: Option<&CancelToken>) -> Result<()> {
    match cancel {
        Some(c) => c.check(),
        None => Ok(()),
    }
}
