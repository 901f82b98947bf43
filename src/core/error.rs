use thiserror::Error;

/// 索引引擎的统一错误类型。
///
/// 格式不匹配/结构损坏在 `initialize` 阶段就地恢复为空库，不会出现在这里；
/// 这里只保留需要调用方感知的情况。
#[derive(Debug, Error)]
pub enum IndexError {
    /// 后备文件读写失败：本次操作失败，Index 本身仍可继续使用。
    #[error("index I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// 新快照目录段编码失败（与 I/O 失败同等对待）。
    #[error("index snapshot encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    /// posting 惰性解码时发现的损坏，只影响当前这次查询。
    #[error("index data corrupt: {0}")]
    Corrupt(String),

    #[error("invalid match rule: {0:#06x}")]
    InvalidMatchRule(i32),

    /// 调用方取消；不是失败，用于区分“无结果”与“被中止”。
    #[error("query cancelled")]
    Cancelled,
}

impl IndexError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IndexError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
