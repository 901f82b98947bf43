use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 默认：delta 中被修改的文档数达到该值时，查询路径上顺带触发 compaction。
pub const DEFAULT_MERGE_THRESHOLD: usize = 100;
/// 默认：单次 compaction 触及的文档数超过该值时，主动回吐内存。
pub const DEFAULT_RECLAIM_THRESHOLD: usize = 1000;
/// 默认文档路径分隔符（写入持久层，用于识别用其它分隔符写出的旧文件）。
pub const DEFAULT_SEPARATOR: char = '/';
/// 归档成员路径分隔符：`archive-path|member-path`。
pub const ARCHIVE_ENTRY_SEPARATOR: char = '|';

/// Index 运行参数。两个阈值都是经验值，不承担正确性。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    pub merge_threshold: usize,
    pub reclaim_threshold: usize,
    pub separator: char,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            reclaim_threshold: DEFAULT_RECLAIM_THRESHOLD,
            separator: DEFAULT_SEPARATOR,
        }
    }
}

impl IndexConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// 显式路径优先；否则尝试 `<config_dir>/symdex/config.toml`，不存在则用默认值。
    pub fn load_or_default(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(p) = explicit {
            return Self::load(p);
        }
        match default_config_path() {
            Some(p) if p.exists() => {
                tracing::info!("Loading config from {:?}", p);
                Self::load(&p)
            }
            _ => Ok(Self::default()),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("symdex").join("config.toml"))
}
