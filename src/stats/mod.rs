use std::fmt;
use std::path::PathBuf;

/// 单个 Index 的状态快照
#[derive(Clone, Debug, Default)]
pub struct IndexStats {
    pub container: String,
    pub location: PathBuf,
    /// 内存 Delta
    pub delta: DeltaStats,
    /// 持久层
    pub store: StoreStats,
    pub merge_threshold: usize,
    pub reclaim_threshold: usize,
    /// 启动以来完成的 compaction 次数
    pub compactions: u64,
    /// 监视器计数：>0 活跃读者数，-1 正在 compaction
    pub monitor_status: i32,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

#[derive(Clone, Debug, Default)]
pub struct DeltaStats {
    pub documents: usize,
    pub tombstones: usize,
    pub entries: usize,
    /// 估算内存（字节）
    pub estimated_bytes: u64,
}

#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub documents: usize,
    pub categories: usize,
    /// 所有 category 的键总数
    pub keys: usize,
    pub file_bytes: u64,
}

impl IndexStats {
    /// 从 /proc/self/statm 读取进程 RSS；非 Linux 返回 0
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for IndexStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.monitor_status {
            s if s < 0 => "compacting".to_string(),
            0 => "idle".to_string(),
            s => format!("{} readers", s),
        };
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           symdex Index Report                    ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Container: {}", self.container)?;
        writeln!(f, "║ Location:  {}", self.location.display())?;
        writeln!(f, "║ State:     {:>37} ║", state)?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Memory Delta:                                    ║")?;
        writeln!(
            f,
            "║   documents:    {:>10}                       ║",
            self.delta.documents
        )?;
        writeln!(
            f,
            "║   tombstones:   {:>10}                       ║",
            self.delta.tombstones
        )?;
        writeln!(
            f,
            "║   entries:      {:>10}                       ║",
            self.delta.entries
        )?;
        writeln!(
            f,
            "║   estimated:    {:>10}                       ║",
            human_bytes(self.delta.estimated_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Persisted Store:                                 ║")?;
        writeln!(
            f,
            "║   documents:    {:>10}                       ║",
            self.store.documents
        )?;
        writeln!(
            f,
            "║   categories:   {:>10}                       ║",
            self.store.categories
        )?;
        writeln!(
            f,
            "║   keys:         {:>10}                       ║",
            self.store.keys
        )?;
        writeln!(
            f,
            "║   file:         {:>10}                       ║",
            human_bytes(self.store.file_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║ merge at {:>6} docs, trim at {:>6} docs         ║",
            self.merge_threshold, self.reclaim_threshold
        )?;
        writeln!(
            f,
            "║ compactions:    {:>10}                       ║",
            self.compactions
        )?;
        write!(f, "╚══════════════════════════════════════════════════╝")
    }
}
