use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::core::{
    check_cancel, CancelToken, IndexConfig, Result, ARCHIVE_ENTRY_SEPARATOR,
};
use crate::index::memory::MemoryDelta;
use crate::index::monitor::{ReadWriteMonitor, SharedAccess};
use crate::index::persisted::PersistedStore;
use crate::index::result::EntryResult;
use crate::query::matcher::{KeyMatcher, MatchRule};
use crate::stats::{DeltaStats, IndexStats};

#[cfg(feature = "mimalloc")]
fn maybe_trim_rss() {
    // mimalloc 作为全局分配器时，glibc 的 malloc_trim 无效，需要调用 mimalloc 自己的回收。
    extern "C" {
        fn mi_collect(force: bool);
    }
    unsafe { mi_collect(true) };
}

#[cfg(all(not(feature = "mimalloc"), target_os = "linux", target_env = "gnu"))]
fn maybe_trim_rss() {
    // glibc malloc 的主动回吐：释放尽可能多的空闲块回 OS。
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(all(
    not(feature = "mimalloc"),
    not(all(target_os = "linux", target_env = "gnu"))
))]
fn maybe_trim_rss() {}

/// 一个容器的索引：内存 Delta + 持久层，对外呈现为统一视图。
///
/// - 查询：共享访问；delta 达到阈值且调用方是唯一读者时顺带 compaction。
/// - `save()`：独占访问；持久层通过 `ArcSwap` 整体替换，并发读者看到的要么是旧快照要么是新快照。
/// - 写入（`add_index_entry`/`remove`）：每个容器只有一个逻辑写者。
pub struct Index {
    container_path: String,
    location: PathBuf,
    separator: char,
    store: ArcSwap<PersistedStore>,
    delta: RwLock<MemoryDelta>,
    monitor: ReadWriteMonitor,
    reclaim_threshold: AtomicUsize,
    compactions: AtomicU64,
}

impl Index {
    /// 打开（或新建）位于 `location` 的索引。
    pub fn open(
        location: impl Into<PathBuf>,
        container_path: impl Into<String>,
        config: &IndexConfig,
        reuse_existing: bool,
    ) -> Result<Self> {
        let location = location.into();
        let mut container_path = container_path.into();
        while container_path.len() > 1 && container_path.ends_with(config.separator) {
            container_path.pop();
        }
        let store = PersistedStore::initialize(&location, config.separator, reuse_existing)?;
        Ok(Self {
            container_path,
            location,
            separator: config.separator,
            store: ArcSwap::from_pointee(store),
            delta: RwLock::new(MemoryDelta::with_merge_threshold(config.merge_threshold)),
            monitor: ReadWriteMonitor::new(),
            reclaim_threshold: AtomicUsize::new(config.reclaim_threshold),
            compactions: AtomicU64::new(0),
        })
    }

    /// 重新打开后备文件并清空 delta。
    pub fn initialize(&self, reuse_existing: bool) -> Result<()> {
        self.with_exclusive_access(|| -> Result<()> {
            let store = PersistedStore::initialize(&self.location, self.separator, reuse_existing)?;
            self.store.store(Arc::new(store));
            let mut delta = self.delta.write();
            *delta = MemoryDelta::with_merge_threshold(delta.merge_threshold());
            Ok(())
        })
    }

    /// 丢弃两层内容，从空库重来（检测到损坏或强制全量重建时使用）。
    pub fn reset(&self) -> Result<()> {
        tracing::info!("Resetting index {:?}", self.location);
        self.initialize(false)
    }

    pub fn add_index_entry(&self, category: &str, key: &str, document: &str) {
        self.delta.write().add_entry(category, key, document);
    }

    pub fn remove(&self, document: &str) {
        self.delta.write().remove(document);
    }

    pub fn has_changed(&self) -> bool {
        self.delta.read().has_changed()
    }

    pub fn query(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
    ) -> Result<Vec<EntryResult>> {
        self.query_with_cancel(categories, key, rule, None)
    }

    /// 两层联合查询，结果按键排序。
    pub fn query_with_cancel(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<EntryResult>> {
        check_cancel(cancel)?;
        let _access = self.enter_query()?;
        self.query_shared(categories, key, rule, cancel)
    }

    /// 在调用方已打开的查询括号（`start_query`）内查询：不再单独进入共享访问，也不检查 compaction。
    ///
    /// # Panics
    /// debug 构建下，没有任何打开的读者时 panic。
    pub fn query_in_bracket(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<EntryResult>> {
        debug_assert!(
            self.monitor.status() > 0,
            "query_in_bracket called on {:?} without an open query bracket",
            self.location
        );
        check_cancel(cancel)?;
        self.query_shared(categories, key, rule, cancel)
    }

    /// 须在共享访问下调用。
    fn query_shared(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<EntryResult>> {
        let matcher = KeyMatcher::new(key, rule);
        let mut results = HashMap::new();
        {
            let delta = self.delta.read();
            let store = self.store.load();
            let overlay = delta.has_changed().then_some(&*delta);
            store.fold_query_results(categories, &matcher, &mut results, overlay, cancel)?;
            delta.fold_query_results(categories, &matcher, &mut results, cancel)?;
        }

        let mut out: Vec<EntryResult> = results.into_values().collect();
        out.sort_by(|a, b| a.word().cmp(b.word()));
        tracing::debug!("Query hit: {} keys", out.len());
        Ok(out)
    }

    /// 所有包含 `substring` 的文档名（升序）；没有任何文档时返回 `None`。
    pub fn query_document_names(&self, substring: Option<&str>) -> Result<Option<Vec<String>>> {
        self.query_document_names_with_cancel(substring, None)
    }

    pub fn query_document_names_with_cancel(
        &self,
        substring: Option<&str>,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Vec<String>>> {
        check_cancel(cancel)?;
        let names = self.with_shared_access(|| {
            let delta = self.delta.read();
            let overlay = delta.has_changed().then_some(&*delta);
            let names = self.store.load().add_document_names(substring, overlay);
            delta.add_document_names(substring, names)
        });
        check_cancel(cancel)?;

        if names.is_empty() {
            return Ok(None);
        }
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort_unstable();
        Ok(Some(names))
    }

    /// 把 delta 合并进持久层。阻塞到所有读者离开；调用线程自己不得持有打开的查询括号。
    pub fn save(&self) -> Result<()> {
        self.with_exclusive_access(|| self.save_locked())
    }

    /// 打开一个查询括号：括号内持久层不会被替换，也不会触发 compaction。
    pub fn start_query(&self) {
        self.monitor.enter_read();
    }

    /// # Panics
    /// 没有对应的 `start_query` 时 panic。
    pub fn stop_query(&self) {
        self.monitor.exit_read();
    }

    pub fn with_shared_access<R>(&self, f: impl FnOnce() -> R) -> R {
        let _access = self.monitor.shared();
        f()
    }

    pub fn with_exclusive_access<R>(&self, f: impl FnOnce() -> R) -> R {
        let _access = self.monitor.exclusive();
        f()
    }

    pub fn container_path(&self) -> &str {
        &self.container_path
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn index_location(&self) -> &Path {
        &self.location
    }

    pub fn index_last_modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.location)
            .and_then(|m| m.modified())
            .ok()
    }

    /// 文档在容器内的相对路径。
    ///
    /// 归档条目（`archive.jar|pkg/A.class`）取 `|` 之后的部分；否则去掉容器路径和一个分隔符。
    ///
    /// # Panics
    /// 路径不在容器内时 panic：这是调用方的编程错误。
    pub fn container_relative_path(&self, document_path: &str) -> String {
        if let Some((_, entry)) = document_path.split_once(ARCHIVE_ENTRY_SEPARATOR) {
            return entry.to_string();
        }
        let rest = document_path
            .strip_prefix(self.container_path.as_str())
            .and_then(|r| r.strip_prefix(self.separator))
            .filter(|r| !r.is_empty());
        match rest {
            Some(r) => r.to_string(),
            None => panic!(
                "document path {:?} must be relative to {:?}",
                document_path, self.container_path
            ),
        }
    }

    /// 运行时调整阈值（merge：delta 文档数；reclaim：单次 compaction 文档数）。
    pub fn set_thresholds(&self, merge_threshold: usize, reclaim_threshold: usize) {
        self.delta.write().set_merge_threshold(merge_threshold);
        self.reclaim_threshold
            .store(reclaim_threshold, Ordering::Relaxed);
    }

    pub fn stats(&self) -> IndexStats {
        let delta = self.delta.read();
        IndexStats {
            container: self.container_path.clone(),
            location: self.location.clone(),
            delta: DeltaStats {
                documents: delta.document_count(),
                tombstones: delta.tombstone_count(),
                entries: delta.entry_count(),
                estimated_bytes: delta.estimated_bytes(),
            },
            store: self.store.load().stats(),
            merge_threshold: delta.merge_threshold(),
            reclaim_threshold: self.reclaim_threshold.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            monitor_status: self.monitor.status(),
            process_rss_bytes: IndexStats::read_process_rss(),
        }
    }

    /// 进入共享访问；需要 compaction 且调用方是唯一读者时先升级完成 save 再降级。
    fn enter_query(&self) -> Result<SharedAccess<'_>> {
        let access = self.monitor.shared();
        if !self.delta.read().should_merge() {
            return Ok(access);
        }
        match access.try_upgrade() {
            Ok(exclusive) => {
                let res = self.save_locked();
                let access = exclusive.downgrade();
                res?;
                Ok(access)
            }
            Err(access) => {
                tracing::debug!(
                    "Index {:?} busy ({} readers), deferring compaction",
                    self.location,
                    self.monitor.status()
                );
                Ok(access)
            }
        }
    }

    /// 须在独占访问下调用。
    fn save_locked(&self) -> Result<()> {
        let mut delta = self.delta.write();
        if !delta.has_changed() {
            tracing::debug!("No delta changes, skipping save");
            return Ok(());
        }

        let started = Instant::now();
        let touched = delta.modified_document_count();
        let merged = self.store.load().merge_with(&delta)?;
        let documents = merged.document_count();
        self.store.store(Arc::new(merged));
        *delta = MemoryDelta::with_merge_threshold(delta.merge_threshold());
        drop(delta);

        self.compactions.fetch_add(1, Ordering::Relaxed);
        if touched > self.reclaim_threshold.load(Ordering::Relaxed) {
            tracing::debug!("Large compaction ({} docs), triggering RSS trim", touched);
            maybe_trim_rss();
        }
        tracing::info!(
            "Compaction complete: {} docs touched, {} docs stored, {:?}",
            touched,
            documents,
            started.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("symdex-index-{}-{}", tag, nanos))
    }

    fn open(tag: &str) -> Index {
        let path = unique_tmp_dir(tag).join("index.sydx");
        Index::open(path, "/ws/proj", &IndexConfig::default(), false).unwrap()
    }

    fn docs_for(index: &Index, key: &str) -> Vec<String> {
        let hits = index
            .query(&["type"], Some(key), MatchRule::exact())
            .unwrap();
        assert!(hits.len() <= 1);
        hits.first()
            .map(|r| r.document_names().unwrap())
            .unwrap_or_default()
    }

    #[test]
    fn fresh_entries_are_visible_before_save() {
        let index = open("visible");
        index.add_index_entry("type", "Foo", "a.java");
        assert!(index.has_changed());
        assert_eq!(docs_for(&index, "Foo"), vec!["a.java"]);
    }

    #[test]
    fn save_is_observation_neutral() {
        let index = open("neutral");
        index.add_index_entry("type", "Foo", "a.java");
        index.add_index_entry("type", "FooBar", "b.java");
        index.add_index_entry("method", "foo", "c.java");

        let before: Vec<(String, Vec<String>)> = index
            .query(&["type", "method"], Some("foo"), MatchRule::prefix())
            .unwrap()
            .iter()
            .map(|r| (r.word().to_string(), r.document_names().unwrap()))
            .collect();
        index.save().unwrap();
        assert!(!index.has_changed());
        let after: Vec<(String, Vec<String>)> = index
            .query(&["type", "method"], Some("foo"), MatchRule::prefix())
            .unwrap()
            .iter()
            .map(|r| (r.word().to_string(), r.document_names().unwrap()))
            .collect();
        assert_eq!(before, after);
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn removal_survives_compaction() {
        let index = open("remove");
        index.add_index_entry("type", "Foo", "a.java");
        index.add_index_entry("type", "Foo", "b.java");
        index.save().unwrap();

        index.remove("a.java");
        assert_eq!(docs_for(&index, "Foo"), vec!["b.java"]);
        index.save().unwrap();
        assert_eq!(docs_for(&index, "Foo"), vec!["b.java"]);
    }

    #[test]
    fn reindexed_document_replaces_persisted_entries() {
        let index = open("reindex");
        index.add_index_entry("type", "Old", "a.java");
        index.save().unwrap();

        index.remove("a.java");
        index.add_index_entry("type", "New", "a.java");
        assert!(docs_for(&index, "Old").is_empty());
        assert_eq!(docs_for(&index, "New"), vec!["a.java"]);
        index.save().unwrap();
        assert!(docs_for(&index, "Old").is_empty());
        assert_eq!(docs_for(&index, "New"), vec!["a.java"]);
    }

    #[test]
    fn second_save_is_noop() {
        let index = open("idempotent");
        index.add_index_entry("type", "Foo", "a.java");
        index.save().unwrap();
        assert!(!index.has_changed());
        let modified = index.index_last_modified();
        index.save().unwrap();
        assert_eq!(index.stats().compactions, 1);
        assert_eq!(index.index_last_modified(), modified);
    }

    #[test]
    fn query_compacts_when_threshold_reached() {
        let index = open("auto");
        index.set_thresholds(2, 1000);
        index.add_index_entry("type", "Foo", "a.java");
        index.add_index_entry("type", "Foo", "b.java");

        assert_eq!(docs_for(&index, "Foo"), vec!["a.java", "b.java"]);
        assert!(!index.has_changed());
        assert_eq!(index.stats().compactions, 1);
        assert_eq!(index.monitor.status(), 0);
    }

    #[test]
    fn open_bracket_defers_compaction() {
        let index = open("bracket");
        index.set_thresholds(1, 1000);
        index.add_index_entry("type", "Foo", "a.java");

        index.start_query();
        assert_eq!(docs_for(&index, "Foo"), vec!["a.java"]);
        assert!(index.has_changed());
        index.stop_query();

        assert_eq!(docs_for(&index, "Foo"), vec!["a.java"]);
        assert!(!index.has_changed());
    }

    #[test]
    fn document_names_union_both_tiers() {
        let index = open("names");
        assert_eq!(index.query_document_names(None).unwrap(), None);

        index.add_index_entry("type", "A", "src/A.java");
        index.save().unwrap();
        index.add_index_entry("type", "B", "src/B.java");
        index.add_index_entry("type", "C", "lib/C.java");

        let all = index.query_document_names(None).unwrap().unwrap();
        assert_eq!(all, vec!["lib/C.java", "src/A.java", "src/B.java"]);
        let src = index.query_document_names(Some("src/")).unwrap().unwrap();
        assert_eq!(src, vec!["src/A.java", "src/B.java"]);
        assert_eq!(index.query_document_names(Some("zzz")).unwrap(), None);

        index.remove("src/A.java");
        let src = index.query_document_names(Some("src/")).unwrap().unwrap();
        assert_eq!(src, vec!["src/B.java"]);
    }

    #[test]
    fn bracket_query_skips_compaction_check() {
        let index = open("in-bracket");
        index.set_thresholds(1, 1000);
        index.add_index_entry("type", "Foo", "a.java");

        index.start_query();
        for _ in 0..3 {
            let hits = index
                .query_in_bracket(&["type"], Some("Foo"), MatchRule::exact(), None)
                .unwrap();
            assert_eq!(hits[0].document_names().unwrap(), vec!["a.java"]);
            assert_eq!(index.monitor.status(), 1);
        }
        assert!(index.has_changed());
        index.stop_query();
        assert_eq!(index.stats().compactions, 0);
    }

    #[test]
    #[should_panic(expected = "without an open query bracket")]
    #[cfg(debug_assertions)]
    fn bracket_query_without_bracket_panics() {
        let index = open("no-bracket");
        let _ = index.query_in_bracket(&["type"], None, MatchRule::exact(), None);
    }

    #[test]
    fn trailing_separator_on_container_is_ignored() {
        let path = unique_tmp_dir("trailing").join("index.sydx");
        let index = Index::open(path, "/ws/proj/", &IndexConfig::default(), false).unwrap();
        assert_eq!(index.container_path(), "/ws/proj");
        assert_eq!(
            index.container_relative_path("/ws/proj/src/A.java"),
            "src/A.java"
        );

        let path = unique_tmp_dir("root").join("index.sydx");
        let root = Index::open(path, "/", &IndexConfig::default(), false).unwrap();
        assert_eq!(root.container_path(), "/");
    }

    #[test]
    fn cancelled_query_reports_cancellation() {
        let index = open("cancel");
        index.add_index_entry("type", "Foo", "a.java");
        let token = CancelToken::new();
        token.cancel();
        let err = index
            .query_with_cancel(&["type"], None, MatchRule::exact(), Some(&token))
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(index.monitor.status(), 0);
    }

    #[test]
    fn reopen_keeps_saved_entries() {
        let dir = unique_tmp_dir("restart");
        let path = dir.join("index.sydx");
        {
            let index = Index::open(&path, "/ws/proj", &IndexConfig::default(), false).unwrap();
            index.add_index_entry("type", "Foo", "a.java");
            index.add_index_entry("type", "Bar", "b.java");
            index.save().unwrap();
            index.add_index_entry("type", "Lost", "c.java");
        }
        let index = Index::open(&path, "/ws/proj", &IndexConfig::default(), true).unwrap();
        assert_eq!(docs_for(&index, "Foo"), vec!["a.java"]);
        assert!(docs_for(&index, "Lost").is_empty());

        index.reset().unwrap();
        assert!(docs_for(&index, "Foo").is_empty());
        assert_eq!(index.stats().store.documents, 0);
    }

    #[test]
    fn relative_paths_strip_container_or_archive() {
        let index = open("relative");
        assert_eq!(
            index.container_relative_path("/ws/proj/src/A.java"),
            "src/A.java"
        );
        assert_eq!(
            index.container_relative_path("/libs/rt.jar|java/lang/Object.class"),
            "java/lang/Object.class"
        );
    }

    #[test]
    #[should_panic(expected = "must be relative to")]
    fn path_outside_container_panics() {
        let index = open("outside");
        index.container_relative_path("/elsewhere/A.java");
    }

    #[test]
    fn concurrent_queries_agree_during_save() {
        let index = open("concurrent");
        for i in 0..50 {
            index.add_index_entry("type", "Foo", &format!("doc{:02}.java", i));
        }
        index.save().unwrap();
        for i in 50..100 {
            index.add_index_entry("type", "Foo", &format!("doc{:02}.java", i));
        }
        let expected: Vec<String> = (0..100).map(|i| format!("doc{:02}.java", i)).collect();

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..20 {
                        assert_eq!(docs_for(&index, "Foo"), expected);
                    }
                });
            }
            s.spawn(|| index.save().unwrap());
        });
        assert!(!index.has_changed());
        assert_eq!(docs_for(&index, "Foo"), expected);
    }
}
