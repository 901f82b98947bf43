use std::collections::{HashMap, HashSet};

use crate::core::{check_cancel, CancelToken, Result, DEFAULT_MERGE_THRESHOLD};
use crate::index::result::EntryResult;
use crate::query::matcher::{KeyMatcher, MatchRule};

/// 一个文档在本轮 delta 中登记的条目：category -> keys
pub type DocumentEntries = HashMap<String, HashSet<String>>;

/// 内存 Delta：上次 compaction 以来新增/删除的文档。
///
/// - `documents` 与 `tombstones` 互斥：add 会抵消 tombstone，remove 会丢弃已登记条目。
/// - delta 认识的每个文档（无论新增还是删除）都会整体屏蔽持久层中该文档的旧条目。
#[derive(Debug)]
pub struct MemoryDelta {
    documents: HashMap<String, DocumentEntries>,
    tombstones: HashSet<String>,
    entry_count: usize,
    merge_threshold: usize,
}

impl Default for MemoryDelta {
    fn default() -> Self {
        Self::with_merge_threshold(DEFAULT_MERGE_THRESHOLD)
    }
}

impl MemoryDelta {
    pub fn with_merge_threshold(merge_threshold: usize) -> Self {
        Self {
            documents: HashMap::new(),
            tombstones: HashSet::new(),
            entry_count: 0,
            merge_threshold,
        }
    }

    pub fn merge_threshold(&self) -> usize {
        self.merge_threshold
    }

    pub fn set_merge_threshold(&mut self, merge_threshold: usize) {
        self.merge_threshold = merge_threshold;
    }

    pub fn add_entry(&mut self, category: &str, key: &str, document: &str) {
        self.tombstones.remove(document);
        let table = self.documents.entry(document.to_string()).or_default();
        let keys = match table.get_mut(category) {
            Some(k) => k,
            None => table.entry(category.to_string()).or_default(),
        };
        if keys.insert(key.to_string()) {
            self.entry_count += 1;
        }
    }

    pub fn remove(&mut self, document: &str) {
        if let Some(table) = self.documents.remove(document) {
            let dropped: usize = table.values().map(HashSet::len).sum();
            self.entry_count = self.entry_count.saturating_sub(dropped);
        }
        self.tombstones.insert(document.to_string());
    }

    pub fn has_changed(&self) -> bool {
        !self.documents.is_empty() || !self.tombstones.is_empty()
    }

    /// 被修改的不同文档数达到阈值：查询路径上应顺带 compaction。
    pub fn should_merge(&self) -> bool {
        self.merge_threshold > 0 && self.modified_document_count() >= self.merge_threshold
    }

    pub fn modified_document_count(&self) -> usize {
        self.documents.len() + self.tombstones.len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn is_tombstoned(&self, document: &str) -> bool {
        self.tombstones.contains(document)
    }

    /// 持久层中该文档的条目是否已被本 delta 取代。
    pub fn shadows(&self, document: &str) -> bool {
        self.documents.contains_key(document) || self.tombstones.contains(document)
    }

    pub fn documents(&self) -> impl Iterator<Item = (&str, &DocumentEntries)> {
        self.documents.iter().map(|(d, t)| (d.as_str(), t))
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &str> {
        self.tombstones.iter().map(String::as_str)
    }

    /// 扫描 delta 中的条目，把命中并入累加器，并从累加器里剔除已删除文档。
    pub fn add_query_results(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        mut results: HashMap<String, EntryResult>,
    ) -> Result<HashMap<String, EntryResult>> {
        let matcher = KeyMatcher::new(key, rule);
        self.fold_query_results(categories, &matcher, &mut results, None)?;
        Ok(results)
    }

    pub(crate) fn fold_query_results(
        &self,
        categories: &[&str],
        matcher: &KeyMatcher,
        results: &mut HashMap<String, EntryResult>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let match_all = matcher.matches_all();
        for category in categories {
            check_cancel(cancel)?;
            for (document, table) in &self.documents {
                let Some(keys) = table.get(*category) else {
                    continue;
                };
                for key in keys {
                    if !match_all && !matcher.matches(key) {
                        continue;
                    }
                    match results.get_mut(key.as_str()) {
                        Some(r) => r.add_document_name(document.as_str()),
                        None => {
                            let mut r = EntryResult::new(key.as_str());
                            r.add_document_name(document.as_str());
                            results.insert(key.clone(), r);
                        }
                    }
                }
            }
        }

        if !self.tombstones.is_empty() {
            for r in results.values_mut() {
                if r.is_lazy() {
                    r.resolve()?;
                }
            }
            results.retain(|_, r| {
                for t in &self.tombstones {
                    r.remove_document_name(t);
                }
                !r.is_empty()
            });
        }
        Ok(())
    }

    /// 本 delta 中仍存活的文档名（包含 `substring`；`None` 表示全部）。
    pub fn add_document_names(
        &self,
        substring: Option<&str>,
        mut names: HashSet<String>,
    ) -> HashSet<String> {
        for document in self.documents.keys() {
            if substring.map_or(true, |s| document.contains(s)) {
                names.insert(document.clone());
            }
        }
        for t in &self.tombstones {
            names.remove(t);
        }
        names
    }

    /// 粗估堆占用（偏保守，只用于统计报告）。
    pub fn estimated_bytes(&self) -> u64 {
        use std::mem::size_of;
        let mut bytes = 0u64;
        for (doc, table) in &self.documents {
            bytes += (doc.capacity() + size_of::<DocumentEntries>()) as u64;
            for (cat, keys) in table {
                bytes += (cat.capacity() + size_of::<HashSet<String>>()) as u64;
                bytes += keys
                    .iter()
                    .map(|k| (k.capacity() + size_of::<String>()) as u64)
                    .sum::<u64>();
            }
        }
        bytes
            + self
                .tombstones
                .iter()
                .map(|t| (t.capacity() + size_of::<String>()) as u64)
                .sum::<u64>()
    }
}
