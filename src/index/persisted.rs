use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use rayon::prelude::*;
use roaring::RoaringBitmap;

use crate::core::{check_cancel, CancelToken, IndexError, Result};
use crate::index::memory::MemoryDelta;
use crate::index::result::{EntryResult, PostingRef};
use crate::query::matcher::{KeyMatcher, MatchRule};
use crate::stats::StoreStats;
use crate::storage::snapshot::{CategoryTable, WordEntry};
use crate::storage::{load_if_valid, write_atomic, LoadedSnapshot, StoreDirectory};

enum Blob {
    Empty,
    Mapped { mmap: Mmap, start: usize, len: usize },
}

/// 一个已加载快照的只读视图（目录常驻，posting 在 mmap 里）。
pub(crate) struct StoreData {
    separator: char,
    documents: Vec<String>,
    categories: HashMap<String, Vec<WordEntry>>,
    blob: Blob,
    file_len: u64,
}

impl StoreData {
    fn empty(separator: char, file_len: u64) -> Self {
        Self {
            separator,
            documents: Vec::new(),
            categories: HashMap::new(),
            blob: Blob::Empty,
            file_len,
        }
    }

    fn from_snapshot(snap: LoadedSnapshot) -> Self {
        let LoadedSnapshot {
            directory,
            mmap,
            blob_start,
            blob_len,
            file_len,
        } = snap;
        Self {
            separator: directory.separator,
            documents: directory.documents,
            categories: directory
                .categories
                .into_iter()
                .map(|t| (t.name, t.words))
                .collect(),
            blob: Blob::Mapped {
                mmap,
                start: blob_start,
                len: blob_len,
            },
            file_len,
        }
    }

    pub(crate) fn posting_bytes(&self, off: u64, len: u32) -> Option<&[u8]> {
        let Blob::Mapped { mmap, start, len: blob_len } = &self.blob else {
            return None;
        };
        let off = usize::try_from(off).ok()?;
        let end = off.checked_add(len as usize)?;
        if end > *blob_len {
            return None;
        }
        mmap.get(start + off..start + end)
    }

    pub(crate) fn document_name(&self, docid: u32) -> Option<&str> {
        self.documents.get(docid as usize).map(String::as_str)
    }

    fn decode(&self, w: &WordEntry) -> Result<RoaringBitmap> {
        let bytes = self.posting_bytes(w.off, w.len).ok_or_else(|| {
            IndexError::Corrupt(format!("posting for {:?} out of bounds", w.word))
        })?;
        RoaringBitmap::deserialize_from(bytes)
            .map_err(|e| IndexError::Corrupt(format!("posting for {:?}: {}", w.word, e)))
    }
}

/// 持久层：磁盘上的不可变快照。
///
/// 每次 merge 都写出一个全新的文件并返回新的 `PersistedStore`；旧实例（以及仍持有它的
/// 惰性查询结果）继续读旧映射，直到最后一个引用释放。
#[derive(Clone)]
pub struct PersistedStore {
    location: PathBuf,
    data: Arc<StoreData>,
}

impl PersistedStore {
    /// 打开或新建后备文件。
    ///
    /// `reuse_existing` 且文件有效、分隔符一致时直接复用；否则写一个空库覆盖它。
    pub fn initialize(location: &Path, separator: char, reuse_existing: bool) -> Result<Self> {
        if reuse_existing {
            match load_if_valid(location)? {
                Some(snap) if snap.directory.separator == separator => {
                    let data = StoreData::from_snapshot(snap);
                    tracing::info!(
                        "Loaded index {:?}: {} docs, {} categories",
                        location,
                        data.documents.len(),
                        data.categories.len()
                    );
                    return Ok(Self {
                        location: location.to_path_buf(),
                        data: Arc::new(data),
                    });
                }
                Some(snap) => {
                    tracing::warn!(
                        "Index {:?} uses separator {:?}, expected {:?}; reinitializing",
                        location,
                        snap.directory.separator,
                        separator
                    );
                }
                None if location.exists() => {
                    tracing::warn!("Index {:?} unusable, reinitializing", location);
                }
                None => {}
            }
        }

        let file_len = write_atomic(location, &StoreDirectory::empty(separator), &[])?;
        tracing::debug!("Initialized empty index {:?}", location);
        Ok(Self {
            location: location.to_path_buf(),
            data: Arc::new(StoreData::empty(separator, file_len)),
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn separator(&self) -> char {
        self.data.separator
    }

    pub fn document_count(&self) -> usize {
        self.data.documents.len()
    }

    /// 查询持久层，结果并入累加器（同键合并）。
    ///
    /// `overlay` 存在时，被它屏蔽的文档不会出现在结果里（此时 posting 会立即解码）；
    /// 否则只记录 posting 位置，惰性解码。
    pub fn add_query_results(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        overlay: Option<&MemoryDelta>,
    ) -> Result<HashMap<String, EntryResult>> {
        let matcher = KeyMatcher::new(key, rule);
        let mut results = HashMap::new();
        self.fold_query_results(categories, &matcher, &mut results, overlay, None)?;
        Ok(results)
    }

    pub(crate) fn fold_query_results(
        &self,
        categories: &[&str],
        matcher: &KeyMatcher,
        results: &mut HashMap<String, EntryResult>,
        overlay: Option<&MemoryDelta>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let match_all = matcher.matches_all();
        for category in categories {
            check_cancel(cancel)?;
            let Some(words) = self.data.categories.get(*category) else {
                continue;
            };

            // 有序键表：字面前缀可直接二分定位起点
            let (candidates, prefix) = match matcher.literal_prefix() {
                Some(p) => {
                    let start = words.partition_point(|w| w.word.as_str() < p);
                    (&words[start..], Some(p))
                }
                None => (&words[..], None),
            };

            for w in candidates {
                if let Some(p) = prefix {
                    if !w.word.starts_with(p) {
                        break;
                    }
                }
                if !match_all && !matcher.matches(&w.word) {
                    continue;
                }
                match overlay {
                    None => {
                        results
                            .entry(w.word.clone())
                            .or_insert_with(|| EntryResult::new(w.word.as_str()))
                            .add_posting(PostingRef {
                                data: Arc::clone(&self.data),
                                off: w.off,
                                len: w.len,
                            });
                    }
                    Some(delta) => {
                        let mut live = Vec::new();
                        for docid in self.data.decode(w)?.iter() {
                            let name = self.data.document_name(docid).ok_or_else(|| {
                                IndexError::Corrupt(format!(
                                    "document number {} out of range",
                                    docid
                                ))
                            })?;
                            if !delta.shadows(name) {
                                live.push(name);
                            }
                        }
                        if live.is_empty() {
                            continue;
                        }
                        let r = results
                            .entry(w.word.clone())
                            .or_insert_with(|| EntryResult::new(w.word.as_str()));
                        for name in live {
                            r.add_document_name(name);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// 持久层中未被 overlay 屏蔽、且包含 `substring` 的文档名。
    pub fn add_document_names(
        &self,
        substring: Option<&str>,
        overlay: Option<&MemoryDelta>,
    ) -> HashSet<String> {
        self.data
            .documents
            .iter()
            .filter(|d| substring.map_or(true, |s| d.contains(s)))
            .filter(|d| overlay.map_or(true, |o| !o.shadows(d)))
            .cloned()
            .collect()
    }

    /// 把 delta 合并进来，写出新文件并返回对应的新持久层。
    ///
    /// 被 delta 认识的文档整体以 delta 为准；其余文档原样保留。
    /// delta 不触及任何已存文档时（只有未知文档的 tombstone）直接复用当前实例。
    /// 写入失败时磁盘上的旧文件不受影响，`self` 仍然可用。
    pub fn merge_with(&self, delta: &MemoryDelta) -> Result<PersistedStore> {
        let data = &self.data;
        let touches_store = delta.document_count() > 0
            || delta
                .tombstones()
                .any(|t| data.documents.binary_search_by(|d| d.as_str().cmp(t)).is_ok());
        if !touches_store {
            return Ok(self.clone());
        }

        let mut documents: BTreeSet<&str> = data
            .documents
            .iter()
            .map(String::as_str)
            .filter(|d| !delta.shadows(d))
            .collect();
        for (doc, _) in delta.documents() {
            documents.insert(doc);
        }
        let documents: Vec<String> = documents.into_iter().map(str::to_string).collect();
        let new_id: HashMap<&str, u32> = documents
            .iter()
            .enumerate()
            .map(|(i, d)| (d.as_str(), i as u32))
            .collect();

        // 旧文档号 -> 新文档号（被屏蔽的为 None）
        let remap: Vec<Option<u32>> = data
            .documents
            .iter()
            .map(|d| new_id.get(d.as_str()).copied())
            .collect();

        let carried: Vec<(String, BTreeMap<String, RoaringBitmap>)> = data
            .categories
            .par_iter()
            .map(|(name, words)| -> Result<(String, BTreeMap<String, RoaringBitmap>)> {
                let mut out = BTreeMap::new();
                for w in words {
                    let mut bm = RoaringBitmap::new();
                    for old in data.decode(w)?.iter() {
                        if let Some(Some(id)) = remap.get(old as usize) {
                            bm.insert(*id);
                        }
                    }
                    if !bm.is_empty() {
                        out.insert(w.word.clone(), bm);
                    }
                }
                Ok((name.clone(), out))
            })
            .collect::<Result<_>>()?;

        let mut tables: BTreeMap<String, BTreeMap<String, RoaringBitmap>> =
            carried.into_iter().filter(|(_, w)| !w.is_empty()).collect();
        for (doc, entries) in delta.documents() {
            let Some(&id) = new_id.get(doc) else {
                continue;
            };
            for (category, keys) in entries {
                let table = tables.entry(category.clone()).or_default();
                for key in keys {
                    table.entry(key.clone()).or_default().insert(id);
                }
            }
        }

        let encoded: Vec<(CategoryTable, Vec<u8>)> = tables
            .into_par_iter()
            .map(|(name, words)| encode_category(name, words))
            .collect::<Result<_>>()?;

        let mut blob = Vec::with_capacity(encoded.iter().map(|(_, b)| b.len()).sum());
        let mut categories = Vec::with_capacity(encoded.len());
        for (mut table, bytes) in encoded {
            let base = blob.len() as u64;
            for w in &mut table.words {
                w.off += base;
            }
            blob.extend_from_slice(&bytes);
            categories.push(table);
        }

        let directory = StoreDirectory {
            separator: data.separator,
            documents,
            categories,
        };
        write_atomic(&self.location, &directory, &blob)?;

        let snap = load_if_valid(&self.location)?.ok_or_else(|| {
            IndexError::Corrupt(format!(
                "freshly written index {:?} failed validation",
                self.location
            ))
        })?;
        Ok(Self {
            location: self.location.clone(),
            data: Arc::new(StoreData::from_snapshot(snap)),
        })
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            documents: self.data.documents.len(),
            categories: self.data.categories.len(),
            keys: self.data.categories.values().map(Vec::len).sum(),
            file_bytes: self.data.file_len,
        }
    }
}

/// 单个 category 的 posting 编码；offset 相对本 category 的字节段。
fn encode_category(
    name: String,
    words: BTreeMap<String, RoaringBitmap>,
) -> Result<(CategoryTable, Vec<u8>)> {
    let mut bytes = Vec::new();
    let mut entries = Vec::with_capacity(words.len());
    for (word, bm) in words {
        let off = bytes.len() as u64;
        bm.serialize_into(&mut bytes)?;
        let len = u32::try_from(bytes.len() as u64 - off).map_err(|_| {
            IndexError::Corrupt(format!("posting for {:?} exceeds u32 length", word))
        })?;
        entries.push(WordEntry { word, off, len });
    }
    Ok((
        CategoryTable {
            name,
            words: entries,
        },
        bytes,
    ))
}
