use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::core::{IndexError, Result};
use crate::index::persisted::StoreData;

/// 尚未解码的持久层 posting：持有快照引用，保证旧快照在结果被消费前不被回收。
#[derive(Clone)]
pub(crate) struct PostingRef {
    pub(crate) data: Arc<StoreData>,
    pub(crate) off: u64,
    pub(crate) len: u32,
}

impl PostingRef {
    pub(crate) fn decode(&self) -> Result<RoaringBitmap> {
        let bytes = self.data.posting_bytes(self.off, self.len).ok_or_else(|| {
            IndexError::Corrupt(format!("posting {}+{} out of bounds", self.off, self.len))
        })?;
        RoaringBitmap::deserialize_from(bytes)
            .map_err(|e| IndexError::Corrupt(format!("posting decode failed: {}", e)))
    }

    fn resolve_into(&self, out: &mut BTreeSet<String>) -> Result<()> {
        for docid in self.decode()?.iter() {
            let name = self.data.document_name(docid).ok_or_else(|| {
                IndexError::Corrupt(format!("document number {} out of range", docid))
            })?;
            out.insert(name.to_string());
        }
        Ok(())
    }
}

impl fmt::Debug for PostingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostingRef")
            .field("off", &self.off)
            .field("len", &self.len)
            .finish()
    }
}

/// 一个命中键的查询结果：键本身 + 惰性解析的文档名集合。
///
/// 内存层与带 overlay 的持久层查询直接给出文档名；无 overlay 的持久层查询只记下
/// posting 位置，到 [`EntryResult::document_names`] 时才解码。
#[derive(Clone, Debug)]
pub struct EntryResult {
    word: String,
    names: BTreeSet<String>,
    postings: Vec<PostingRef>,
}

impl EntryResult {
    pub fn new(word: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            names: BTreeSet::new(),
            postings: Vec::new(),
        }
    }

    pub fn word(&self) -> &str {
        &self.word
    }

    pub fn add_document_name(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    /// 只作用于已解析的文档名；带惰性 posting 的结果先 [`EntryResult::resolve`]。
    pub fn remove_document_name(&mut self, name: &str) {
        self.names.remove(name);
    }

    /// 立即解码全部 posting 并并入文档名，之后结果不再引用快照。
    pub fn resolve(&mut self) -> Result<()> {
        for p in std::mem::take(&mut self.postings) {
            p.resolve_into(&mut self.names)?;
        }
        Ok(())
    }

    pub(crate) fn add_posting(&mut self, posting: PostingRef) {
        self.postings.push(posting);
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.postings.is_empty()
    }

    /// 是否还有未解码的持久层 posting
    pub fn is_lazy(&self) -> bool {
        !self.postings.is_empty()
    }

    /// 解析全部文档名（升序、去重）。解码失败说明文件在加载后损坏，只影响本次查询。
    pub fn document_names(&self) -> Result<Vec<String>> {
        if self.postings.is_empty() {
            return Ok(self.names.iter().cloned().collect());
        }
        let mut out = self.names.clone();
        for p in &self.postings {
            p.resolve_into(&mut out)?;
        }
        Ok(out.into_iter().collect())
    }
}
