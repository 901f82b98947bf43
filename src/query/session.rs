use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::{CancelToken, Result};
use crate::index::{EntryResult, EntrySource, Index};
use crate::query::matcher::MatchRule;

/// 决定一个作业会触及哪些 Index（索引管理器一侧实现）。
pub trait IndexProvider: Send + Sync {
    type Job: Eq + Hash + Clone + Send + Sync;

    fn indexes_for(&self, job: &Self::Job) -> Vec<Arc<Index>>;
}

/// 一次多步查询操作持有的查询括号：打开时对每个 Index `start_query`，
/// `finish()` 或 drop 时 `stop_query`，且只释放一次。
pub struct IndexSession {
    indexes: Vec<Arc<Index>>,
    released: bool,
}

impl IndexSession {
    pub fn open(indexes: Vec<Arc<Index>>) -> Self {
        for index in &indexes {
            index.start_query();
        }
        Self {
            indexes,
            released: false,
        }
    }

    pub fn indexes(&self) -> &[Arc<Index>] {
        &self.indexes
    }

    /// 会话内的查询入口：借用会话，保证括号在查询期间一直打开。
    pub fn sources(&self) -> Vec<SessionIndex<'_>> {
        self.indexes
            .iter()
            .map(|index| SessionIndex { index })
            .collect()
    }

    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        for index in &self.indexes {
            index.stop_query();
        }
    }
}

impl Drop for IndexSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// 会话中的一个 Index：查询走括号内路径，不再逐次进入共享访问或检查 compaction。
pub struct SessionIndex<'a> {
    index: &'a Arc<Index>,
}

impl SessionIndex<'_> {
    pub fn index(&self) -> &Arc<Index> {
        self.index
    }
}

impl EntrySource for SessionIndex<'_> {
    fn container(&self) -> &str {
        self.index.container_path()
    }

    fn query_entries(
        &self,
        categories: &[&str],
        key: Option<&str>,
        rule: MatchRule,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<EntryResult>> {
        self.index.query_in_bracket(categories, key, rule, cancel)
    }
}

/// 按作业缓存打开的会话：同一作业的后续子查询复用同一组已打开的 Index。
pub struct IndexSessionCache<P: IndexProvider> {
    provider: P,
    open: DashMap<P::Job, IndexSession>,
}

impl<P: IndexProvider> IndexSessionCache<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            open: DashMap::new(),
        }
    }

    /// 首次调用时打开该作业的全部 Index，之后直接返回缓存。
    pub fn indexes_for(&self, job: &P::Job) -> Vec<Arc<Index>> {
        if let Some(session) = self.open.get(job) {
            return session.indexes().to_vec();
        }

        // start_query 可能等待进行中的 compaction，不能持有分片锁
        let session = IndexSession::open(self.provider.indexes_for(job));
        match self.open.entry(job.clone()) {
            Entry::Occupied(existing) => {
                let indexes = existing.get().indexes().to_vec();
                drop(existing);
                session.finish();
                indexes
            }
            Entry::Vacant(slot) => {
                let indexes = session.indexes().to_vec();
                slot.insert(session);
                indexes
            }
        }
    }

    /// 在该作业的会话内运行 `f`（需要时先打开会话）；`f` 内的查询不再重复获取共享访问。
    ///
    /// `f` 返回前不得对同一作业调用 [`IndexSessionCache::finished`]。
    pub fn with_sources<R>(&self, job: &P::Job, f: impl FnOnce(&[SessionIndex<'_>]) -> R) -> R {
        let indexes = self.indexes_for(job);
        let sources: Vec<SessionIndex<'_>> =
            indexes.iter().map(|index| SessionIndex { index }).collect();
        f(&sources)
    }

    /// 作业结束：释放它打开的全部 Index；未打开或已结束时什么都不做。
    pub fn finished(&self, job: &P::Job) {
        if let Some((_, session)) = self.open.remove(job) {
            session.finish();
        }
    }

    pub fn open_jobs(&self) -> usize {
        self.open.len()
    }
}
