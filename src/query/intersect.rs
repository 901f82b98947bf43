use std::collections::BTreeSet;

use crate::core::{check_cancel, CancelToken, Result};
use crate::index::{EntryResult, EntrySource};
use crate::query::matcher::{glob_match, is_match, MatchRule};

/// 交集查询中的一轮子模式。
#[derive(Clone, Debug)]
pub enum SubPattern {
    /// 直接按键查询；命中键按同一规则复核。
    Key {
        categories: Vec<String>,
        key: Option<String>,
        rule: MatchRule,
    },
    /// 复合键 `name{separator}qualifier`（如类型名 + 包名）。
    ///
    /// 底层以 glob 查询整个复合键，`*` 可能跨越分隔符，所以命中键要拆开后逐段复核。
    /// `qualifier` 为 `None` 表示任意限定。
    Qualified {
        categories: Vec<String>,
        name: String,
        separator: char,
        qualifier: Option<String>,
        case_sensitive: bool,
    },
}

impl SubPattern {
    pub fn key(categories: &[&str], key: Option<&str>, rule: MatchRule) -> Self {
        SubPattern::Key {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            key: key.map(str::to_string),
            rule,
        }
    }

    pub fn qualified(
        categories: &[&str],
        name: &str,
        separator: char,
        qualifier: Option<&str>,
        case_sensitive: bool,
    ) -> Self {
        SubPattern::Qualified {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            name: name.to_string(),
            separator,
            qualifier: qualifier.map(str::to_string),
            case_sensitive,
        }
    }

    fn categories(&self) -> Vec<&str> {
        let cats = match self {
            SubPattern::Key { categories, .. } | SubPattern::Qualified { categories, .. } => {
                categories
            }
        };
        cats.iter().map(String::as_str).collect()
    }

    /// 本轮发给来源的 (key, rule)。
    fn index_query(&self) -> (Option<String>, MatchRule) {
        match self {
            SubPattern::Key { key, rule, .. } => (key.clone(), *rule),
            SubPattern::Qualified {
                name,
                separator,
                qualifier,
                case_sensitive,
                ..
            } => {
                let q = qualifier.as_deref().unwrap_or("*");
                let rule = if *case_sensitive {
                    MatchRule::pattern().case_sensitive()
                } else {
                    MatchRule::pattern()
                };
                (Some(format!("{}{}{}", name, separator, q)), rule)
            }
        }
    }

    /// 解码命中键并复核。
    fn accepts(&self, word: &str) -> bool {
        match self {
            SubPattern::Key { key, rule, .. } => is_match(key.as_deref(), word, *rule),
            SubPattern::Qualified {
                name,
                separator,
                qualifier,
                case_sensitive,
                ..
            } => {
                let Some((n, q)) = word.split_once(*separator) else {
                    return false;
                };
                glob_match(name, n, *case_sensitive)
                    && qualifier
                        .as_deref()
                        .map_or(true, |want| glob_match(want, q, *case_sensitive))
            }
        }
    }

    fn collect_documents(&self, entries: &[EntryResult]) -> Result<BTreeSet<String>> {
        let mut docs = BTreeSet::new();
        for e in entries {
            if self.accepts(e.word()) {
                docs.extend(e.document_names()?);
            }
        }
        Ok(docs)
    }
}

/// 交集结果：没有代表键，只有文档名。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Intersection {
    pub documents: BTreeSet<String>,
    /// 实际执行的轮数（提前结束时小于子模式数）
    pub rounds: usize,
}

impl Intersection {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// 多个子模式按顺序求 AND：任一轮交集为空即停止，后续子模式不再查询。
#[derive(Clone, Debug)]
pub struct IntersectingQuery {
    patterns: Vec<SubPattern>,
}

impl IntersectingQuery {
    pub fn new(patterns: Vec<SubPattern>) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &[SubPattern] {
        &self.patterns
    }

    pub fn execute(
        &self,
        source: &dyn EntrySource,
        cancel: Option<&CancelToken>,
    ) -> Result<Intersection> {
        let mut running: Option<BTreeSet<String>> = None;
        let mut rounds = 0;

        for pattern in &self.patterns {
            check_cancel(cancel)?;
            rounds += 1;

            let (key, rule) = pattern.index_query();
            let entries =
                source.query_entries(&pattern.categories(), key.as_deref(), rule, cancel)?;
            let docs = pattern.collect_documents(&entries)?;

            let next = match running.take() {
                None => docs,
                Some(prev) => prev.intersection(&docs).cloned().collect(),
            };
            if next.is_empty() {
                tracing::debug!(
                    "Intersection empty after {}/{} rounds in {}",
                    rounds,
                    self.patterns.len(),
                    source.container()
                );
                return Ok(Intersection {
                    documents: BTreeSet::new(),
                    rounds,
                });
            }
            running = Some(next);
        }

        Ok(Intersection {
            documents: running.unwrap_or_default(),
            rounds,
        })
    }

    /// 对每个来源独立求交集（文档名只在容器内可比）。
    pub fn execute_all<'a>(
        &self,
        sources: impl IntoIterator<Item = &'a dyn EntrySource>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<(String, Intersection)>> {
        sources
            .into_iter()
            .map(|s| -> Result<(String, Intersection)> {
                Ok((s.container().to_string(), self.execute(s, cancel)?))
            })
            .collect()
    }
}
