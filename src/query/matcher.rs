use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use wildmatch::WildMatch;

use crate::core::{IndexError, Result};

// 外部查询 API 使用的位编码。
pub const R_EXACT_MATCH: i32 = 0x0000;
pub const R_PREFIX_MATCH: i32 = 0x0001;
pub const R_PATTERN_MATCH: i32 = 0x0002;
pub const R_REGEXP_MATCH: i32 = 0x0004;
pub const R_CASE_SENSITIVE: i32 = 0x0008;
pub const R_CAMELCASE_MATCH: i32 = 0x0080;
pub const R_CAMELCASE_SAME_PART_COUNT_MATCH: i32 = 0x0100;

const KIND_MASK: i32 = R_PREFIX_MATCH
    | R_PATTERN_MATCH
    | R_REGEXP_MATCH
    | R_CAMELCASE_MATCH
    | R_CAMELCASE_SAME_PART_COUNT_MATCH;

const REGEX_CACHE_LIMIT: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MatchKind {
    Exact,
    Prefix,
    /// glob：`*` 任意长度（含空），`?` 恰好一个字符
    Pattern,
    Regexp,
    CamelCase,
    CamelCaseSamePartCount,
}

/// 匹配规则 = 一种匹配方式 + 是否区分大小写。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub kind: MatchKind,
    pub case_sensitive: bool,
}

impl MatchRule {
    pub const fn new(kind: MatchKind, case_sensitive: bool) -> Self {
        Self {
            kind,
            case_sensitive,
        }
    }

    pub const fn exact() -> Self {
        Self::new(MatchKind::Exact, true)
    }

    pub const fn prefix() -> Self {
        Self::new(MatchKind::Prefix, false)
    }

    pub const fn pattern() -> Self {
        Self::new(MatchKind::Pattern, false)
    }

    pub const fn camel_case() -> Self {
        Self::new(MatchKind::CamelCase, false)
    }

    pub const fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub const fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    /// 解析外部位编码；与索引无关的位（erasure/equivalent/full）被屏蔽。
    pub fn from_bits(bits: i32) -> Result<Self> {
        let kind = match bits & KIND_MASK {
            R_EXACT_MATCH => MatchKind::Exact,
            R_PREFIX_MATCH => MatchKind::Prefix,
            R_PATTERN_MATCH => MatchKind::Pattern,
            R_REGEXP_MATCH => MatchKind::Regexp,
            R_CAMELCASE_MATCH => MatchKind::CamelCase,
            R_CAMELCASE_SAME_PART_COUNT_MATCH => MatchKind::CamelCaseSamePartCount,
            _ => return Err(IndexError::InvalidMatchRule(bits)),
        };
        Ok(Self::new(kind, bits & R_CASE_SENSITIVE != 0))
    }

    pub fn bits(self) -> i32 {
        let kind = match self.kind {
            MatchKind::Exact => R_EXACT_MATCH,
            MatchKind::Prefix => R_PREFIX_MATCH,
            MatchKind::Pattern => R_PATTERN_MATCH,
            MatchKind::Regexp => R_REGEXP_MATCH,
            MatchKind::CamelCase => R_CAMELCASE_MATCH,
            MatchKind::CamelCaseSamePartCount => R_CAMELCASE_SAME_PART_COUNT_MATCH,
        };
        if self.case_sensitive {
            kind | R_CASE_SENSITIVE
        } else {
            kind
        }
    }
}

impl Default for MatchRule {
    fn default() -> Self {
        Self::exact()
    }
}

/// 判断候选键是否满足查询模式。纯函数。
///
/// `pattern == None` 等价于 `*`。空模式除 EXACT 外匹配一切；
/// 空候选键只被 PATTERN 下的 `"*"` 匹配。
pub fn is_match(pattern: Option<&str>, candidate: &str, rule: MatchRule) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    if pattern.is_empty() {
        return rule.kind != MatchKind::Exact;
    }
    if candidate.is_empty() {
        return rule.kind == MatchKind::Pattern && pattern == "*";
    }

    let cs = rule.case_sensitive;
    match rule.kind {
        MatchKind::Exact => exact_match(pattern, candidate, cs),
        MatchKind::Prefix => prefix_match(pattern, candidate, cs),
        MatchKind::Pattern => glob_match(pattern, candidate, cs),
        MatchKind::Regexp => match cached_regex(pattern, cs) {
            Some(re) => re.is_match(candidate),
            None => false,
        },
        MatchKind::CamelCase => camel_case_or_prefix(pattern, candidate, cs, false),
        MatchKind::CamelCaseSamePartCount => camel_case_or_prefix(pattern, candidate, cs, true),
    }
}

fn chars_eq(a: char, b: char, case_sensitive: bool) -> bool {
    a == b || (!case_sensitive && a.to_lowercase().eq(b.to_lowercase()))
}

pub fn exact_match(pattern: &str, candidate: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        return pattern == candidate;
    }
    let mut p = pattern.chars();
    let mut c = candidate.chars();
    loop {
        match (p.next(), c.next()) {
            (None, None) => return true,
            (Some(a), Some(b)) if chars_eq(a, b, false) => {}
            _ => return false,
        }
    }
}

pub fn prefix_match(pattern: &str, candidate: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        return candidate.starts_with(pattern);
    }
    let mut c = candidate.chars();
    for a in pattern.chars() {
        match c.next() {
            Some(b) if chars_eq(a, b, false) => {}
            _ => return false,
        }
    }
    true
}

pub fn glob_match(pattern: &str, candidate: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        WildMatch::new(pattern).matches(candidate)
    } else {
        WildMatch::new(&pattern.to_lowercase()).matches(&candidate.to_lowercase())
    }
}

/// 驼峰匹配失败时退回前缀匹配（沿用规则的大小写设定）：小写前缀也能命中。
fn camel_case_or_prefix(
    pattern: &str,
    candidate: &str,
    case_sensitive: bool,
    same_part_count: bool,
) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = candidate.chars().collect();
    if camel_case_match(&p, &n, same_part_count) {
        return true;
    }
    prefix_match(pattern, candidate, case_sensitive)
}

fn is_segment_filler(c: char) -> bool {
    c.is_lowercase() || c == '_' || c == '$'
}

/// 驼峰匹配：模式中的大写字母（或数字）按顺序对齐候选键中连续的大写段起点，
/// 段内小写串必须是候选段的字面前缀。首字符必须严格相等。
///
/// `same_part_count`：模式耗尽后，候选键不得再有新的大写段。
pub fn camel_case_match(pattern: &[char], name: &[char], same_part_count: bool) -> bool {
    if pattern.is_empty() {
        return true;
    }
    if name.is_empty() || pattern[0] != name[0] {
        return false;
    }

    let mut ip = 0usize;
    let mut iname = 0usize;
    loop {
        ip += 1;
        iname += 1;

        if ip == pattern.len() {
            if !same_part_count || iname == name.len() {
                return true;
            }
            return name[iname..].iter().all(|c| !c.is_uppercase());
        }
        if iname == name.len() {
            return false;
        }

        let pc = pattern[ip];
        if pc == name[iname] {
            continue;
        }
        // 不相等时模式字符必须是新段起点
        if !pc.is_uppercase() && !pc.is_ascii_digit() {
            return false;
        }

        loop {
            if iname == name.len() {
                return false;
            }
            let nc = name[iname];
            if is_segment_filler(nc) {
                iname += 1;
            } else if nc.is_ascii_digit() {
                if pc == nc {
                    break;
                }
                iname += 1;
            } else if pc != nc {
                return false;
            } else {
                break;
            }
        }
    }
}

fn regex_cache() -> &'static DashMap<(String, bool), Option<Arc<Regex>>> {
    static CACHE: OnceLock<DashMap<(String, bool), Option<Arc<Regex>>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

fn compile_regex(pattern: &str, case_sensitive: bool) -> Option<Arc<Regex>> {
    match RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(!case_sensitive)
        .build()
    {
        Ok(re) => Some(Arc::new(re)),
        Err(e) => {
            tracing::debug!("Invalid regexp pattern {:?}: {}", pattern, e);
            None
        }
    }
}

/// 进程级有界缓存：非法表达式也缓存为 None，避免重复编译报错。
fn cached_regex(pattern: &str, case_sensitive: bool) -> Option<Arc<Regex>> {
    let cache = regex_cache();
    let key = (pattern.to_string(), case_sensitive);
    if let Some(hit) = cache.get(&key) {
        return hit.value().clone();
    }
    let compiled = compile_regex(pattern, case_sensitive);
    if cache.len() >= REGEX_CACHE_LIMIT {
        cache.clear();
    }
    cache.insert(key, compiled.clone());
    compiled
}

/// 一次查询内复用的预编译匹配器：glob / regex 只构建一次，
/// 语义与 [`is_match`] 完全一致。
pub struct KeyMatcher {
    pattern: Option<String>,
    rule: MatchRule,
    compiled: Compiled,
}

enum Compiled {
    None,
    Glob(WildMatch),
    Regex(Option<Arc<Regex>>),
}

impl KeyMatcher {
    pub fn new(pattern: Option<&str>, rule: MatchRule) -> Self {
        let compiled = match (pattern, rule.kind) {
            (Some(p), MatchKind::Pattern) if !p.is_empty() => {
                if rule.case_sensitive {
                    Compiled::Glob(WildMatch::new(p))
                } else {
                    Compiled::Glob(WildMatch::new(&p.to_lowercase()))
                }
            }
            (Some(p), MatchKind::Regexp) if !p.is_empty() => {
                Compiled::Regex(cached_regex(p, rule.case_sensitive))
            }
            _ => Compiled::None,
        };
        Self {
            pattern: pattern.map(str::to_string),
            rule,
            compiled,
        }
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    pub fn rule(&self) -> MatchRule {
        self.rule
    }

    /// 是否匹配一切（无需逐键比较）。
    pub fn matches_all(&self) -> bool {
        match self.pattern.as_deref() {
            None => true,
            Some(p) => p.is_empty() && self.rule.kind != MatchKind::Exact,
        }
    }

    /// 区分大小写且候选键必须以此开头时返回该字面前缀；用于有序键表的范围裁剪。
    pub fn literal_prefix(&self) -> Option<&str> {
        let p = self.pattern.as_deref()?;
        if p.is_empty() || !self.rule.case_sensitive {
            return None;
        }
        match self.rule.kind {
            MatchKind::Exact | MatchKind::Prefix => Some(p),
            MatchKind::Pattern => p
                .split(|c| c == '*' || c == '?')
                .next()
                .filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let Some(p) = self.pattern.as_deref() else {
            return true;
        };
        if p.is_empty() || candidate.is_empty() {
            return is_match(Some(p), candidate, self.rule);
        }
        match &self.compiled {
            Compiled::Glob(w) => {
                if self.rule.case_sensitive {
                    w.matches(candidate)
                } else {
                    w.matches(&candidate.to_lowercase())
                }
            }
            Compiled::Regex(re) => re.as_ref().is_some_and(|re| re.is_match(candidate)),
            Compiled::None => is_match(Some(p), candidate, self.rule),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NPE: &str = "NullPointerException";

    #[test]
    fn camel_case_table() {
        assert!(is_match(Some("NPE"), NPE, MatchRule::camel_case()));
        assert!(!is_match(
            Some("npe"),
            NPE,
            MatchRule::camel_case().case_sensitive()
        ));
        assert!(!is_match(Some("npe"), NPE, MatchRule::camel_case()));
        assert!(is_match(Some("NuPoEx"), NPE, MatchRule::camel_case()));
        // 大写段必须连续对齐
        assert!(!is_match(Some("NE"), NPE, MatchRule::camel_case()));
        assert!(!is_match(Some("NxPE"), NPE, MatchRule::camel_case()));
    }

    #[test]
    fn camel_case_falls_back_to_prefix() {
        // 驼峰失败（首字符大小写不同），前缀（不区分大小写）命中
        assert!(is_match(Some("null"), NPE, MatchRule::camel_case()));
        assert!(!is_match(
            Some("null"),
            NPE,
            MatchRule::camel_case().case_sensitive()
        ));
        assert!(is_match(
            Some("nullp"),
            "nullpointer",
            MatchRule::camel_case().case_sensitive()
        ));
    }

    #[test]
    fn camel_case_same_part_count() {
        let rule = MatchRule::new(MatchKind::CamelCaseSamePartCount, false);
        assert!(is_match(Some("NPE"), NPE, rule));
        assert!(!is_match(Some("NPE"), "NullPointerExceptionHandler", rule));
        assert!(is_match(Some("NP"), "NullPointer", rule));
        assert!(!is_match(Some("NP"), NPE, rule));
        // 普通驼峰不限制段数
        assert!(is_match(
            Some("NPE"),
            "NullPointerExceptionHandler",
            MatchRule::camel_case()
        ));
    }

    #[test]
    fn camel_case_digits_start_segments() {
        let p: Vec<char> = "HM2".chars().collect();
        let n: Vec<char> = "HashMap2Entry".chars().collect();
        assert!(camel_case_match(&p, &n, false));
    }

    #[test]
    fn prefix_and_exact() {
        assert!(is_match(Some("Null"), "nullPointerException", MatchRule::prefix()));
        assert!(!is_match(
            Some("Null"),
            "nullPointerException",
            MatchRule::prefix().case_sensitive()
        ));
        assert!(!is_match(Some("NullPointerExceptions"), NPE, MatchRule::prefix()));
        assert!(is_match(Some(NPE), NPE, MatchRule::exact()));
        assert!(!is_match(Some("nullpointerexception"), NPE, MatchRule::exact()));
        assert!(is_match(
            Some("nullpointerexception"),
            NPE,
            MatchRule::exact().case_insensitive()
        ));
        assert!(!is_match(Some("Null"), NPE, MatchRule::exact()));
    }

    #[test]
    fn glob_patterns() {
        assert!(is_match(Some("*Exception"), NPE, MatchRule::pattern()));
        assert!(is_match(Some("*exception"), NPE, MatchRule::pattern()));
        assert!(!is_match(
            Some("*exception"),
            NPE,
            MatchRule::pattern().case_sensitive()
        ));
        assert!(is_match(Some("N?ll*"), NPE, MatchRule::pattern()));
        assert!(!is_match(Some("N?l*Foo"), NPE, MatchRule::pattern()));
    }

    #[test]
    fn regexp_is_anchored() {
        let rule = MatchRule::new(MatchKind::Regexp, true);
        assert!(is_match(Some("Null.*Exception"), NPE, rule));
        assert!(!is_match(Some("Pointer"), NPE, rule));
        assert!(is_match(
            Some("null.*"),
            NPE,
            MatchRule::new(MatchKind::Regexp, false)
        ));
        // 非法表达式不匹配任何键
        assert!(!is_match(Some("(unclosed"), NPE, rule));
    }

    #[test]
    fn empty_pattern_and_candidate_edges() {
        assert!(is_match(None, "", MatchRule::exact()));
        assert!(!is_match(Some(""), NPE, MatchRule::exact()));
        assert!(is_match(Some(""), NPE, MatchRule::prefix()));
        assert!(is_match(Some(""), NPE, MatchRule::camel_case()));

        assert!(is_match(Some("*"), "", MatchRule::pattern()));
        assert!(!is_match(Some("**"), "", MatchRule::pattern()));
        assert!(!is_match(Some("*"), "", MatchRule::prefix()));
        assert!(!is_match(Some("a"), "", MatchRule::exact()));
        assert!(!is_match(
            Some(".*"),
            "",
            MatchRule::new(MatchKind::Regexp, false)
        ));
    }

    #[test]
    fn bits_round_trip_and_conflicts() {
        let r = MatchRule::from_bits(R_CAMELCASE_MATCH | R_CASE_SENSITIVE).unwrap();
        assert_eq!(r, MatchRule::camel_case().case_sensitive());
        assert_eq!(r.bits(), R_CAMELCASE_MATCH | R_CASE_SENSITIVE);
        // erasure 位被屏蔽
        assert_eq!(
            MatchRule::from_bits(R_PREFIX_MATCH | 0x0010).unwrap(),
            MatchRule::prefix()
        );
        assert!(matches!(
            MatchRule::from_bits(R_PREFIX_MATCH | R_PATTERN_MATCH),
            Err(IndexError::InvalidMatchRule(_))
        ));
    }

    #[test]
    fn key_matcher_agrees_with_is_match() {
        let keys = [NPE, "nullPointer", "Foo", "", "FooBar", "foo/2"];
        let cases = [
            (Some("*o*"), MatchRule::pattern()),
            (Some("Foo"), MatchRule::prefix().case_sensitive()),
            (Some("F.*"), MatchRule::new(MatchKind::Regexp, false)),
            (Some("NP"), MatchRule::camel_case()),
            (Some(""), MatchRule::exact()),
            (Some("*"), MatchRule::pattern()),
            (None, MatchRule::exact()),
        ];
        for (p, rule) in cases {
            let m = KeyMatcher::new(p, rule);
            for k in keys {
                assert_eq!(m.matches(k), is_match(p, k, rule), "{:?} {:?} {:?}", p, rule, k);
            }
        }
    }

    #[test]
    fn literal_prefix_only_when_case_sensitive() {
        let m = KeyMatcher::new(Some("Foo*Bar"), MatchRule::pattern().case_sensitive());
        assert_eq!(m.literal_prefix(), Some("Foo"));
        let m = KeyMatcher::new(Some("Foo"), MatchRule::prefix());
        assert_eq!(m.literal_prefix(), None);
        let m = KeyMatcher::new(Some("*Bar"), MatchRule::pattern().case_sensitive());
        assert_eq!(m.literal_prefix(), None);
    }
}
