//! 签名引擎（命名空间化的快速匹配规则 + 单次遍历）
//!
//! 设计要点：
//! - 每个格式一个命名空间，多个格式共享一次编译、一次文件遍历，规则名互不干扰。
//! - 定偏移条件（字节字面量、整数测试、锚定正则）只在保留的文件头部上求值，
//!   头部长度取所有规则中最远的定偏移读取位置。
//! - 不定位置的字面量合并进一台 Aho-Corasick 自动机，不定位置的正则合并进一个 `RegexSet`，
//!   按块流式扫描，块之间保留重叠区以覆盖跨块命中。
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::time::Instant;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use regex::bytes::RegexSet;
use regex_automata::{meta, util::syntax, Anchored, Input};
use tracing::{debug, warn};

use crate::error::{LimitKind, Result, ScanError};
use crate::options::ScanLimits;
use crate::rules::{parse_rule_source, Condition, RuleSpec, UintTest};

/// 流式扫描的块大小
pub(crate) const CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4 MiB
/// 正则跨块的重叠字节数
pub(crate) const CHUNK_OVERLAP: usize = 512;
/// 锚定正则在偏移之后可见的字节数
pub(crate) const ANCHORED_REGEX_WINDOW: usize = 4096;

/// 一次命中：(命名空间, 规则名)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleMatch {
    pub namespace: String,
    pub rule: String,
}

/// 命中集合
///
/// 遍历因预算或截止时间提前停止时，`stopped` 记录原因，此时命中集合不完整。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matches {
    hits: BTreeSet<RuleMatch>,
    stopped: Option<LimitKind>,
}

impl Matches {
    /// 只保留指定命名空间的命中
    pub fn in_namespace(&self, namespace: &str) -> Matches {
        Matches {
            hits: self.hits.iter().filter(|m| m.namespace == namespace).cloned().collect(),
            stopped: self.stopped,
        }
    }

    /// 遍历未读完文件就停止的原因
    pub fn stopped(&self) -> Option<LimitKind> {
        self.stopped
    }

    pub fn contains_rule(&self, rule: &str) -> bool {
        self.hits.iter().any(|m| m.rule == rule)
    }

    pub fn namespace_matched(&self, namespace: &str) -> bool {
        self.hits.iter().any(|m| m.namespace == namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleMatch> {
        self.hits.iter()
    }
}

impl FromIterator<RuleMatch> for Matches {
    fn from_iter<I: IntoIterator<Item = RuleMatch>>(iter: I) -> Self {
        Matches { hits: iter.into_iter().collect(), stopped: None }
    }
}

/// 编译后的单个条件
#[derive(Debug)]
enum Check {
    At { offset: usize, bytes: Vec<u8> },
    Uint(UintTest),
    /// 流式条件：查 `seen[slot]`
    Slot(usize),
    RegexAt { offset: usize, regex: usize },
}

#[derive(Debug)]
struct CompiledRule {
    namespace: String,
    id: String,
    checks: Vec<Check>,
}

/// 编译后的规则集（线程安全，可跨线程共享）
#[derive(Debug)]
pub struct CompiledRuleset {
    rules: Vec<CompiledRule>,
    /// 需要保留的文件头部长度
    head_len: usize,
    /// 不定位置字面量自动机（按 literal 去重顺序构建）
    literals: Option<AhoCorasick>,
    /// 字面量索引 -> 流式槽位列表
    literal_slots: Vec<Vec<usize>>,
    max_literal_len: usize,
    regex_set: Option<RegexSet>,
    /// 正则集合下标 -> 流式槽位
    regex_slots: Vec<usize>,
    anchored: Vec<meta::Regex>,
    slot_count: usize,
}

impl CompiledRuleset {
    /// 编译 命名空间 -> 规则源码；语法错误在此处报告（启动期致命）
    pub fn compile<'a, I>(sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut specs = Vec::new();
        for (namespace, source) in sources {
            specs.extend(parse_rule_source(namespace, source)?);
        }
        Self::from_specs(specs)
    }

    /// 从归一化规则构建
    pub(crate) fn from_specs(specs: Vec<RuleSpec>) -> Result<Self> {
        let mut rules = Vec::with_capacity(specs.len());
        let mut head_len = 0usize;
        let mut all_literals: Vec<Vec<u8>> = Vec::new();
        let mut literal_index: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut literal_slots: Vec<Vec<usize>> = Vec::new();
        let mut regex_patterns: Vec<String> = Vec::new();
        let mut regex_slots: Vec<usize> = Vec::new();
        let mut anchored: Vec<meta::Regex> = Vec::new();
        let mut slot_count = 0usize;

        for spec in specs {
            let mut checks = Vec::with_capacity(spec.conditions.len());
            for cond in spec.conditions {
                let check = match cond {
                    Condition::Literal { offset: Some(off), bytes } => {
                        let offset = to_offset(&spec.namespace, &spec.id, off)?;
                        head_len = head_len.max(offset + bytes.len());
                        Check::At { offset, bytes }
                    }
                    Condition::Literal { offset: None, bytes } => {
                        let id = match literal_index.get(&bytes) {
                            Some(id) => *id,
                            None => {
                                let id = all_literals.len();
                                literal_index.insert(bytes.clone(), id);
                                all_literals.push(bytes);
                                literal_slots.push(Vec::new());
                                id
                            }
                        };
                        let slot = slot_count;
                        slot_count += 1;
                        literal_slots[id].push(slot);
                        Check::Slot(slot)
                    }
                    Condition::Uint(test) => {
                        let extent = usize::try_from(test.extent())
                            .map_err(|_| ScanError::compile(&spec.namespace, &spec.id, "uint offset too large"))?;
                        head_len = head_len.max(extent);
                        Check::Uint(test)
                    }
                    Condition::Regex { offset: Some(off), pattern } => {
                        let offset = to_offset(&spec.namespace, &spec.id, off)?;
                        let re = build_anchored(&pattern)
                            .map_err(|e| ScanError::compile(&spec.namespace, &spec.id, e.to_string()))?;
                        head_len = head_len.max(offset + ANCHORED_REGEX_WINDOW);
                        anchored.push(re);
                        Check::RegexAt { offset, regex: anchored.len() - 1 }
                    }
                    Condition::Regex { offset: None, pattern } => {
                        // 单独编译一次，便于把错误归属到具体规则
                        regex::bytes::Regex::new(&pattern)
                            .map_err(|e| ScanError::compile(&spec.namespace, &spec.id, e.to_string()))?;
                        let slot = slot_count;
                        slot_count += 1;
                        regex_patterns.push(pattern);
                        regex_slots.push(slot);
                        Check::Slot(slot)
                    }
                };
                checks.push(check);
            }
            rules.push(CompiledRule { namespace: spec.namespace, id: spec.id, checks });
        }

        let max_literal_len = all_literals.iter().map(Vec::len).max().unwrap_or(0);
        let literals = if all_literals.is_empty() {
            None
        } else {
            let ac = AhoCorasickBuilder::new()
                .match_kind(MatchKind::Standard)
                .build(&all_literals)
                .map_err(|e| ScanError::compile("*", "*", e.to_string()))?;
            Some(ac)
        };
        let regex_set = if regex_patterns.is_empty() {
            None
        } else {
            Some(RegexSet::new(&regex_patterns).map_err(|e| ScanError::compile("*", "*", e.to_string()))?)
        };

        Ok(Self {
            rules,
            head_len,
            literals,
            literal_slots,
            max_literal_len,
            regex_set,
            regex_slots,
            anchored,
            slot_count,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.rules.iter().map(|r| r.namespace.as_str()).collect()
    }

    fn streaming(&self) -> bool {
        self.literals.is_some() || self.regex_set.is_some()
    }

    fn overlap(&self) -> usize {
        let lit = self.max_literal_len.saturating_sub(1);
        if self.regex_set.is_some() {
            lit.max(CHUNK_OVERLAP)
        } else {
            lit
        }
    }

    /// 对文件做一次遍历，返回所有命名空间中命中的规则
    ///
    /// 只有 I/O 错误会失败。读取量受 `max_read_bytes` 约束；还没读完所需数据就超时或超预算时
    /// 提前停止，用已读取的部分求值，并在 `Matches::stopped` 中标明原因。
    pub fn match_file(&self, path: &Path, limits: &ScanLimits, deadline: Option<Instant>) -> Result<Matches> {
        let mut file = File::open(path).map_err(|e| ScanError::io(path, e))?;
        let file_len = file.metadata().map_err(|e| ScanError::io(path, e))?.len();
        let streaming = self.streaming();
        let overlap = self.overlap();

        let mut head: Vec<u8> = Vec::with_capacity(self.head_len.min(CHUNK_SIZE));
        let mut seen = vec![false; self.slot_count];
        let buf_len = if streaming { CHUNK_SIZE } else { self.head_len.clamp(1, CHUNK_SIZE) };
        let mut buf = vec![0u8; buf_len];
        let mut carry: Vec<u8> = Vec::new();
        let mut consumed: u64 = 0;
        let mut stopped = None;

        loop {
            if !streaming && head.len() >= self.head_len {
                break;
            }
            if consumed >= file_len {
                break;
            }
            if consumed >= limits.max_read_bytes {
                warn!(?path, consumed, "signature pass stopped at read budget");
                stopped = Some(LimitKind::ReadBudget);
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(?path, consumed, "signature pass stopped at deadline");
                stopped = Some(LimitKind::Timeout);
                break;
            }
            let n = match file.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ScanError::io(path, e)),
            };
            if n == 0 {
                break;
            }
            consumed = consumed.saturating_add(n as u64);
            let data = &buf[..n];

            if head.len() < self.head_len {
                let take = (self.head_len - head.len()).min(n);
                head.extend_from_slice(&data[..take]);
            }

            if streaming {
                let mut chunk: Vec<u8> = Vec::with_capacity(carry.len() + n);
                chunk.extend_from_slice(&carry);
                chunk.extend_from_slice(data);
                self.mark_slots(&chunk, &mut seen);
                // 保留末尾重叠区
                let keep = overlap.min(chunk.len());
                carry = chunk[chunk.len() - keep..].to_vec();
            }
        }

        let mut matches = self.evaluate(&head, &seen);
        matches.stopped = stopped;
        debug!(?path, consumed, hits = matches.len(), "signature pass finished");
        Ok(matches)
    }

    /// 在内存缓冲区上求值（与 `match_file` 语义一致，不受预算约束）
    pub fn match_bytes(&self, data: &[u8]) -> Matches {
        let mut seen = vec![false; self.slot_count];
        self.mark_slots(data, &mut seen);
        let head = &data[..self.head_len.min(data.len())];
        self.evaluate(head, &seen)
    }

    fn mark_slots(&self, chunk: &[u8], seen: &mut [bool]) {
        if let Some(ac) = &self.literals {
            for m in ac.find_overlapping_iter(chunk) {
                for &slot in &self.literal_slots[m.pattern().as_usize()] {
                    seen[slot] = true;
                }
            }
        }
        if let Some(set) = &self.regex_set {
            for idx in set.matches(chunk).iter() {
                seen[self.regex_slots[idx]] = true;
            }
        }
    }

    fn evaluate(&self, head: &[u8], seen: &[bool]) -> Matches {
        self.rules
            .iter()
            .filter(|rule| rule.checks.iter().all(|c| self.check(c, head, seen)))
            .map(|rule| RuleMatch { namespace: rule.namespace.clone(), rule: rule.id.clone() })
            .collect()
    }

    fn check(&self, check: &Check, head: &[u8], seen: &[bool]) -> bool {
        match check {
            Check::At { offset, bytes } => head.get(*offset..offset + bytes.len()) == Some(bytes.as_slice()),
            Check::Uint(test) => test.eval(head),
            Check::Slot(slot) => seen[*slot],
            Check::RegexAt { offset, regex } => {
                if *offset > head.len() {
                    return false;
                }
                let input = Input::new(head).span(*offset..head.len()).anchored(Anchored::Yes);
                self.anchored[*regex].is_match(input)
            }
        }
    }
}

/// 与 `regex::bytes` 语义一致：允许匹配非 UTF-8 字节
fn build_anchored(pattern: &str) -> std::result::Result<meta::Regex, meta::BuildError> {
    meta::Regex::builder()
        .syntax(syntax::Config::new().utf8(false))
        .configure(meta::Regex::config().utf8_empty(false))
        .build(pattern)
}

fn to_offset(namespace: &str, rule: &str, off: u64) -> Result<usize> {
    usize::try_from(off)
        .ok()
        .filter(|o| o.checked_add(ANCHORED_REGEX_WINDOW).is_some())
        .ok_or_else(|| ScanError::compile(namespace, rule, format!("offset {off} too large")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PNG_RULE: &str = r#"
        [[rules]]
        id = "IsPNG"
        [[rules.conditions]]
        kind = "bytes"
        offset = 0
        hex = "89504E470D0A1A0A"
    "#;

    const ANYWHERE_RULE: &str = r#"
        [[rules]]
        id = "HasPK"
        [[rules.conditions]]
        kind = "bytes"
        hex = "504B0506"

        [[rules]]
        id = "HasManifest"
        [[rules.conditions]]
        kind = "regex"
        pattern = "META-INF/[A-Z]+\\.MF"
    "#;

    const ANCHORED_REGEX_RULE: &str = r#"
        [[rules]]
        id = "PdfHeader"
        [[rules.conditions]]
        kind = "regex"
        offset = 0
        pattern = "%PDF-1\\.[0-7]"
    "#;

    fn ruleset() -> CompiledRuleset {
        CompiledRuleset::compile([("png", PNG_RULE), ("misc", ANYWHERE_RULE), ("pdf", ANCHORED_REGEX_RULE)])
            .unwrap()
    }

    #[test]
    fn namespaces_do_not_cross_contaminate() {
        let rs = ruleset();
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(b"....PK\x05\x06....");
        let m = rs.match_bytes(&data);
        assert!(m.in_namespace("png").contains_rule("IsPNG"));
        assert!(m.in_namespace("misc").contains_rule("HasPK"));
        assert!(!m.in_namespace("png").contains_rule("HasPK"));
        assert!(!m.namespace_matched("pdf"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn anchored_regex_only_matches_at_offset() {
        let rs = ruleset();
        assert!(rs.match_bytes(b"%PDF-1.4\n").contains_rule("PdfHeader"));
        assert!(!rs.match_bytes(b" %PDF-1.4\n").contains_rule("PdfHeader"));
    }

    #[test]
    fn bad_regex_is_compile_error() {
        let src = "[[rules]]\nid = \"R\"\n[[rules.conditions]]\nkind = \"regex\"\npattern = \"(\"\n";
        let err = CompiledRuleset::compile([("x", src)]).unwrap_err();
        assert!(matches!(err, ScanError::RuleCompilation { ref rule, .. } if rule == "R"));
    }

    #[test]
    fn match_file_streams_across_chunks() {
        let rs = ruleset();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        // 让字面量跨越第一个块的边界
        let mut data = vec![0u8; CHUNK_SIZE - 2];
        data.extend_from_slice(b"PK\x05\x06");
        data.extend_from_slice(b"META-INF/MANIFEST.MF");
        f.write_all(&data).unwrap();
        let m = rs.match_file(f.path(), &ScanLimits::default(), None).unwrap();
        assert!(m.contains_rule("HasPK"));
        assert!(m.contains_rule("HasManifest"));
        assert!(!m.contains_rule("IsPNG"));
    }

    #[test]
    fn limits_mark_the_pass_as_stopped() {
        let rs = ruleset();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"\x89PNG\r\n\x1a\n....PK\x05\x06").unwrap();

        let m = rs.match_file(f.path(), &ScanLimits::default(), Some(Instant::now())).unwrap();
        assert_eq!(m.stopped(), Some(LimitKind::Timeout));
        assert!(m.is_empty());
        assert_eq!(m.in_namespace("png").stopped(), Some(LimitKind::Timeout));

        let tight = ScanLimits { max_read_bytes: 0, timeout: None };
        let m = rs.match_file(f.path(), &tight, None).unwrap();
        assert_eq!(m.stopped(), Some(LimitKind::ReadBudget));

        let m = rs.match_file(f.path(), &ScanLimits::default(), None).unwrap();
        assert_eq!(m.stopped(), None);
        assert!(m.contains_rule("IsPNG"));
    }

    #[test]
    fn fully_read_file_is_not_stopped() {
        let rs = ruleset();
        let f = tempfile::NamedTempFile::new().unwrap();
        let m = rs.match_file(f.path(), &ScanLimits::default(), Some(Instant::now())).unwrap();
        assert_eq!(m.stopped(), None);
    }

    #[test]
    fn missing_file_is_io_error() {
        let rs = ruleset();
        let err = rs.match_file(Path::new("/nonexistent/polyglot/input"), &ScanLimits::default(), None);
        assert!(matches!(err, Err(ScanError::Io { .. })));
    }
}
