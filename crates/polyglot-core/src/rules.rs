//! 快速匹配规则加载（TOML）
//!
//! 每个命名空间（即格式扩展名）对应一份 TOML 规则源码：
//!
//! ```toml
//! [[rules]]
//! id = "IsPNG"
//! [[rules.conditions]]
//! kind = "bytes"
//! offset = 0
//! hex = "89 50 4E 47 0D 0A 1A 0A"
//! ```
//!
//! 规则内所有条件同时成立才算命中；越过文件末尾的条件视为不成立。
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;

use crate::error::{Result, ScanError};

/// 整数字节序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Endian {
    #[default]
    Le,
    Be,
}

/// 单个条件的 TOML 形式
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum ConditionEntry {
    /// 字节字面量；无 offset 时可出现在任意位置
    Bytes {
        #[serde(default)]
        offset: Option<u64>,
        hex: String,
    },
    /// 定长整数测试（先掩码，再比较）
    Uint {
        offset: u64,
        width: u8,
        #[serde(default)]
        endian: Endian,
        #[serde(default)]
        mask: Option<u64>,
        #[serde(default)]
        eq: Option<u64>,
        #[serde(default)]
        gt: Option<u64>,
        #[serde(default)]
        lt: Option<u64>,
        /// 可接受的值或闭区间，例如 "0x20"、"0x30-0x37"
        #[serde(default)]
        one_of: Vec<String>,
    },
    /// 字节正则；带 offset 时锚定在该偏移
    Regex {
        #[serde(default)]
        offset: Option<u64>,
        pattern: String,
    },
}

/// 单条规则
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RuleEntry {
    pub id: String,
    #[serde(default)]
    pub conditions: Vec<ConditionEntry>,
}

/// 单个命名空间的规则源码结构
#[derive(Debug, Clone, Default, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

/// 覆盖文件：`[namespaces.<ext>]` 下放规则
#[derive(Debug, Clone, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    namespaces: BTreeMap<String, RuleFile>,
}

/// 整数测试（归一化后）
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UintTest {
    pub offset: u64,
    pub width: u8,
    pub endian: Endian,
    pub mask: Option<u64>,
    pub eq: Option<u64>,
    pub gt: Option<u64>,
    pub lt: Option<u64>,
    pub one_of: Vec<RangeInclusive<u64>>,
}

impl UintTest {
    /// 条件读取的最远字节（不含）
    pub(crate) fn extent(&self) -> u64 {
        self.offset + u64::from(self.width)
    }

    /// 在文件头部上求值；越界为 false
    pub(crate) fn eval(&self, head: &[u8]) -> bool {
        let Ok(start) = usize::try_from(self.offset) else { return false };
        let Some(end) = start.checked_add(usize::from(self.width)) else { return false };
        let Some(raw) = head.get(start..end) else { return false };
        let mut v: u64 = 0;
        match self.endian {
            Endian::Be => {
                for &b in raw {
                    v = (v << 8) | u64::from(b);
                }
            }
            Endian::Le => {
                for &b in raw.iter().rev() {
                    v = (v << 8) | u64::from(b);
                }
            }
        }
        if let Some(m) = self.mask {
            v &= m;
        }
        if self.eq.is_some_and(|e| v != e) {
            return false;
        }
        if self.gt.is_some_and(|g| v <= g) {
            return false;
        }
        if self.lt.is_some_and(|l| v >= l) {
            return false;
        }
        self.one_of.is_empty() || self.one_of.iter().any(|r| r.contains(&v))
    }
}

/// 归一化后的条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Condition {
    Literal { offset: Option<u64>, bytes: Vec<u8> },
    Uint(UintTest),
    Regex { offset: Option<u64>, pattern: String },
}

/// 归一化后的规则规格（内部使用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RuleSpec {
    pub namespace: String,
    pub id: String,
    pub conditions: Vec<Condition>,
}

/// 解析单个命名空间的 TOML 规则源码；空源码得到空规则集
pub(crate) fn parse_rule_source(namespace: &str, source: &str) -> Result<Vec<RuleSpec>> {
    if source.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: RuleFile = toml::from_str(source)
        .map_err(|e| ScanError::RuleParse { namespace: namespace.to_string(), source: e })?;
    normalize_rules(namespace, parsed.rules)
}

/// 从覆盖文件加载，返回 命名空间 -> 规则列表
pub(crate) fn load_rule_overrides(path: &Path) -> Result<BTreeMap<String, Vec<RuleSpec>>> {
    let txt = std::fs::read_to_string(path).map_err(|e| ScanError::io(path, e))?;
    let parsed: OverrideFile = toml::from_str(&txt).map_err(|e| ScanError::RuleParse {
        namespace: path.display().to_string(),
        source: e,
    })?;
    let mut out = BTreeMap::new();
    for (ns, file) in parsed.namespaces {
        let specs = normalize_rules(&ns, file.rules)?;
        out.insert(ns, specs);
    }
    Ok(out)
}

fn normalize_rules(namespace: &str, entries: Vec<RuleEntry>) -> Result<Vec<RuleSpec>> {
    let mut out = Vec::with_capacity(entries.len());
    for e in entries {
        let conditions = normalize_conditions(namespace, &e.id, e.conditions)?;
        out.push(RuleSpec { namespace: namespace.to_string(), id: e.id, conditions });
    }
    Ok(out)
}

/// 校验并归一化条件列表（十六进制、宽度、区间）
pub(crate) fn normalize_conditions(
    namespace: &str,
    rule: &str,
    entries: Vec<ConditionEntry>,
) -> Result<Vec<Condition>> {
    if entries.is_empty() {
        return Err(ScanError::compile(namespace, rule, "rule has no conditions"));
    }
    let mut out = Vec::with_capacity(entries.len());
    for c in entries {
        let cond = match c {
            ConditionEntry::Bytes { offset, hex } => {
                let bytes = parse_hex(&hex).map_err(|r| ScanError::compile(namespace, rule, r))?;
                Condition::Literal { offset, bytes }
            }
            ConditionEntry::Uint { offset, width, endian, mask, eq, gt, lt, one_of } => {
                if !matches!(width, 1 | 2 | 4 | 8) {
                    return Err(ScanError::compile(
                        namespace,
                        rule,
                        format!("uint width must be 1, 2, 4 or 8, got {width}"),
                    ));
                }
                if offset.checked_add(u64::from(width)).is_none() {
                    return Err(ScanError::compile(namespace, rule, "uint offset overflows"));
                }
                let mut ranges = Vec::with_capacity(one_of.len());
                for item in &one_of {
                    let r = parse_value_range(item).map_err(|r| ScanError::compile(namespace, rule, r))?;
                    ranges.push(r);
                }
                Condition::Uint(UintTest { offset, width, endian, mask, eq, gt, lt, one_of: ranges })
            }
            ConditionEntry::Regex { offset, pattern } => Condition::Regex { offset, pattern },
        };
        out.push(cond);
    }
    Ok(out)
}

/// 解析十六进制字面量，允许空白分隔
pub(crate) fn parse_hex(s: &str) -> std::result::Result<Vec<u8>, String> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.is_empty() {
        return Err("empty hex literal".to_string());
    }
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in `{s}`"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = hex_val(pair[0]);
            let lo = hex_val(pair[1]);
            match (hi, lo) {
                (Some(h), Some(l)) => Ok((h << 4) | l),
                _ => Err(format!("invalid hex digit in `{s}`")),
            }
        })
        .collect()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// "0x30-0x37" / "48" / "0x20" -> 闭区间
fn parse_value_range(s: &str) -> std::result::Result<RangeInclusive<u64>, String> {
    let s = s.trim();
    let (lo, hi) = match s.split_once('-') {
        Some((a, b)) => (parse_number(a)?, parse_number(b)?),
        None => {
            let v = parse_number(s)?;
            (v, v)
        }
    };
    if lo > hi {
        return Err(format!("empty range `{s}`"));
    }
    Ok(lo..=hi)
}

fn parse_number(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| format!("invalid number `{s}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bytes_and_uint_conditions() {
        let src = r#"
            [[rules]]
            id = "R"
            [[rules.conditions]]
            kind = "bytes"
            offset = 0
            hex = "89 50 4e 47"
            [[rules.conditions]]
            kind = "uint"
            offset = 100
            width = 1
            one_of = ["0x00", "0x20", "0x30-0x37"]
        "#;
        let specs = parse_rule_source("png", src).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].namespace, "png");
        assert_eq!(
            specs[0].conditions[0],
            Condition::Literal { offset: Some(0), bytes: vec![0x89, 0x50, 0x4e, 0x47] }
        );
        match &specs[0].conditions[1] {
            Condition::Uint(t) => assert_eq!(t.one_of, vec![0..=0, 0x20..=0x20, 0x30..=0x37]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_source_is_empty_ruleset() {
        assert!(parse_rule_source("zip", "").unwrap().is_empty());
    }

    #[test]
    fn malformed_sources_fail_to_compile() {
        let bad_hex = "[[rules]]\nid = \"R\"\n[[rules.conditions]]\nkind = \"bytes\"\nhex = \"8\"\n";
        assert!(matches!(parse_rule_source("x", bad_hex), Err(ScanError::RuleCompilation { .. })));

        let bad_width = "[[rules]]\nid = \"R\"\n[[rules.conditions]]\nkind = \"uint\"\noffset = 0\nwidth = 3\n";
        assert!(matches!(parse_rule_source("x", bad_width), Err(ScanError::RuleCompilation { .. })));

        let no_conds = "[[rules]]\nid = \"R\"\n";
        assert!(matches!(parse_rule_source("x", no_conds), Err(ScanError::RuleCompilation { .. })));

        assert!(matches!(parse_rule_source("x", "[[rules]"), Err(ScanError::RuleParse { .. })));
    }

    #[test]
    fn uint_eval_respects_endianness_mask_and_bounds() {
        let head = [0x1f, 0x8b, 0x00, 0x00];
        let be = UintTest {
            offset: 0,
            width: 2,
            endian: Endian::Be,
            mask: None,
            eq: Some(0x1f8b),
            gt: None,
            lt: None,
            one_of: vec![],
        };
        assert!(be.eval(&head));
        let le = UintTest { endian: Endian::Le, eq: Some(0x8b1f), ..be.clone() };
        assert!(le.eval(&head));
        let masked = UintTest { mask: Some(0xff00), eq: Some(0x1f00), ..be.clone() };
        assert!(masked.eval(&head));
        let out_of_range = UintTest { offset: 3, ..be };
        assert!(!out_of_range.eval(&head));
    }
}
