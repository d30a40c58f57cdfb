//! MIME 嗅探（可选的补充手段）
//!
//! 只用来补充结构校验器没有产出的扩展名，从不覆盖结构校验结论。
//! 内置实现 `MagicDb` 复用签名引擎：签名库每个条目编译成一个独立命名空间。
use serde::Deserialize;
use std::path::Path;

use crate::error::{Result, ScanError};
use crate::options::ScanLimits;
use crate::rules::{normalize_conditions, ConditionEntry, RuleSpec};
use crate::signature::CompiledRuleset;

const BUILTIN_DB: &str = include_str!("../data/magic.toml");
const OCTET_STREAM_MIME: &str = "application/octet-stream";

/// 嗅探得到的一个候选类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    pub extension: String,
    /// 具体类型字符串（如 "image/gif"），没有时为 None
    pub mime: Option<String>,
}

/// 嗅探器接口：按可能性排序返回扩展名
pub trait MimeSniffer: Send + Sync {
    fn identify(&self, path: &Path) -> Result<Vec<Sniffed>>;
}

#[derive(Debug, Deserialize)]
struct MagicEntry {
    mime: String,
    extension: String,
    conditions: Vec<ConditionEntry>,
}

#[derive(Debug, Deserialize)]
struct MagicFile {
    #[serde(default)]
    types: Vec<MagicEntry>,
}

/// 基于 TOML 签名库的嗅探器
#[derive(Debug)]
pub struct MagicDb {
    ruleset: CompiledRuleset,
    /// 与命名空间一一对应，按库中顺序
    types: Vec<(String, Sniffed)>,
    keep_going: bool,
    limits: ScanLimits,
}

impl MagicDb {
    pub fn builtin(keep_going: bool, limits: ScanLimits) -> Result<Self> {
        Self::from_source("<builtin>", BUILTIN_DB, keep_going, limits)
    }

    /// 加载替代签名库
    pub fn load(path: &Path, keep_going: bool, limits: ScanLimits) -> Result<Self> {
        let txt = std::fs::read_to_string(path).map_err(|e| ScanError::io(path, e))?;
        Self::from_source(&path.display().to_string(), &txt, keep_going, limits)
    }

    pub fn from_source(origin: &str, source: &str, keep_going: bool, limits: ScanLimits) -> Result<Self> {
        let parsed: MagicFile = toml::from_str(source)
            .map_err(|e| ScanError::RuleParse { namespace: origin.to_string(), source: e })?;
        let mut specs = Vec::with_capacity(parsed.types.len());
        let mut types = Vec::with_capacity(parsed.types.len());
        for (idx, entry) in parsed.types.into_iter().enumerate() {
            let namespace = format!("magic:{idx}");
            let conditions = normalize_conditions(&namespace, &entry.mime, entry.conditions)?;
            specs.push(RuleSpec { namespace: namespace.clone(), id: entry.mime.clone(), conditions });
            let extension = entry.extension.trim_start_matches('.').to_string();
            types.push((namespace, Sniffed { extension, mime: Some(entry.mime) }));
        }
        let ruleset = CompiledRuleset::from_specs(specs)?;
        Ok(Self { ruleset, types, keep_going, limits })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl MimeSniffer for MagicDb {
    fn identify(&self, path: &Path) -> Result<Vec<Sniffed>> {
        let matches = self.ruleset.match_file(path, &self.limits, None)?;
        let mut out = Vec::new();
        for (namespace, sniffed) in &self.types {
            if !matches.namespace_matched(namespace) {
                continue;
            }
            if sniffed.mime.as_deref() == Some(OCTET_STREAM_MIME) {
                continue;
            }
            if out.iter().any(|s: &Sniffed| s.extension == sniffed.extension) {
                continue;
            }
            out.push(sniffed.clone());
            if !self.keep_going {
                break;
            }
        }
        Ok(out)
    }
}
