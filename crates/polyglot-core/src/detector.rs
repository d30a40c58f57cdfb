//! 扫描编排：一次签名遍历，再按注册表顺序把命中分发给各校验器
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{CheckError, LimitKind, Result, ScanError};
use crate::level::ResultLevel;
use crate::options::{ScanLimits, ScanOptions};
use crate::probe::Probe;
use crate::registry::Registry;
use crate::rules::{load_rule_overrides, parse_rule_source};
use crate::signature::CompiledRuleset;
use crate::sniff::Sniffed;

/// 单个格式的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatVerdict {
    pub extension: String,
    pub level: ResultLevel,
    /// 附加说明（例如嗅探器给出的 MIME 类型）
    pub detail: Option<String>,
}

/// 单个文件的扫描结果
///
/// 只包含给出结论的格式，顺序与注册表一致；缺少某个扩展名表示“不像该格式”。
/// 超出资源限制的格式单独记录在 `limits` 中。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    verdicts: Vec<FormatVerdict>,
    limits: Vec<(String, LimitKind)>,
}

impl ScanResult {
    pub fn get(&self, extension: &str) -> Option<&ResultLevel> {
        self.verdicts.iter().find(|v| v.extension == extension).map(|v| &v.level)
    }

    pub fn verdicts(&self) -> &[FormatVerdict] {
        &self.verdicts
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.verdicts.iter().map(|v| v.extension.as_str())
    }

    pub fn limits(&self) -> &[(String, LimitKind)] {
        &self.limits
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty() && self.limits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub(crate) fn push(&mut self, extension: &str, level: ResultLevel) {
        self.verdicts.push(FormatVerdict { extension: extension.to_string(), level, detail: None });
    }

    /// 用嗅探结果补充结构校验器未产出的扩展名（隐含 VALID），从不覆盖已有结论
    pub fn backfill(&mut self, sniffed: &[Sniffed]) {
        for s in sniffed {
            if self.get(&s.extension).is_some() || self.limits.iter().any(|(e, _)| *e == s.extension) {
                continue;
            }
            self.verdicts.push(FormatVerdict {
                extension: s.extension.clone(),
                level: ResultLevel::VALID,
                detail: s.mime.clone(),
            });
        }
    }
}

/// 编排器；规则集与注册表在构造时注入，可按不同配置多次实例化
pub struct Detector {
    registry: Arc<Registry>,
    ruleset: Arc<CompiledRuleset>,
    limits: ScanLimits,
}

impl Detector {
    pub fn new(registry: Arc<Registry>, ruleset: Arc<CompiledRuleset>, limits: ScanLimits) -> Self {
        Self { registry, ruleset, limits }
    }

    /// 内置格式 + 内置规则
    pub fn builtin(limits: ScanLimits) -> Result<Self> {
        let registry = Registry::builtin();
        let ruleset = CompiledRuleset::compile(registry.rule_sources())?;
        Ok(Self::new(Arc::new(registry), Arc::new(ruleset), limits))
    }

    /// 内置格式 + 可选规则覆盖文件（覆盖文件中的命名空间整体替换内置规则）
    pub fn from_options(opts: &ScanOptions) -> Result<Self> {
        let registry = Registry::builtin();
        let mut overrides = match &opts.rules_path {
            Some(p) => load_rule_overrides(p)?,
            None => Default::default(),
        };
        let mut specs = Vec::new();
        for (ns, src) in registry.rule_sources() {
            match overrides.remove(ns) {
                Some(replaced) => {
                    debug!(namespace = ns, rules = replaced.len(), "using override rules");
                    specs.extend(replaced);
                }
                None => specs.extend(parse_rule_source(ns, src)?),
            }
        }
        // 没有内置规则的格式（如 zip）直接检查文件、不看命中，未知格式同理，覆盖规则一律忽略
        for (ns, _) in overrides {
            warn!(namespace = %ns, "override rules ignored: unknown format or format without quick-match rule");
        }
        let ruleset = CompiledRuleset::from_specs(specs)?;
        Ok(Self::new(Arc::new(registry), Arc::new(ruleset), opts.limits))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn limits(&self) -> &ScanLimits {
        &self.limits
    }

    /// 扫描单个文件
    ///
    /// 只有 I/O 错误会失败；结构不匹配与资源超限都体现在结果中。
    pub fn scan(&self, path: &Path) -> Result<ScanResult> {
        let deadline = self.limits.timeout.map(|t| Instant::now() + t);
        let matches = self.ruleset.match_file(path, &self.limits, deadline)?;

        let mut result = ScanResult::default();
        for plugin in self.registry.iter() {
            let ext = plugin.extension();
            if let Some(kind) = matches.stopped().filter(|_| !plugin.quick_rule().trim().is_empty()) {
                // 签名遍历没读完，依赖快速匹配的格式无法下结论
                warn!(?path, format = ext, %kind, "resource limit exceeded during signature pass");
                result.limits.push((ext.to_string(), kind));
                continue;
            }
            let subset = matches.in_namespace(ext);
            let mut probe = Probe::new(path, &subset, &self.limits, deadline);
            match plugin.validate(&mut probe) {
                Ok(Some(level)) => {
                    debug!(?path, format = ext, %level, spent = probe.spent(), "format recognised");
                    result.push(ext, level);
                }
                Ok(None) => {
                    debug!(?path, format = ext, hits = subset.len(), "no opinion");
                }
                Err(CheckError::Limit(kind)) => {
                    warn!(?path, format = ext, %kind, spent = probe.spent(), "resource limit exceeded");
                    result.limits.push((ext.to_string(), kind));
                }
                Err(CheckError::Io(e)) => return Err(ScanError::io(path, e)),
            }
        }
        Ok(result)
    }
}
