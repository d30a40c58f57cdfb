//! 错误类型
//!
//! 结构不匹配不是错误：校验器以 `Ok(None)` 表示“不像该格式”。
//! 这里只描述真正需要上报的情况。
use std::path::PathBuf;
use thiserror::Error;

/// 对外暴露的扫描错误
#[derive(Debug, Error)]
pub enum ScanError {
    /// 目标文件无法打开或读取（单文件致命，不影响其他文件）
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 规则源码无法解析为 TOML
    #[error("rule source for namespace `{namespace}` is not valid TOML: {source}")]
    RuleParse {
        namespace: String,
        #[source]
        source: toml::de::Error,
    },

    /// 规则语义错误（十六进制、宽度、范围、正则等），仅在启动期出现
    #[error("rule `{namespace}:{rule}` failed to compile: {reason}")]
    RuleCompilation { namespace: String, rule: String, reason: String },

    /// 注册表中扩展名重复
    #[error("duplicate format extension `{0}` in registry")]
    DuplicateExtension(String),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),
}

impl ScanError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScanError::Io { path: path.into(), source }
    }

    pub(crate) fn compile(namespace: &str, rule: &str, reason: impl Into<String>) -> Self {
        ScanError::RuleCompilation {
            namespace: namespace.to_string(),
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// 资源限制种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// 读取/跳过字节数超出预算
    ReadBudget,
    /// 单文件扫描超时
    Timeout,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::ReadBudget => f.write_str("read budget"),
            LimitKind::Timeout => f.write_str("timeout"),
        }
    }
}

/// 校验器错误：只有 I/O 故障与资源超限两种，结构不匹配走 `Ok(None)`
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("resource limit exceeded: {0}")]
    Limit(LimitKind),
}

pub type Result<T> = std::result::Result<T, ScanError>;
