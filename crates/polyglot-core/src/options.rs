//! 扫描选项与统计信息（模块）
use std::path::PathBuf;
use std::time::Duration;

/// 默认单个校验器读取/跳过的字节上限：1 GiB
pub const DEFAULT_MAX_READ_BYTES: u64 = 1 << 30;
/// 默认单文件扫描超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// 资源限制（输入是对抗性的，必须有上限）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    /// 每个校验器可读取或跳过的最大字节数；签名引擎的单次扫描同样受此约束
    pub max_read_bytes: u64,
    /// 单文件墙钟超时；None 表示不限制
    pub timeout: Option<Duration>,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self { max_read_bytes: DEFAULT_MAX_READ_BYTES, timeout: Some(DEFAULT_TIMEOUT) }
    }
}

/// MIME 嗅探选项（仅用于补充结构校验器未识别的扩展名）
#[derive(Debug, Clone, Default)]
pub struct SniffOptions {
    /// 不在首个命中处停止，报告所有可能类型
    pub keep_going: bool,
    /// 替代签名库路径（TOML）；为空则使用内置库
    pub database: Option<PathBuf>,
}

/// 扫描选项
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 线程数：None 表示自动（等于 CPU 核数）；Some(1) 走串行
    pub threads: Option<usize>,
    pub limits: ScanLimits,
    /// 快速匹配规则覆盖文件（TOML）；为空则只用内置规则
    pub rules_path: Option<PathBuf>,
    /// 为 Some 时启用 MIME 嗅探补充
    pub sniff: Option<SniffOptions>,
    /// 以 JSON 行输出（每个文件一行）
    pub json: bool,
}

/// 扫描统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub files_failed: usize,
    pub formats_reported: usize,
    pub limits_hit: usize,
}
