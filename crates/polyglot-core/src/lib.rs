//! 多格式（polyglot）文件检测核心库
//!
//! 设计要点：
//! - 签名引擎对每个文件只遍历一次，按命名空间（即格式扩展名）把命中分给各插件。
//! - 每个格式插件独立打开文件做深度结构校验，用 `ResultLevel` 描述偏离位置。
//! - 结构不匹配不是错误；读取预算与超时是按格式上报的非致命结果。
//! - 多文件时按文件并行，输出顺序与输入一致。

mod detector;
mod error;
mod level;
mod options;
mod plugins;
mod probe;
mod registry;
mod report;
mod rules;
mod scan;
mod signature;
mod sniff;

pub use detector::{Detector, FormatVerdict, ScanResult};
pub use error::{CheckError, LimitKind, Result, ScanError};
pub use level::ResultLevel;
pub use options::{ScanLimits, ScanOptions, ScanStats, SniffOptions, DEFAULT_MAX_READ_BYTES, DEFAULT_TIMEOUT};
pub use plugins::{FormatPlugin, PngPlugin, TarPlugin, ZipPlugin};
pub use probe::{MappedFile, Probe, ProbeReader};
pub use registry::Registry;
pub use report::{write_json, write_text, FileReport, FormatItem, LimitItem};
pub use scan::{build_sniffer, collect_inputs, scan_and_write, scan_file};
pub use signature::{CompiledRuleset, Matches, RuleMatch};
pub use sniff::{MagicDb, MimeSniffer, Sniffed};
