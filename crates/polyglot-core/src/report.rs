//! 结果输出（文本 / JSON 行）
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;

use crate::detector::ScanResult;
use crate::error::{LimitKind, ScanError};
use crate::level::ResultLevel;

/// 单个文件的 JSON 输出项
#[derive(Debug, Serialize)]
pub struct FileReport<'a> {
    pub path: String,
    /// 与注册表顺序一致
    pub formats: Vec<FormatItem<'a>>,
    pub limits: Vec<LimitItem<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FormatItem<'a> {
    pub extension: &'a str,
    #[serde(flatten)]
    pub level: &'a ResultLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct LimitItem<'a> {
    pub extension: &'a str,
    pub limit: LimitKind,
}

impl<'a> FileReport<'a> {
    pub fn new(path: &Path, outcome: &'a Result<ScanResult, ScanError>) -> Self {
        let mut formats = Vec::new();
        let mut limits = Vec::new();
        let mut error = None;
        match outcome {
            Ok(result) => {
                for v in result.verdicts() {
                    formats.push(FormatItem {
                        extension: v.extension.as_str(),
                        level: &v.level,
                        detail: v.detail.as_deref(),
                    });
                }
                for (ext, kind) in result.limits() {
                    limits.push(LimitItem { extension: ext.as_str(), limit: *kind });
                }
            }
            Err(e) => error = Some(e.to_string()),
        }
        Self { path: path.display().to_string(), formats, limits, error }
    }
}

/// 文本形式：每个格式一行 `<ext>: <level>`；`indent` 为真时行首加制表符
pub fn write_text(out: &mut dyn Write, result: &ScanResult, indent: bool) -> io::Result<()> {
    let prefix = if indent { "\t" } else { "" };
    for v in result.verdicts() {
        match &v.detail {
            Some(detail) => writeln!(out, "{prefix}{}: {} with additional types {detail}", v.extension, v.level)?,
            None => writeln!(out, "{prefix}{}: {}", v.extension, v.level)?,
        }
    }
    for (ext, kind) in result.limits() {
        writeln!(out, "{prefix}{ext}: LIMIT_EXCEEDED({kind})")?;
    }
    Ok(())
}

/// JSON 行形式：每个文件一个对象
pub fn write_json(out: &mut dyn Write, path: &Path, outcome: &Result<ScanResult, ScanError>) -> io::Result<()> {
    let item = FileReport::new(path, outcome);
    serde_json::to_writer(&mut *out, &item)?;
    writeln!(out)
}
