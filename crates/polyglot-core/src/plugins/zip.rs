//! ZIP：无快速匹配规则，直接对文件做随机访问检查
//!
//! 从文件尾向前查找 `PK`，搜索窗口不包含最小 EOCD 记录除魔数外的部分。
//! 已知限制：非零长度的 ZIP 注释与追加垃圾无法区分，二者都会报 GARBAGE_AT_END。
use aho_corasick::AhoCorasick;
use tracing::debug;

use super::FormatPlugin;
use crate::error::{CheckError, LimitKind};
use crate::level::ResultLevel;
use crate::probe::{MappedFile, Probe};

const MAGIC: &[u8; 2] = b"PK";
const EOCD_MIN_SIZE: usize = 22;
/// 分块检查，块之间检查预算与截止时间
const SEARCH_BLOCK: usize = 1 << 20;

/// 归档成员名 -> 内嵌格式标识
const EMBEDDED_MARKERS: [(&str, &str); 5] = [
    ("META-INF/MANIFEST.MF", "jar"),
    ("AndroidManifest.xml", "apk"),
    ("word/document.xml", "docx"),
    ("xl/workbook.xml", "xlsx"),
    ("ppt/presentation.xml", "pptx"),
];

pub struct ZipPlugin;

impl FormatPlugin for ZipPlugin {
    fn extension(&self) -> &'static str {
        "zip"
    }

    fn validate(&self, probe: &mut Probe<'_>) -> Result<Option<ResultLevel>, CheckError> {
        let mut map = probe.map()?;
        check(&mut map)
    }
}

fn check(map: &mut MappedFile<'_>) -> Result<Option<ResultLevel>, CheckError> {
    let size = map.len();
    let window_end = (size + MAGIC.len()).saturating_sub(EOCD_MIN_SIZE);
    let Some(last) = rfind_magic(map, window_end)? else {
        return Ok(None);
    };

    let mut level = ResultLevel::VALID;
    // 首次出现位置：最远不会超过 last
    let first = find_magic(map, last + MAGIC.len())?.unwrap_or(last);
    if first != 0 {
        level = level.union(&ResultLevel::GARBAGE_AT_BEGINNING);
    }
    if size - last != EOCD_MIN_SIZE {
        level = level.union(&ResultLevel::GARBAGE_AT_END);
    }

    // 内嵌格式只是补充信息：超出限制时保留结论，不报 EMBED
    match embedded_formats(map, first) {
        Ok(ids) => {
            for id in ids {
                level = level.with_embedded(id);
            }
        }
        Err(CheckError::Limit(kind)) => debug!(%kind, "embedded format scan skipped"),
        Err(e) => return Err(e),
    }
    debug!(eocd_at = last, size, %level, "zip check");
    Ok(Some(level))
}

/// 在 `[0, end)` 内从后向前找 `PK`
fn rfind_magic(map: &mut MappedFile<'_>, end: usize) -> Result<Option<usize>, CheckError> {
    let mut hi = end.min(map.len());
    while hi >= MAGIC.len() {
        let lo = hi.saturating_sub(SEARCH_BLOCK);
        map.charge(hi - lo)?;
        // 向前扩 1 字节以覆盖跨块的魔数
        let from = lo.saturating_sub(MAGIC.len() - 1);
        if let Some(pos) = map.bytes()[from..hi].windows(MAGIC.len()).rposition(|w| w == MAGIC) {
            return Ok(Some(from + pos));
        }
        if lo == 0 {
            break;
        }
        hi = lo;
    }
    Ok(None)
}

/// 在 `[0, end)` 内从前向后找 `PK`
fn find_magic(map: &mut MappedFile<'_>, end: usize) -> Result<Option<usize>, CheckError> {
    let end = end.min(map.len());
    let mut lo = 0;
    while lo + MAGIC.len() <= end {
        let hi = (lo + SEARCH_BLOCK).min(end);
        map.charge(hi - lo)?;
        let to = (hi + MAGIC.len() - 1).min(end);
        if let Some(pos) = map.bytes()[lo..to].windows(MAGIC.len()).position(|w| w == MAGIC) {
            return Ok(Some(lo + pos));
        }
        lo = hi;
    }
    Ok(None)
}

/// 按常见成员名识别 JAR/APK/OOXML 等“披着 ZIP 外衣”的格式
///
/// 只搜索从首个 `PK` 开始的归档区域，前置的其他格式数据不参与。
fn embedded_formats(map: &mut MappedFile<'_>, start: usize) -> Result<Vec<&'static str>, CheckError> {
    let region = map.len().saturating_sub(start);
    if region as u64 > map.budget_left() {
        return Err(CheckError::Limit(LimitKind::ReadBudget));
    }
    map.charge(region)?;
    let patterns: Vec<&str> = EMBEDDED_MARKERS.iter().map(|(p, _)| *p).collect();
    let Ok(ac) = AhoCorasick::new(&patterns) else {
        return Ok(Vec::new());
    };
    let mut found: Vec<&'static str> = Vec::new();
    for m in ac.find_iter(&map.bytes()[start..]) {
        let id = EMBEDDED_MARKERS[m.pattern().as_usize()].1;
        if !found.contains(&id) {
            found.push(id);
        }
    }
    Ok(found)
}
