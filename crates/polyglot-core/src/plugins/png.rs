//! PNG：8 字节魔数 + 分段（长度、名称、数据、CRC），以 IEND 结束
use tracing::trace;

use super::FormatPlugin;
use crate::error::CheckError;
use crate::level::ResultLevel;
use crate::probe::Probe;

const RULE: &str = r#"
[[rules]]
id = "IsPNG"
[[rules.conditions]]
kind = "bytes"
offset = 0
hex = "89 50 4E 47 0D 0A 1A 0A"
"#;

const MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
const CRC_SIZE: u64 = 4;
const END_SECTION: &str = "IEND";

pub struct PngPlugin;

impl FormatPlugin for PngPlugin {
    fn extension(&self) -> &'static str {
        "png"
    }

    fn quick_rule(&self) -> &'static str {
        RULE
    }

    fn validate(&self, probe: &mut Probe<'_>) -> Result<Option<ResultLevel>, CheckError> {
        // 命名空间内任一规则命中即可（覆盖文件可以换掉规则名）
        if probe.matches().is_empty() {
            return Ok(None);
        }
        check(probe)
    }
}

/// 深度校验
///
/// 分段头截断、名称不是合法 UTF-8，都视为“不是 PNG”。
/// 分段数据越过文件末尾时停在末尾：后面读不到分段头即失败，IEND 除外。
fn check(probe: &mut Probe<'_>) -> Result<Option<ResultLevel>, CheckError> {
    let mut r = probe.open()?;
    let mut magic = [0u8; 8];
    if !r.read_full(&mut magic)? || &magic != MAGIC {
        return Ok(None);
    }

    loop {
        let mut heading = [0u8; 8];
        if !r.read_full(&mut heading)? {
            return Ok(None);
        }
        let length = u32::from_be_bytes([heading[0], heading[1], heading[2], heading[3]]);
        let Ok(name) = std::str::from_utf8(&heading[4..]) else {
            return Ok(None);
        };
        trace!(section = name, length, offset = r.position() - 8, "png section");
        let is_end = name == END_SECTION;
        r.skip(u64::from(length) + CRC_SIZE)?;
        if is_end {
            break;
        }
    }

    let mut level = ResultLevel::VALID;
    if r.read_up_to(&mut [0u8; 1])? != 0 {
        level = level.union(&ResultLevel::GARBAGE_AT_END);
    }
    Ok(Some(level))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::options::ScanLimits;
    use crate::signature::{Matches, RuleMatch};
    use std::io::Write;

    /// 最小 PNG：IHDR + IEND（CRC 填零，校验器不验证 CRC）
    pub(crate) fn minimal_png() -> Vec<u8> {
        let mut v = MAGIC.to_vec();
        v.extend_from_slice(&13u32.to_be_bytes());
        v.extend_from_slice(b"IHDR");
        v.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 1, 8, 2, 0, 0, 0]);
        v.extend_from_slice(&[0; 4]);
        v.extend_from_slice(&0u32.to_be_bytes());
        v.extend_from_slice(b"IEND");
        v.extend_from_slice(&[0xAE, 0x42, 0x60, 0x82]);
        v
    }

    fn run(data: &[u8], limits: ScanLimits) -> Result<Option<ResultLevel>, CheckError> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        let matches: Matches =
            [RuleMatch { namespace: "png".into(), rule: "IsPNG".into() }].into_iter().collect();
        let mut probe = Probe::new(f.path(), &matches, &limits, None);
        PngPlugin.validate(&mut probe)
    }

    #[test]
    fn well_formed_is_exactly_valid() {
        let level = run(&minimal_png(), ScanLimits::default()).unwrap().unwrap();
        assert_eq!(level, ResultLevel::VALID);
        assert!(level.embedded().is_empty());
    }

    #[test]
    fn one_trailing_byte_is_garbage_at_end() {
        let mut data = minimal_png();
        data.push(b'!');
        let level = run(&data, ScanLimits::default()).unwrap().unwrap();
        assert_eq!(level, ResultLevel::VALID.union(&ResultLevel::GARBAGE_AT_END));
    }

    #[test]
    fn truncated_or_malformed_is_no_opinion() {
        let data = minimal_png();
        assert!(run(&data[..data.len() - 6], ScanLimits::default()).unwrap().is_none());

        let mut bad_name = minimal_png();
        bad_name[12..16].copy_from_slice(&[0xff, 0xfe, 0xfd, 0xfc]);
        assert!(run(&bad_name, ScanLimits::default()).unwrap().is_none());

        assert!(run(b"\x89PNG\r\n\x1a", ScanLimits::default()).unwrap().is_none());
    }

    #[test]
    fn huge_section_length_is_no_opinion() {
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        data.extend_from_slice(b"IDAT");
        assert!(run(&data, ScanLimits::default()).unwrap().is_none());
    }

    #[test]
    fn oversized_iend_still_ends_the_image() {
        let mut data = minimal_png();
        let iend_len = data.len() - 12;
        data[iend_len..iend_len + 4].copy_from_slice(&1024u32.to_be_bytes());
        assert_eq!(run(&data, ScanLimits::default()).unwrap(), Some(ResultLevel::VALID));
    }

    #[test]
    fn renamed_quick_rule_still_dispatches() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&minimal_png()).unwrap();
        let matches: Matches =
            [RuleMatch { namespace: "png".into(), rule: "PngMagic".into() }].into_iter().collect();
        let mut probe = Probe::new(f.path(), &matches, &ScanLimits::default(), None);
        assert_eq!(PngPlugin.validate(&mut probe).unwrap(), Some(ResultLevel::VALID));
    }

    #[test]
    fn many_sections_hit_read_budget() {
        let mut data = MAGIC.to_vec();
        for _ in 0..64 {
            data.extend_from_slice(&0u32.to_be_bytes());
            data.extend_from_slice(b"tEXt");
            data.extend_from_slice(&[0; 4]);
        }
        let limits = ScanLimits { max_read_bytes: 128, timeout: None };
        let err = run(&data, limits).unwrap_err();
        assert!(matches!(err, CheckError::Limit(crate::error::LimitKind::ReadBudget)));
    }

    #[test]
    fn without_quick_match_there_is_no_opinion() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&minimal_png()).unwrap();
        let matches = Matches::default();
        let mut probe = Probe::new(f.path(), &matches, &ScanLimits::default(), None);
        assert!(PngPlugin.validate(&mut probe).unwrap().is_none());
    }
}
