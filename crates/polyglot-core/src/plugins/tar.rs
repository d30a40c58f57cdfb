//! TAR：512 字节头块 + 按块对齐的数据，以全零块结束
use tracing::trace;

use super::FormatPlugin;
use crate::error::CheckError;
use crate::level::ResultLevel;
use crate::probe::Probe;

/// 首个头块的启发式预筛（参照 file(1) 的 archive 魔数）
const RULE: &str = r#"
[[rules]]
id = "IsTAR"
# 校验和附近的两个字为零
[[rules.conditions]]
kind = "uint"
offset = 500
width = 4
eq = 0
[[rules.conditions]]
kind = "uint"
offset = 504
width = 4
eq = 0
[[rules.conditions]]
kind = "uint"
offset = 0
width = 2
endian = "be"
gt = 0x1F00
lt = 0xFCFD
[[rules.conditions]]
kind = "uint"
offset = 508
width = 2
endian = "be"
mask = 0x8B9E8DFF
eq = 0
# 文件模式以 NUL、空格或八进制数字开头
[[rules.conditions]]
kind = "uint"
offset = 100
width = 1
one_of = ["0x00", "0x20", "0x30-0x37"]
[[rules.conditions]]
kind = "uint"
offset = 101
width = 1
one_of = ["0x00", "0x20", "0x30-0x37"]
[[rules.conditions]]
kind = "uint"
offset = 148
width = 1
one_of = ["0x00", "0x30"]
[[rules.conditions]]
kind = "uint"
offset = 155
width = 1
one_of = ["0x00", "0x20"]
"#;

const BLOCK_SIZE: usize = 512;
const NAME_LEN: usize = 100;
const SIZE_FIELD: std::ops::Range<usize> = 124..136;

pub struct TarPlugin;

impl FormatPlugin for TarPlugin {
    fn extension(&self) -> &'static str {
        "tar"
    }

    fn quick_rule(&self) -> &'static str {
        RULE
    }

    fn validate(&self, probe: &mut Probe<'_>) -> Result<Option<ResultLevel>, CheckError> {
        if probe.matches().is_empty() {
            return Ok(None);
        }
        check(probe)
    }
}

fn is_zero(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// 名称字段首个 NUL 之后仍有非零字节
fn name_has_trailing_data(name: &[u8]) -> bool {
    match name.iter().position(|&b| b == 0) {
        Some(nul) => !is_zero(&name[nul + 1..]),
        None => false,
    }
}

/// 八进制大小字段：去掉两端 NUL 与空白后必须全是八进制数字
fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?;
    let text = text.trim_matches('\0').trim();
    if text.is_empty() || !text.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return None;
    }
    u64::from_str_radix(text, 8).ok()
}

fn check(probe: &mut Probe<'_>) -> Result<Option<ResultLevel>, CheckError> {
    let mut r = probe.open()?;
    let mut level = ResultLevel::VALID;
    let mut header = [0u8; BLOCK_SIZE];
    let mut entries = 0usize;

    loop {
        let n = r.read_up_to(&mut header)?;
        if n == 0 {
            break;
        }
        if n < BLOCK_SIZE {
            // 不完整的头块：全零视为结尾填充，否则是结尾垃圾
            if !is_zero(&header[..n]) {
                level = level.union(&ResultLevel::GARBAGE_AT_END);
            }
            return Ok(Some(level));
        }
        if is_zero(&header) {
            break;
        }

        if name_has_trailing_data(&header[..NAME_LEN]) {
            level = level.union(&ResultLevel::GARBAGE_IN_MIDDLE);
        }
        let Some(size) = parse_octal(&header[SIZE_FIELD]) else {
            return Ok(None);
        };
        let data_blocks = size.div_ceil(BLOCK_SIZE as u64);
        trace!(entry = entries, size, data_blocks, "tar entry");
        entries += 1;
        // 数据越过文件末尾时停在末尾，下一次读头块即结束
        r.skip(data_blocks.saturating_mul(BLOCK_SIZE as u64))?;
    }

    // 跳过结尾的全零填充块，之后还有内容即为结尾垃圾
    let mut block = [0u8; BLOCK_SIZE];
    loop {
        let n = r.read_up_to(&mut block)?;
        if n == 0 {
            break;
        }
        if !is_zero(&block[..n]) {
            level = level.union(&ResultLevel::GARBAGE_AT_END);
            break;
        }
    }
    Ok(Some(level))
}
