//! 结果等级（标志位代数）
//!
//! 每个校验器都用 `ResultLevel` 描述文件相对“标准样本”的偏离位置：
//! 开头垃圾、结尾垃圾、中间异常、内嵌格式等。各标志位相互独立，可自由组合。
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

const VALID_BIT: u8 = 0x01;
const INVALID_BIT: u8 = 0x02;
const GARBAGE_AT_BEGINNING_BIT: u8 = 0x04;
const GARBAGE_AT_END_BIT: u8 = 0x08;
const GARBAGE_IN_MIDDLE_BIT: u8 = 0x10;
const EMBED_BIT: u8 = 0x20;
const ALL_BITS: u8 = VALID_BIT
    | INVALID_BIT
    | GARBAGE_AT_BEGINNING_BIT
    | GARBAGE_AT_END_BIT
    | GARBAGE_IN_MIDDLE_BIT
    | EMBED_BIT;

/// 渲染顺序即位序
const NAMES: [(u8, &str); 5] = [
    (VALID_BIT, "VALID"),
    (INVALID_BIT, "INVALID"),
    (GARBAGE_AT_BEGINNING_BIT, "GARBAGE_AT_BEGINNING"),
    (GARBAGE_AT_END_BIT, "GARBAGE_AT_END"),
    (GARBAGE_IN_MIDDLE_BIT, "GARBAGE_IN_MIDDLE"),
];

/// 不可变的标志值 + 内嵌格式标识集合
///
/// - 相等性同时比较标志位与内嵌集合；
/// - `VALID` 与 `INVALID` 是独立位，类型本身不阻止同时置位，由校验器约定不这样做；
/// - 内嵌集合只在 `EMBED` 置位时有意义。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ResultLevel {
    bits: u8,
    embedded: BTreeSet<String>,
}

impl ResultLevel {
    pub const NONE: ResultLevel = ResultLevel::from_bits(0);
    pub const VALID: ResultLevel = ResultLevel::from_bits(VALID_BIT);
    pub const INVALID: ResultLevel = ResultLevel::from_bits(INVALID_BIT);
    pub const GARBAGE_AT_BEGINNING: ResultLevel = ResultLevel::from_bits(GARBAGE_AT_BEGINNING_BIT);
    pub const GARBAGE_AT_END: ResultLevel = ResultLevel::from_bits(GARBAGE_AT_END_BIT);
    pub const GARBAGE_IN_MIDDLE: ResultLevel = ResultLevel::from_bits(GARBAGE_IN_MIDDLE_BIT);
    pub const EMBED: ResultLevel = ResultLevel::from_bits(EMBED_BIT);

    const fn from_bits(bits: u8) -> Self {
        Self { bits: bits & ALL_BITS, embedded: BTreeSet::new() }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn embedded(&self) -> &BTreeSet<String> {
        &self.embedded
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// 并集：标志位按位或，内嵌集合取并
    pub fn union(&self, other: &ResultLevel) -> ResultLevel {
        ResultLevel {
            bits: self.bits | other.bits,
            embedded: self.embedded.union(&other.embedded).cloned().collect(),
        }
    }

    /// 交集：标志位按位与，内嵌集合取交
    pub fn intersect(&self, other: &ResultLevel) -> ResultLevel {
        ResultLevel {
            bits: self.bits & other.bits,
            embedded: self.embedded.intersection(&other.embedded).cloned().collect(),
        }
    }

    /// 对称差：标志位按位异或，内嵌集合取对称差
    pub fn symmetric_difference(&self, other: &ResultLevel) -> ResultLevel {
        ResultLevel {
            bits: self.bits ^ other.bits,
            embedded: self.embedded.symmetric_difference(&other.embedded).cloned().collect(),
        }
    }

    /// 取反：翻转全部标志位，内嵌集合总是清空（内嵌不可逆）
    pub fn complement(&self) -> ResultLevel {
        ResultLevel::from_bits(!self.bits)
    }

    /// `other` 中置位的每一位都在 `self` 中置位时成立（不比较内嵌集合）
    ///
    /// 接收者是较大的一方：“`a` 的每一位都在 `b` 中”写作 `b.contains(&a)`，
    /// 例如 `(VALID | GARBAGE_AT_END).contains(&VALID)` 为真。
    pub fn contains(&self, other: &ResultLevel) -> bool {
        other.bits & self.bits == other.bits
    }

    /// 返回 `self ∪ EMBED`，并把 `format_id` 加入内嵌集合
    pub fn with_embedded(&self, format_id: &str) -> ResultLevel {
        let mut out = self.union(&ResultLevel::EMBED);
        out.embedded.insert(format_id.to_string());
        out
    }

    /// 置位标志的名称列表（EMBED 除外，便于 JSON 输出）
    pub fn flag_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = NAMES
            .iter()
            .filter(|(bit, _)| self.bits & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        if self.bits & EMBED_BIT != 0 {
            names.push("EMBED");
        }
        names
    }
}

impl fmt::Display for ResultLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bits == 0 {
            return f.write_str("NONE");
        }
        let mut parts: Vec<String> = NAMES
            .iter()
            .filter(|(bit, _)| self.bits & bit != 0)
            .map(|(_, name)| (*name).to_string())
            .collect();
        if self.bits & EMBED_BIT != 0 {
            // BTreeSet 迭代天然有序
            let ids: Vec<&str> = self.embedded.iter().map(String::as_str).collect();
            parts.push(format!("EMBED({})", ids.join(",")));
        }
        f.write_str(&parts.join("|"))
    }
}

/// JSON 形式：`{"flags": [...], "embedded": [...]}`
impl Serialize for ResultLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut st = serializer.serialize_struct("ResultLevel", 2)?;
        st.serialize_field("flags", &self.flag_names())?;
        st.serialize_field("embedded", &self.embedded)?;
        st.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_end() -> ResultLevel {
        ResultLevel::VALID.union(&ResultLevel::GARBAGE_AT_END)
    }

    #[test]
    fn containment_is_subset_of_bits() {
        assert!(valid_end().contains(&ResultLevel::VALID));
        assert!(valid_end().contains(&ResultLevel::GARBAGE_AT_END));
        assert!(!ResultLevel::VALID.contains(&valid_end()));
        assert!(ResultLevel::VALID.contains(&ResultLevel::NONE));
    }

    #[test]
    fn intersect_and_xor() {
        let a = valid_end();
        let b = ResultLevel::VALID.union(&ResultLevel::GARBAGE_IN_MIDDLE);
        assert_eq!(a.intersect(&b), ResultLevel::VALID);
        assert_eq!(
            a.symmetric_difference(&b),
            ResultLevel::GARBAGE_AT_END.union(&ResultLevel::GARBAGE_IN_MIDDLE)
        );
        assert_eq!(a.symmetric_difference(&a), ResultLevel::NONE);
    }

    #[test]
    fn double_complement_restores_plain_flags() {
        for bits in 0..=ALL_BITS {
            let x = ResultLevel::from_bits(bits);
            assert_eq!(x.complement().complement(), x);
        }
    }

    #[test]
    fn complement_drops_embedded_set() {
        let x = ResultLevel::VALID.with_embedded("jar");
        let back = x.complement().complement();
        assert_eq!(back.bits(), x.bits());
        assert!(back.embedded().is_empty());
        assert_ne!(back, x);
        assert!(x.complement().embedded().is_empty());
    }

    #[test]
    fn equality_compares_embedded_sets() {
        let jar = ResultLevel::VALID.with_embedded("jar");
        let docx = ResultLevel::VALID.with_embedded("docx");
        assert_eq!(jar.bits(), docx.bits());
        assert_ne!(jar, docx);
        assert_eq!(jar.union(&docx).embedded().len(), 2);
        assert!(jar.intersect(&docx).embedded().is_empty());
    }

    #[test]
    fn display_lists_flags_and_sorted_embeds() {
        assert_eq!(valid_end().to_string(), "VALID|GARBAGE_AT_END");
        let x = ResultLevel::VALID.with_embedded("jar").with_embedded("apk");
        assert_eq!(x.to_string(), "VALID|EMBED(apk,jar)");
        assert_eq!(ResultLevel::NONE.to_string(), "NONE");
    }

    #[test]
    fn json_shape() {
        let x = ResultLevel::VALID.with_embedded("jar");
        let v = serde_json::to_value(&x).unwrap();
        assert_eq!(v, serde_json::json!({ "flags": ["VALID", "EMBED"], "embedded": ["jar"] }));
    }
}
