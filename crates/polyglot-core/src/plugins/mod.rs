//! 格式插件
//!
//! 每个受支持的容器格式实现一次 `FormatPlugin`：扩展名即命名空间，
//! 快速匹配规则用于预筛，`validate` 做深度结构校验。
use crate::error::CheckError;
use crate::level::ResultLevel;
use crate::probe::Probe;

pub(crate) mod png;
pub(crate) mod tar;
pub(crate) mod zip;

pub use png::PngPlugin;
pub use tar::TarPlugin;
pub use zip::ZipPlugin;

/// 格式插件接口
///
/// `validate` 返回 `Ok(None)` 表示“不像该格式”，这是最常见的结果而不是错误。
/// 实现必须是纯函数：只读文件，不共享可变状态，可跨格式、跨文件并发调用。
pub trait FormatPlugin: Send + Sync {
    /// 扩展名，同时作为规则命名空间；在注册表内唯一
    fn extension(&self) -> &'static str;

    /// 快速匹配规则源码（TOML）；直接检查文件的格式返回空串
    fn quick_rule(&self) -> &'static str {
        ""
    }

    fn validate(&self, probe: &mut Probe<'_>) -> Result<Option<ResultLevel>, CheckError>;
}
