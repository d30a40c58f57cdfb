//! 插件注册表：按顺序排列、扩展名唯一，启动时组装一次，扫描期间只读
use std::collections::HashSet;

use crate::error::{Result, ScanError};
use crate::plugins::{FormatPlugin, PngPlugin, TarPlugin, ZipPlugin};

pub struct Registry {
    plugins: Vec<Box<dyn FormatPlugin>>,
}

impl Registry {
    /// 按给定顺序组装；扩展名重复时报错
    pub fn new(plugins: Vec<Box<dyn FormatPlugin>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for p in &plugins {
            if !seen.insert(p.extension()) {
                return Err(ScanError::DuplicateExtension(p.extension().to_string()));
            }
        }
        Ok(Self { plugins })
    }

    /// 内置格式：png、tar、zip
    pub fn builtin() -> Self {
        Self { plugins: vec![Box::new(PngPlugin), Box::new(TarPlugin), Box::new(ZipPlugin)] }
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn FormatPlugin> {
        self.plugins.iter().map(|p| &**p)
    }

    pub fn get(&self, extension: &str) -> Option<&dyn FormatPlugin> {
        self.iter().find(|p| p.extension() == extension)
    }

    pub fn extensions(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.extension()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// 非空的快速匹配规则源码，(命名空间, 源码)
    pub fn rule_sources(&self) -> Vec<(&'static str, &'static str)> {
        self.plugins
            .iter()
            .filter(|p| !p.quick_rule().trim().is_empty())
            .map(|p| (p.extension(), p.quick_rule()))
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("extensions", &self.extensions()).finish()
    }
}
