//! 校验器的受限文件访问
//!
//! 每个校验器通过 `Probe` 独立打开文件。读取与跳过的字节都计入预算，
//! 每次操作都检查单文件截止时间；超限以 `CheckError::Limit` 返回，只影响当前格式。
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;

use memmap2::Mmap;

use crate::error::{CheckError, LimitKind};
use crate::options::ScanLimits;
use crate::signature::Matches;

/// 预算计数
#[derive(Debug, Clone)]
struct Budget {
    limit: u64,
    spent: u64,
    deadline: Option<Instant>,
}

impl Budget {
    fn charge(&mut self, n: u64) -> Result<(), CheckError> {
        self.spent = self.spent.saturating_add(n);
        if self.spent > self.limit {
            return Err(CheckError::Limit(LimitKind::ReadBudget));
        }
        self.check_deadline()
    }

    fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.spent)
    }

    fn check_deadline(&self) -> Result<(), CheckError> {
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(CheckError::Limit(LimitKind::Timeout)),
            _ => Ok(()),
        }
    }
}

/// 单个格式校验的上下文：文件路径、该命名空间的命中、预算
pub struct Probe<'a> {
    path: &'a Path,
    matches: &'a Matches,
    budget: Budget,
}

impl<'a> Probe<'a> {
    pub fn new(path: &'a Path, matches: &'a Matches, limits: &ScanLimits, deadline: Option<Instant>) -> Self {
        Self { path, matches, budget: Budget { limit: limits.max_read_bytes, spent: 0, deadline } }
    }

    pub fn path(&self) -> &Path {
        self.path
    }

    /// 本格式命名空间下的快速匹配命中
    pub fn matches(&self) -> &Matches {
        self.matches
    }

    /// 已计入预算的字节数
    pub fn spent(&self) -> u64 {
        self.budget.spent
    }

    /// 顺序读取
    pub fn open(&mut self) -> Result<ProbeReader<'_>, CheckError> {
        self.budget.check_deadline()?;
        let file = File::open(self.path)?;
        let len = file.metadata()?.len();
        Ok(ProbeReader { file, len, pos: 0, budget: &mut self.budget })
    }

    /// 随机访问（内存映射）；空文件返回空映射
    pub fn map(&mut self) -> Result<MappedFile<'_>, CheckError> {
        self.budget.check_deadline()?;
        let file = File::open(self.path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            None
        } else {
            // SAFETY: 只读映射；扫描期间文件被外部截断属于调用方环境问题，
            // 与普通读取一样会以 SIGBUS/错误形式暴露，不在此处处理。
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(MappedFile { map, budget: &mut self.budget })
    }
}

/// 计入预算的顺序读取器
pub struct ProbeReader<'b> {
    file: File,
    len: u64,
    pos: u64,
    budget: &'b mut Budget,
}

impl ProbeReader<'_> {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }

    /// 尽量读满 `buf`，返回实际读取的字节数（遇 EOF 提前返回）
    pub fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize, CheckError> {
        self.budget.charge(buf.len() as u64)?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.pos += filled as u64;
        Ok(filled)
    }

    /// 读满 `buf` 返回 true；数据不足返回 false
    pub fn read_full(&mut self, buf: &mut [u8]) -> Result<bool, CheckError> {
        Ok(self.read_up_to(buf)? == buf.len())
    }

    /// 向前跳过至多 `n` 字节，越过文件末尾时停在末尾；返回实际跳过的字节数
    ///
    /// 只按实际移动的距离计入预算。
    pub fn skip(&mut self, n: u64) -> Result<u64, CheckError> {
        let step = n.min(self.remaining());
        self.budget.charge(step)?;
        let target = self.pos + step;
        self.file.seek(SeekFrom::Start(target))?;
        self.pos = target;
        Ok(step)
    }
}

/// 计入预算的只读映射
pub struct MappedFile<'b> {
    map: Option<Mmap>,
    budget: &'b mut Budget,
}

impl MappedFile<'_> {
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 登记一次对 `n` 字节的检查
    pub fn charge(&mut self, n: usize) -> Result<(), CheckError> {
        self.budget.charge(n as u64)
    }

    /// 预算中还可读取的字节数
    pub fn budget_left(&self) -> u64 {
        self.budget.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_with(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f
    }

    #[test]
    fn reads_and_skips_are_charged() {
        let f = temp_with(&[7u8; 100]);
        let matches = Matches::default();
        let limits = ScanLimits { max_read_bytes: 50, timeout: None };
        let mut probe = Probe::new(f.path(), &matches, &limits, None);
        let mut r = probe.open().unwrap();
        let mut buf = [0u8; 10];
        assert!(r.read_full(&mut buf).unwrap());
        assert_eq!(r.skip(30).unwrap(), 30);
        assert_eq!(r.position(), 40);
        let err = r.read_up_to(&mut [0u8; 20]).unwrap_err();
        assert!(matches!(err, CheckError::Limit(LimitKind::ReadBudget)));
    }

    #[test]
    fn skip_past_end_stops_at_end() {
        let f = temp_with(&[0u8; 16]);
        let matches = Matches::default();
        let limits = ScanLimits { max_read_bytes: 20, timeout: None };
        let mut probe = Probe::new(f.path(), &matches, &limits, None);
        let mut r = probe.open().unwrap();
        assert_eq!(r.skip(4).unwrap(), 4);
        // 只计实际移动的 12 字节，不会因声明的长度超出预算
        assert_eq!(r.skip(u64::MAX).unwrap(), 12);
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.skip(1).unwrap(), 0);
        assert_eq!(r.read_up_to(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn expired_deadline_is_timeout() {
        let f = temp_with(b"x");
        let matches = Matches::default();
        let mut probe = Probe::new(f.path(), &matches, &ScanLimits::default(), Some(Instant::now()));
        assert!(matches!(probe.open(), Err(CheckError::Limit(LimitKind::Timeout))));
    }

    #[test]
    fn empty_file_maps_to_empty_slice() {
        let f = temp_with(b"");
        let matches = Matches::default();
        let mut probe = Probe::new(f.path(), &matches, &ScanLimits::default(), None);
        let m = probe.map().unwrap();
        assert!(m.is_empty());
    }
}
