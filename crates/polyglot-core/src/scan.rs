//! 多文件扫描主流程与并行调度
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};
use walkdir::WalkDir;

use crate::detector::{Detector, ScanResult};
use crate::error::{Result, ScanError};
use crate::options::{ScanOptions, ScanStats};
use crate::report::{write_json, write_text};
use crate::sniff::{MagicDb, MimeSniffer};

/// 展开输入：文件原样保留，目录递归收集其中的文件（按路径排序，保证输出稳定）
pub fn collect_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for p in paths {
        if !p.is_dir() {
            out.push(p.clone());
            continue;
        }
        let mut files: Vec<PathBuf> = WalkDir::new(p)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();
        out.extend(files);
    }
    out
}

/// 按选项构建嗅探器（未启用时为 None）
pub fn build_sniffer(opts: &ScanOptions) -> Result<Option<Arc<dyn MimeSniffer>>> {
    let Some(sniff) = &opts.sniff else { return Ok(None) };
    let db = match &sniff.database {
        Some(path) => MagicDb::load(path, sniff.keep_going, opts.limits)?,
        None => MagicDb::builtin(sniff.keep_going, opts.limits)?,
    };
    Ok(Some(Arc::new(db)))
}

/// 扫描单个文件，并按需用嗅探结果补充
pub fn scan_file(detector: &Detector, sniffer: Option<&dyn MimeSniffer>, path: &Path) -> Result<ScanResult> {
    let mut result = detector.scan(path)?;
    if let Some(s) = sniffer {
        let sniffed = s.identify(path)?;
        result.backfill(&sniffed);
    }
    Ok(result)
}

/// 扫描全部输入并按输入顺序写出结果
///
/// - 单个输入：每个格式一行；多个输入：先写 `<文件名>:`，结果行缩进。
/// - 某个文件无法读取不会中断其他文件，错误写入 `errors` 并计入统计。
pub fn scan_and_write(
    paths: &[PathBuf],
    out: &mut dyn Write,
    errors: &mut dyn Write,
    opts: &ScanOptions,
) -> Result<ScanStats> {
    let detector = Arc::new(Detector::from_options(opts)?);
    let sniffer = build_sniffer(opts)?;
    let files = collect_inputs(paths);
    info!(files = files.len(), "starting scan");

    let threads = opts.threads.unwrap_or_else(num_cpus::get).max(1);
    let multi = files.len() > 1;
    let mut stats = ScanStats::default();
    let mut emit = |path: &Path, outcome: Result<ScanResult>| -> std::io::Result<()> {
        record(&mut stats, &outcome);
        if opts.json {
            return write_json(&mut *out, path, &outcome);
        }
        match &outcome {
            Ok(result) => {
                if multi {
                    writeln!(out, "{}:", path.display())?;
                }
                write_text(&mut *out, result, multi)
            }
            Err(e) => {
                error!(?path, error = %e, "scan failed");
                writeln!(errors, "{}: error: {e}", path.display())
            }
        }
    };

    if threads > 1 && multi {
        scan_parallel(&files, &detector, sniffer, threads, &mut emit)?;
    } else {
        // 串行路径
        for path in &files {
            let outcome = scan_file(&detector, sniffer.as_deref(), path);
            emit(path.as_path(), outcome).map_err(|e| ScanError::io("<output>", e))?;
        }
    }

    info!(
        files_scanned = stats.files_scanned,
        files_failed = stats.files_failed,
        formats_reported = stats.formats_reported,
        limits_hit = stats.limits_hit,
        "scan finished"
    );
    Ok(stats)
}

fn record(stats: &mut ScanStats, outcome: &Result<ScanResult>) {
    match outcome {
        Ok(r) => {
            stats.files_scanned += 1;
            stats.formats_reported += r.len();
            stats.limits_hit += r.limits().len();
        }
        Err(_) => stats.files_failed += 1,
    }
}

/// 并行调度：
/// - Rayon 线程池并行扫描（每个文件一个任务）
/// - 当前线程作为 writer，按 idx 重排后输出，保证稳定顺序
fn scan_parallel(
    files: &[PathBuf],
    detector: &Arc<Detector>,
    sniffer: Option<Arc<dyn MimeSniffer>>,
    threads: usize,
    emit: &mut dyn FnMut(&Path, Result<ScanResult>) -> std::io::Result<()>,
) -> Result<()> {
    use crossbeam_channel as channel;
    use rayon::prelude::*;
    use std::collections::BTreeMap;

    type Msg = (usize /*idx*/, Result<ScanResult>);
    let (tx, rx) = channel::bounded::<Msg>(256);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| ScanError::ThreadPool(e.to_string()))?;

    let detector = Arc::clone(detector);
    let jobs: Vec<(usize, PathBuf)> = files.iter().cloned().enumerate().collect();
    let scan_thread = std::thread::spawn(move || {
        pool.install(|| {
            jobs.par_iter().for_each(|(idx, path)| {
                let outcome = scan_file(&detector, sniffer.as_deref(), path);
                let _ = tx.send((*idx, outcome));
            });
        });
        // 结束后 Sender 全部被丢弃，Receiver 将收到关闭信号
    });

    // Writer：维护 next_idx 与缓存，按序输出
    let mut next_idx = 0usize;
    let mut buffer: BTreeMap<usize, Result<ScanResult>> = BTreeMap::new();
    let mut write_err: Option<std::io::Error> = None;
    while let Ok((idx, outcome)) = rx.recv() {
        buffer.insert(idx, outcome);
        while let Some(outcome) = buffer.remove(&next_idx) {
            if write_err.is_none() {
                if let Err(e) = emit(files[next_idx].as_path(), outcome) {
                    write_err = Some(e);
                }
            }
            next_idx += 1;
        }
    }

    // 工作线程 panic 时未发送的文件会缺失，不能当作正常结束
    if scan_thread.join().is_err() {
        return Err(ScanError::ThreadPool(format!(
            "scan worker panicked after {next_idx} of {} files",
            files.len()
        )));
    }
    match write_err {
        Some(e) => Err(ScanError::io("<output>", e)),
        None => Ok(()),
    }
}
