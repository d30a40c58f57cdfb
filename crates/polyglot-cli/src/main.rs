use anyhow::{Context, Result};
use clap::Parser;
use polyglot_core::{scan_and_write, ScanLimits, ScanOptions, SniffOptions, DEFAULT_MAX_READ_BYTES};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "polyglot-detector", version, about = "检测常见格式中的多格式（polyglot）文件")]
struct Cli {
    /// 待扫描的文件（目录会递归展开）
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// 额外用签名库嗅探 MIME 类型，补充结构校验器未识别的扩展名
    #[arg(short = 'm', long)]
    magic: bool,

    /// 嗅探时不在首个命中处停止，报告所有可能类型（隐含 --magic）
    #[arg(long)]
    magic_continue: bool,

    /// 替代签名库路径（TOML，隐含 --magic）
    #[arg(long, value_name = "PATH")]
    magic_db: Option<PathBuf>,

    /// 快速匹配规则覆盖文件（TOML）
    #[arg(long, value_name = "PATH")]
    rules: Option<PathBuf>,

    /// 线程数（"auto"=CPU 核心数）
    #[arg(long, default_value = "auto")]
    threads: String,

    /// 每个格式校验器可读取/跳过的最大字节数
    #[arg(long, default_value_t = DEFAULT_MAX_READ_BYTES)]
    max_read_bytes: u64,

    /// 单文件扫描超时（毫秒，0 表示不限制）
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// 以 JSON 行输出（每个文件一行）
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    // --magic-continue 与 --magic-db 都隐含 --magic
    let magic = cli.magic || cli.magic_continue || cli.magic_db.is_some();
    let sniff = magic.then(|| SniffOptions { keep_going: cli.magic_continue, database: cli.magic_db.clone() });
    let timeout = (cli.timeout_ms > 0).then(|| Duration::from_millis(cli.timeout_ms));

    let opts = ScanOptions {
        threads: parse_threads(&cli.threads),
        limits: ScanLimits { max_read_bytes: cli.max_read_bytes, timeout },
        rules_path: cli.rules,
        sniff,
        json: cli.json,
    };
    info!(files = cli.files.len(), magic, "starting polyglot-detector");

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let stderr = io::stderr();
    let mut err = stderr.lock();
    let stats = scan_and_write(&cli.files, &mut out, &mut err, &opts).context("scan failed")?;
    out.flush().context("flush output")?;

    // 无法打开的文件不影响其他文件，但整体以失败退出
    Ok(if stats.files_failed > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 日志写 stderr，stdout 只输出结果；可通过 RUST_LOG 调整，例如 RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}
