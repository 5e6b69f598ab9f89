//! HF Shard Downloader：Hugging Face 分片权重批量下载器。
//!
//! 本 crate 负责：拉取仓库文件列表、识别分片命名规律、生成下载计划，
//! 再交给 aria2c 多连接下载并支持断点续传。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置 / 日志 / 中断处理等基础设施
//! - `network_parser`：Hub tree 接口与下载地址拼接
//! - `download`：模板、规律识别、下载计划与 aria2c 执行

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{error, info, warn};

mod base_system;
mod download;
mod network_parser;

use base_system::config::load_or_create_with_base;
use base_system::context::{Config, DownloadOverrides};
use base_system::logging::{LogOptions, LogSystem};
use download::downloader::DownloadTask;
use download::error::FetchError;
use download::models::{PatternOverrides, RepositoryRef, SplitSize};
use download::plan::prepare_download_plan;
use network_parser::network::HubClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "hf-shard-downloader", version)]
#[command(about = "使用 aria2c 批量下载 Hugging Face 分片模型权重")]
struct Cli {
    /// 仓库 ID，格式为 owner/name
    #[arg(long)]
    repo_id: RepositoryRef,

    /// 保存目录（默认为仓库名，保留原大小写）
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// 文件名模板，例如 model-{i:05d}-of-00163.safetensors
    #[arg(long)]
    pattern: Option<String>,

    /// 分片文件数量
    #[arg(long)]
    num_files: Option<u32>,

    /// 起始序号
    #[arg(long)]
    start_index: Option<u32>,

    /// 同时下载的文件数
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_concurrent: Option<u32>,

    /// 单个文件的最大连接数（1-16）
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=16))]
    max_connections: Option<u32>,

    /// 最小分块大小（1M-1024M）
    #[arg(long)]
    min_split_size: Option<SplitSize>,

    /// 分支 / tag / commit（默认读取 config.yml）
    #[arg(long)]
    revision: Option<String>,

    /// 同时下载 config / tokenizer 等附属小文件
    #[arg(long, default_value_t = false)]
    with_auxiliary: bool,

    /// aria2c 可执行文件路径
    #[arg(long)]
    aria2_path: Option<String>,

    /// 数据目录（存放 config.yml、logs 与 aria2 产物）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| PathBuf::from("."));

    let config = match load_or_create_with_base::<Config>(None, Some(&data_dir)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("加载配置失败: {err}");
            return ExitCode::FAILURE;
        }
    };

    let log = match init_logging(cli.debug, &data_dir, config.archive_logs_on_exit) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    info!(target: "startup", "HF Shard Downloader v{VERSION}");

    let code = match run(&cli, &config, &data_dir, &log) {
        Ok(()) => 0,
        Err(err) => {
            error!(target: "startup", "{err:#}");
            exit_code_of(&err)
        }
    };
    log.safe_exit();
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: &Cli, config: &Config, data_dir: &Path, log: &LogSystem) -> Result<()> {
    let hub = HubClient::new(config.hub_config(cli.revision.as_deref())?)
        .context("初始化 HTTP 客户端失败")?;

    let overrides = PatternOverrides {
        template: cli.pattern.clone(),
        num_files: cli.num_files,
        start_index: cli.start_index,
    };
    let plan = prepare_download_plan(
        &cli.repo_id,
        &overrides,
        cli.output_dir.as_deref(),
        config.plan_options(cli.with_auxiliary),
        &hub,
        hub.endpoints(),
    )?;
    info!(
        target: "plan",
        repo = %plan.repo,
        pattern = %plan.pattern.template,
        shards = plan.shard_count(),
        total = plan.entries.len(),
        output_dir = %plan.output_dir.display(),
        "下载计划已生成"
    );

    let settings = config
        .download_settings(
            &DownloadOverrides {
                aria2_path: cli.aria2_path.clone(),
                max_concurrent_downloads: cli.max_concurrent,
                max_connection_per_server: cli.max_connections,
                min_split_size: cli.min_split_size,
            },
            data_dir,
        )
        .map_err(|e| anyhow!(e))?;

    let interrupted = log.interrupt_flag();
    let mut task = DownloadTask::new(&plan, &settings);
    let outcome = task.run(&interrupted)?;

    if interrupted.load(Ordering::SeqCst) {
        warn!(target: "download", "下载过程中收到过中断信号");
    }
    info!(
        target: "download",
        total = outcome.total,
        completed = outcome.completed,
        existing = outcome.existing,
        output_dir = %plan.output_dir.display(),
        "全部文件下载完成"
    );
    Ok(())
}

fn init_logging(debug: bool, data_dir: &Path, archive_on_exit: bool) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit,
        console: true,
        logs_dir: data_dir.join("logs"),
    };
    LogSystem::init(opts).context("初始化日志系统失败")
}

fn exit_code_of(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<FetchError>()
        .map(FetchError::exit_code)
        .unwrap_or(1)
}
