//! 下载流程的错误分类（列表 / 规划 / 执行三个阶段）。

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    // ── 列表阶段 ──
    #[error("[listing] 仓库 {repo} 不存在（HTTP 404），请检查 --repo-id 与 --revision")]
    RepositoryNotFound { repo: String },

    #[error("[listing] 无权访问仓库 {repo}（HTTP {status}），受限仓库请设置 HF_TOKEN 或 config.yml 中的 hf_token")]
    AccessDenied { repo: String, status: u16 },

    #[error("[listing] 获取仓库 {repo} 文件列表失败: {message}，请检查网络后重新运行")]
    NetworkError { repo: String, message: String },

    // ── 规划阶段 ──
    #[error("[detect] 无法识别分片文件命名规律: {reason}，请手动指定 --pattern / --num-files / --start-index")]
    PatternDetectionFailed { reason: String },

    #[error("[plan] 文件名模板无效 '{template}': {reason}")]
    InvalidPattern { template: String, reason: String },

    // ── 执行阶段 ──
    #[error("[download] 未找到外部下载器 {binary}: {message}，请先安装 aria2 或通过 --aria2-path 指定路径")]
    ExternalToolMissing { binary: String, message: String },

    #[error("[download] aria2c 以退出码 {code} 结束，重新运行即可断点续传")]
    DownloadFailed { code: i32 },

    #[error("[download] 下载被中断，重新运行即可断点续传")]
    Interrupted,

    #[error("[download] 写入 {path} 失败: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl FetchError {
    pub(crate) fn invalid_pattern(template: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            template: template.to_string(),
            reason: reason.into(),
        }
    }

    /// 进程退出码：下载失败时透传 aria2c 的退出码，中断为 130，其余为 1。
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DownloadFailed { code } if *code != 0 => *code,
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
