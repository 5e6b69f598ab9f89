//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息，以及把配置与命令行覆盖值
//! 合成为 `HubConfig` / `DownloadSettings` / `PlanOptions` 的辅助函数。
//! 优先级：命令行 > config.yml > 内置默认值。

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};
use crate::download::models::{DownloadSettings, SplitSize};
use crate::download::plan::PlanOptions;
use crate::network_parser::network::{HubConfig, HubEndpoints};

pub const TOKEN_ENV: &str = "HF_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Hub 配置
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub hf_token: String,

    // aria2 配置
    #[serde(default = "default_aria2_path")]
    pub aria2_path: String,
    #[serde(default = "default_parallelism")]
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_parallelism")]
    pub max_connection_per_server: u32,
    #[serde(default = "default_min_split_size")]
    pub min_split_size: String,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u32,

    // 产物路径
    #[serde(default = "default_urls_file")]
    pub urls_file: String,
    #[serde(default = "default_aria2_log_file")]
    pub aria2_log_file: String,

    // 附属文件
    #[serde(default = "default_false")]
    pub include_auxiliary: bool,
    #[serde(default = "default_auxiliary_max_bytes")]
    pub auxiliary_max_bytes: u64,

    // 日志
    #[serde(default = "default_false")]
    pub archive_logs_on_exit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            revision: default_revision(),
            request_timeout: default_request_timeout(),
            hf_token: String::new(),
            aria2_path: default_aria2_path(),
            max_concurrent_downloads: default_parallelism(),
            max_connection_per_server: default_parallelism(),
            min_split_size: default_min_split_size(),
            max_tries: default_max_tries(),
            retry_wait: default_retry_wait(),
            urls_file: default_urls_file(),
            aria2_log_file: default_aria2_log_file(),
            include_auxiliary: default_false(),
            auxiliary_max_bytes: default_auxiliary_max_bytes(),
            archive_logs_on_exit: default_false(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 15] = [
            FieldMeta {
                name: "endpoint",
                description: "Hugging Face Hub 地址（可换成镜像站）",
            },
            FieldMeta {
                name: "revision",
                description: "默认下载的分支 / tag / commit",
            },
            FieldMeta {
                name: "request_timeout",
                description: "文件列表请求超时时间（秒）",
            },
            FieldMeta {
                name: "hf_token",
                description: "访问受限仓库的 token，留空时读取环境变量 HF_TOKEN",
            },
            FieldMeta {
                name: "aria2_path",
                description: "aria2c 可执行文件路径",
            },
            FieldMeta {
                name: "max_concurrent_downloads",
                description: "同时下载的文件数",
            },
            FieldMeta {
                name: "max_connection_per_server",
                description: "单个文件的最大连接数（同时作为 --split）",
            },
            FieldMeta {
                name: "min_split_size",
                description: "最小分块大小，范围 1M..1024M",
            },
            FieldMeta {
                name: "max_tries",
                description: "aria2c 单个文件的最大尝试次数",
            },
            FieldMeta {
                name: "retry_wait",
                description: "aria2c 重试间隔（秒）",
            },
            FieldMeta {
                name: "urls_file",
                description: "aria2 输入文件名（相对路径基于数据目录）",
            },
            FieldMeta {
                name: "aria2_log_file",
                description: "aria2 日志文件名（相对路径基于数据目录）",
            },
            FieldMeta {
                name: "include_auxiliary",
                description: "是否同时下载 config / tokenizer 等附属小文件",
            },
            FieldMeta {
                name: "auxiliary_max_bytes",
                description: "附属文件大小上限（字节），超过则跳过",
            },
            FieldMeta {
                name: "archive_logs_on_exit",
                description: "退出时是否把 logs/latest.log 打包为 zip",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_downloads == 0 {
            return Err("max_concurrent_downloads 必须大于 0".to_string());
        }
        if self.max_connection_per_server == 0 || self.max_connection_per_server > 16 {
            return Err("max_connection_per_server 必须在 1..=16 之间".to_string());
        }
        if self.max_tries == 0 {
            return Err("max_tries 必须大于 0".to_string());
        }
        self.min_split_size.parse::<SplitSize>()?;
        if self.aria2_path.trim().is_empty() {
            return Err("aria2_path 不能为空".to_string());
        }
        Ok(())
    }
}

/// 命令行对下载参数的覆盖值，未指定的字段沿用配置文件。
#[derive(Debug, Clone, Default)]
pub struct DownloadOverrides {
    pub aria2_path: Option<String>,
    pub max_concurrent_downloads: Option<u32>,
    pub max_connection_per_server: Option<u32>,
    pub min_split_size: Option<SplitSize>,
}

impl Config {
    /// 配置中的 token 优先，其次是环境变量 `HF_TOKEN`。
    pub fn auth_token(&self) -> Option<String> {
        resolve_token(&self.hf_token, env::var(TOKEN_ENV).ok())
    }

    pub fn hub_config(&self, revision: Option<&str>) -> anyhow::Result<HubConfig> {
        let revision = revision.unwrap_or(&self.revision);
        Ok(HubConfig {
            endpoints: HubEndpoints::new(&self.endpoint, revision)?,
            request_timeout: Duration::from_secs(self.request_timeout.max(1)),
            token: self.auth_token(),
            user_agent: format!("hf-shard-downloader/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn download_settings(
        &self,
        overrides: &DownloadOverrides,
        data_dir: &Path,
    ) -> Result<DownloadSettings, String> {
        let min_split_size = match overrides.min_split_size {
            Some(size) => size,
            None => self.min_split_size.parse()?,
        };
        Ok(DownloadSettings {
            aria2_path: overrides
                .aria2_path
                .clone()
                .unwrap_or_else(|| self.aria2_path.clone()),
            max_concurrent_downloads: overrides
                .max_concurrent_downloads
                .unwrap_or(self.max_concurrent_downloads),
            max_connection_per_server: overrides
                .max_connection_per_server
                .unwrap_or(self.max_connection_per_server),
            min_split_size,
            max_tries: self.max_tries,
            retry_wait_secs: self.retry_wait,
            urls_file: under_data_dir(data_dir, &self.urls_file),
            aria2_log_file: under_data_dir(data_dir, &self.aria2_log_file),
            auth_token: self.auth_token(),
        })
    }

    pub fn plan_options(&self, with_auxiliary: bool) -> PlanOptions {
        PlanOptions {
            include_auxiliary: with_auxiliary || self.include_auxiliary,
            auxiliary_max_bytes: self.auxiliary_max_bytes,
        }
    }
}

fn resolve_token(configured: &str, from_env: Option<String>) -> Option<String> {
    let configured = configured.trim();
    if !configured.is_empty() {
        return Some(configured.to_string());
    }
    from_env
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn under_data_dir(data_dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

fn default_false() -> bool {
    false
}

fn default_endpoint() -> String {
    "https://huggingface.co".to_string()
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_aria2_path() -> String {
    "aria2c".to_string()
}

fn default_parallelism() -> u32 {
    16
}

fn default_min_split_size() -> String {
    "1M".to_string()
}

fn default_max_tries() -> u32 {
    5
}

fn default_retry_wait() -> u32 {
    10
}

fn default_urls_file() -> String {
    "aria2_urls.txt".to_string()
}

fn default_aria2_log_file() -> String {
    "aria2_download.log".to_string()
}

fn default_auxiliary_max_bytes() -> u64 {
    10 * 1024 * 1024
}
