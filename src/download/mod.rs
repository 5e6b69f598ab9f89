//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`    ：数据模型（RepositoryRef / PatternSpec / DownloadPlan 等）
//! - `template`  ：分片文件名模板解析与渲染
//! - `pattern`   ：根据仓库文件列表自动识别分片命名规律
//! - `plan`      ：合并用户参数与识别结果，生成下载计划
//! - `progress`  ：aria2c 输出转发与 CLI 进度条
//! - `downloader`：aria2c 输入文件生成与进程执行
//! - `error`     ：各阶段错误分类

pub mod downloader;
pub mod error;
pub mod models;
pub mod pattern;
pub mod plan;
pub(crate) mod progress;
pub mod template;
