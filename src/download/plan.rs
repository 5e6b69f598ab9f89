//! 下载计划准备。
//!
//! 合并用户覆盖值与自动探测结果（用户 > 探测 > 默认），再把模板展开成
//! (下载地址, 本地路径) 列表，生成不可变的 `DownloadPlan`。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::network_parser::network::{HubEndpoints, RepoLister};

use super::error::{FetchError, FetchResult};
use super::models::{
    DownloadPlan, EntryKind, FileListing, PatternOverrides, PatternSpec, PlanEntry, RepositoryRef,
};
use super::pattern::{WEIGHT_EXTENSIONS, detect_pattern};
use super::template::Template;

/// 不随模型下载的附属文件（文档、git 元数据、其它框架的权重）。
const IGNORED_AUXILIARY: &[&str] = &[
    "README.md",
    "readme.md",
    "LICENSE",
    "license",
    "LICENSE.txt",
    "license.txt",
    ".gitattributes",
    ".gitignore",
    "flax_model.msgpack",
    "rust_model.ot",
    "tf_model.h5",
];

/// 单个计划允许的最大分片数。
const MAX_FILES: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// 额外下载配置、tokenizer 等小文件。
    pub include_auxiliary: bool,
    pub auxiliary_max_bytes: u64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            include_auxiliary: false,
            auxiliary_max_bytes: 10 * 1024 * 1024,
        }
    }
}

pub fn prepare_download_plan(
    repo: &RepositoryRef,
    overrides: &PatternOverrides,
    output_dir: Option<&Path>,
    options: PlanOptions,
    lister: &dyn RepoLister,
    endpoints: &HubEndpoints,
) -> FetchResult<DownloadPlan> {
    info!(target: "plan", repo = %repo, "准备下载计划");

    // 用户模板先行校验，避免无效输入也去请求网络。
    let user_template = overrides
        .template
        .as_deref()
        .map(Template::parse)
        .transpose()?;
    if overrides.num_files == Some(0) {
        return Err(zero_files(overrides.template.as_deref().unwrap_or("")));
    }

    let listing = if !overrides.is_complete() || options.include_auxiliary {
        Some(lister.list_files(repo)?)
    } else {
        debug!(target: "plan", "模板、数量、起始序号均已指定，跳过文件列表请求");
        None
    };

    let pattern = resolve_pattern(overrides, user_template, listing.as_ref())?;
    let output_dir = output_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&repo.name));

    let mut entries = expand_entries(repo, &pattern, &output_dir, endpoints);
    if options.include_auxiliary
        && let Some(listing) = listing.as_ref()
    {
        let extra: Vec<PlanEntry> = {
            let shards: HashSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
            select_auxiliary(listing, options.auxiliary_max_bytes)
                .filter(|name| !shards.contains(name))
                .map(|name| PlanEntry {
                    name: name.to_string(),
                    url: endpoints.resolve_url(repo, name),
                    local_path: output_dir.join(name),
                    auxiliary: true,
                })
                .collect()
        };
        debug!(target: "plan", count = extra.len(), "追加附属文件");
        entries.extend(extra);
    }

    info!(
        target: "plan",
        template = %pattern.template,
        width = pattern.template.width(),
        num_files = pattern.num_files,
        start_index = pattern.start_index,
        output_dir = %output_dir.display(),
        entries = entries.len(),
        "下载计划已生成"
    );

    Ok(DownloadPlan {
        repo: repo.clone(),
        output_dir,
        pattern,
        entries,
    })
}

/// 逐字段合并：用户值优先，缺失字段才使用探测结果。
fn resolve_pattern(
    overrides: &PatternOverrides,
    user_template: Option<Template>,
    listing: Option<&FileListing>,
) -> FetchResult<PatternSpec> {
    let (template, num_files, start_index) =
        match (user_template, overrides.num_files, overrides.start_index) {
            (Some(template), Some(num_files), Some(start_index)) => {
                (template, num_files, start_index)
            }
            (template, num_files, start_index) => {
                let empty = FileListing::default();
                let detected = detect_pattern(listing.unwrap_or(&empty))?;
                if template.is_some() {
                    debug!(
                        target: "plan",
                        detected = %detected.template,
                        "使用用户指定的模板，探测结果仅用于补全数量/起始序号"
                    );
                }
                (
                    template.unwrap_or(detected.template),
                    num_files.unwrap_or(detected.num_files),
                    start_index.unwrap_or(detected.start_index),
                )
            }
        };

    if num_files == 0 {
        return Err(zero_files(template.as_str()));
    }
    if num_files > MAX_FILES {
        return Err(FetchError::invalid_pattern(
            template.as_str(),
            format!("文件数量 {num_files} 超过上限 {MAX_FILES}"),
        ));
    }
    if start_index.checked_add(num_files).is_none() {
        return Err(FetchError::invalid_pattern(
            template.as_str(),
            format!("起始序号 {start_index} 加文件数量 {num_files} 超出 u32 范围"),
        ));
    }
    Ok(PatternSpec {
        template,
        num_files,
        start_index,
    })
}

fn zero_files(template: &str) -> FetchError {
    FetchError::invalid_pattern(template, "文件数量必须大于 0")
}

/// 按序号升序展开，每个序号对应一条 (URL, 本地路径)。
pub fn expand_entries(
    repo: &RepositoryRef,
    pattern: &PatternSpec,
    output_dir: &Path,
    endpoints: &HubEndpoints,
) -> Vec<PlanEntry> {
    pattern
        .filenames()
        .into_iter()
        .map(|name| PlanEntry {
            url: endpoints.resolve_url(repo, &name),
            local_path: output_dir.join(&name),
            name,
            auxiliary: false,
        })
        .collect()
}

pub(crate) fn is_weight_file(path: &str) -> bool {
    WEIGHT_EXTENSIONS.iter().any(|ext| {
        let dotted = format!(".{ext}");
        path.ends_with(&dotted)
            || path.rsplit_once(&format!("{dotted}.")).is_some_and(|(_, tail)| {
                !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())
            })
    })
}

fn select_auxiliary(listing: &FileListing, max_bytes: u64) -> impl Iterator<Item = &str> {
    listing
        .files
        .iter()
        .filter(|f| f.kind == EntryKind::File)
        .filter(move |f| f.size <= max_bytes)
        .map(|f| f.path.as_str())
        .filter(|path: &&str| !is_weight_file(path))
        .filter(|path: &&str| {
            let path: &str = path;
            let base = path.rsplit('/').next().unwrap_or(path);
            !IGNORED_AUXILIARY.contains(&base)
        })
}
