//! 下载相关的数据模型定义。
//!
//! 包含仓库引用、文件列表、分片模式、下载计划、aria2 参数与任务状态等核心数据结构。

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use super::template::Template;

/// 远程仓库 `owner/name`。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn parse(repo_id: &str) -> Option<Self> {
        let (owner, name) = repo_id.trim().trim_matches('/').split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepositoryRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("仓库 ID 应为 owner/name 形式，实际为 '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    #[serde(other)]
    Other,
}

/// tree 接口返回的单个条目。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoFile {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

impl RepoFile {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            path: path.into(),
            size,
        }
    }
}

/// 某次查询得到的仓库文件快照。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListing {
    pub files: Vec<RepoFile>,
}

impl FileListing {
    pub fn new(files: Vec<RepoFile>) -> Self {
        Self { files }
    }

    #[cfg(test)]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(|n| RepoFile::file(n, 0)).collect())
    }

    /// 仅返回普通文件的路径，目录条目会被跳过。
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|f| f.kind == EntryKind::File)
            .map(|f| f.path.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.file_names().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.file_names().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSpec {
    pub template: Template,
    pub num_files: u32,
    pub start_index: u32,
}

impl PatternSpec {
    /// 按序号升序展开 `[start_index, start_index + num_files)`。
    pub fn filenames(&self) -> Vec<String> {
        (self.start_index..self.start_index.saturating_add(self.num_files))
            .map(|i| self.template.render(i, self.num_files))
            .collect()
    }
}

/// 用户指定的覆盖值，每个字段独立可空；解析顺序为 用户 > 自动探测 > 默认值。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternOverrides {
    pub template: Option<String>,
    pub num_files: Option<u32>,
    pub start_index: Option<u32>,
}

impl PatternOverrides {
    pub fn is_complete(&self) -> bool {
        self.template.is_some() && self.num_files.is_some() && self.start_index.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    /// 仓库内相对路径，同时也是 `out=` 指令的值。
    pub name: String,
    pub url: String,
    pub local_path: PathBuf,
    pub auxiliary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    pub repo: RepositoryRef,
    pub output_dir: PathBuf,
    pub pattern: PatternSpec,
    pub entries: Vec<PlanEntry>,
}

impl DownloadPlan {
    pub fn shard_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.auxiliary).count()
    }
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// aria2 `--min-split-size`，以字节保存，合法范围 1M..=1024M。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSize(u64);

impl SplitSize {
    pub const MIN: SplitSize = SplitSize(MIB);
    pub const MAX: SplitSize = SplitSize(1024 * MIB);

    #[cfg(test)]
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl Default for SplitSize {
    fn default() -> Self {
        Self::MIN
    }
}

impl FromStr for SplitSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (digits, unit) = match trimmed.char_indices().last() {
            Some((pos, c)) if c.is_ascii_alphabetic() => (&trimmed[..pos], c.to_ascii_uppercase()),
            _ => (trimmed, 'B'),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("无效的分块大小 '{s}'，示例: 1M、512K"))?;
        let bytes = match unit {
            'B' => Some(value),
            'K' => value.checked_mul(KIB),
            'M' => value.checked_mul(MIB),
            'G' => value.checked_mul(1024 * MIB),
            _ => return Err(format!("无效的分块大小单位 '{unit}'，仅支持 K/M/G")),
        }
        .ok_or_else(|| format!("分块大小 '{s}' 溢出"))?;
        if !(Self::MIN.0..=Self::MAX.0).contains(&bytes) {
            return Err(format!("分块大小 '{s}' 超出 aria2 允许的 1M..1024M 范围"));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for SplitSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % MIB == 0 {
            write!(f, "{}M", self.0 / MIB)
        } else if self.0 % KIB == 0 {
            write!(f, "{}K", self.0 / KIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// 传给 aria2c 的并发、重试与产物路径参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub aria2_path: String,
    pub max_concurrent_downloads: u32,
    pub max_connection_per_server: u32,
    pub min_split_size: SplitSize,
    pub max_tries: u32,
    pub retry_wait_secs: u32,
    pub urls_file: PathBuf,
    pub aria2_log_file: PathBuf,
    pub auth_token: Option<String>,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            aria2_path: "aria2c".to_string(),
            max_concurrent_downloads: 16,
            max_connection_per_server: 16,
            min_split_size: SplitSize::default(),
            max_tries: 5,
            retry_wait_secs: 10,
            urls_file: PathBuf::from("aria2_urls.txt"),
            aria2_log_file: PathBuf::from("aria2_download.log"),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    Running,
    Succeeded,
    Failed { code: i32 },
    Interrupted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::NotStarted | TaskState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    pub total: usize,
    pub existing: usize,
    pub completed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repository_ref() {
        let repo = RepositoryRef::parse("deepseek-ai/DeepSeek-R1").unwrap();
        assert_eq!(repo.owner, "deepseek-ai");
        assert_eq!(repo.name, "DeepSeek-R1");
        assert_eq!(repo.id(), "deepseek-ai/DeepSeek-R1");

        assert!(RepositoryRef::parse("no-slash").is_none());
        assert!(RepositoryRef::parse("/name").is_none());
        assert!(RepositoryRef::parse("a/b/c").is_none());
        assert!("owner/".parse::<RepositoryRef>().is_err());
    }

    #[test]
    fn listing_skips_directories() {
        let listing = FileListing::new(vec![
            RepoFile::file("config.json", 10),
            RepoFile {
                kind: EntryKind::Directory,
                path: "original".to_string(),
                size: 0,
            },
        ]);
        assert_eq!(listing.file_names().collect::<Vec<_>>(), vec!["config.json"]);
        assert_eq!(listing.len(), 1);
        assert!(!listing.is_empty());
        assert!(FileListing::default().is_empty());
    }

    #[test]
    fn repo_file_deserializes_tree_entry() {
        let raw = r#"[
            {"type":"file","oid":"abc","size":1519,"path":".gitattributes"},
            {"type":"directory","oid":"def","size":0,"path":"original"},
            {"type":"submodule","oid":"ghi","path":"vendor"}
        ]"#;
        let files: Vec<RepoFile> = serde_json::from_str(raw).unwrap();
        assert_eq!(files[0], RepoFile::file(".gitattributes", 1519));
        assert_eq!(files[1].kind, EntryKind::Directory);
        assert_eq!(files[2].kind, EntryKind::Other);
        assert_eq!(files[2].size, 0);
    }

    #[test]
    fn split_size_parses_aria2_units() {
        assert_eq!("1M".parse::<SplitSize>().unwrap(), SplitSize::default());
        assert_eq!("1024K".parse::<SplitSize>().unwrap().bytes(), MIB);
        assert_eq!("20m".parse::<SplitSize>().unwrap().to_string(), "20M");
        assert_eq!("1536K".parse::<SplitSize>().unwrap().to_string(), "1536K");
        assert_eq!("1G".parse::<SplitSize>().unwrap(), SplitSize::MAX);

        assert!("0M".parse::<SplitSize>().is_err());
        assert!("512K".parse::<SplitSize>().is_err());
        assert!("2G".parse::<SplitSize>().is_err());
        assert!("12X".parse::<SplitSize>().is_err());
        assert!("".parse::<SplitSize>().is_err());
    }

    #[test]
    fn pattern_spec_expands_in_order() {
        let spec = PatternSpec {
            template: Template::parse("model.safetensors.{i:02d}").unwrap(),
            num_files: 4,
            start_index: 0,
        };
        assert_eq!(
            spec.filenames(),
            vec![
                "model.safetensors.00",
                "model.safetensors.01",
                "model.safetensors.02",
                "model.safetensors.03"
            ]
        );
    }

    #[test]
    fn task_state_terminality() {
        assert!(!TaskState::NotStarted.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed { code: 1 }.is_terminal());
        assert!(TaskState::Interrupted.is_terminal());
    }
}
