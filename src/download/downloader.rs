//! aria2c 下载执行。
//!
//! 把 `DownloadPlan` 写成 aria2 的批量输入文件，按并发参数启动 aria2c，
//! 实时转发其输出并根据退出状态给出结果。断点续传完全交给 aria2c 自身
//! （`--continue=true` + `.aria2` 控制文件），这里不做跳过或重试。

use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, error, info, warn};

use super::error::{FetchError, FetchResult};
use super::models::{DownloadPlan, DownloadSettings, TaskOutcome, TaskState};
use super::progress::{ProgressReporter, StreamKind};

/// 执行 `<aria2c> --version`，返回版本行。
pub fn check_tool(binary: &str) -> FetchResult<String> {
    let missing = |message: String| FetchError::ExternalToolMissing {
        binary: binary.to_string(),
        message,
    };
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| missing(e.to_string()))?;
    if !output.status.success() {
        return Err(missing(format!("--version 退出状态 {}", output.status)));
    }
    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    Ok(version)
}

/// aria2 `--input-file` 语法：一行 URL，随后缩进的 `out=` 指令。
pub fn render_input_file(plan: &DownloadPlan) -> String {
    let mut out = String::new();
    for entry in &plan.entries {
        out.push_str(&entry.url);
        out.push('\n');
        out.push_str("  out=");
        out.push_str(&entry.name);
        out.push('\n');
    }
    out
}

pub fn write_input_file(plan: &DownloadPlan, path: &Path) -> FetchResult<()> {
    fs::write(path, render_input_file(plan)).map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn build_command(plan: &DownloadPlan, settings: &DownloadSettings) -> Command {
    let mut cmd = Command::new(&settings.aria2_path);
    cmd.arg("--input-file")
        .arg(&settings.urls_file)
        .arg("--dir")
        .arg(&plan.output_dir)
        .arg(format!(
            "--max-concurrent-downloads={}",
            settings.max_concurrent_downloads
        ))
        .arg(format!(
            "--max-connection-per-server={}",
            settings.max_connection_per_server
        ))
        .arg(format!("--split={}", settings.max_connection_per_server))
        .arg(format!("--min-split-size={}", settings.min_split_size))
        .arg("--continue=true")
        .arg(format!("--max-tries={}", settings.max_tries))
        .arg(format!("--retry-wait={}", settings.retry_wait_secs))
        .arg("--auto-file-renaming=false")
        .arg("--log")
        .arg(&settings.aria2_log_file)
        .arg("--log-level=notice")
        .arg("--console-log-level=notice")
        .arg("--summary-interval=1")
        .arg("--download-result=full");
    if let Some(token) = settings.auth_token.as_deref() {
        cmd.arg(format!("--header=Authorization: Bearer {token}"));
    }
    cmd
}

/// 日志里展示的命令行，隐藏鉴权头。
fn describe_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    for arg in cmd.get_args() {
        let arg = arg.to_string_lossy();
        if arg.starts_with("--header=Authorization") {
            parts.push("--header=Authorization: Bearer ***".to_string());
        } else {
            parts.push(arg.into_owned());
        }
    }
    parts.join(" ")
}

/// 已存在且非空的本地文件数，仅用于提示；这些文件仍会交给 aria2c 校验续传。
fn count_existing(plan: &DownloadPlan) -> usize {
    plan.entries
        .iter()
        .filter(|e| fs::metadata(&e.local_path).is_ok_and(|m| m.is_file() && m.len() > 0))
        .count()
}

pub struct DownloadTask<'a> {
    plan: &'a DownloadPlan,
    settings: &'a DownloadSettings,
    state: TaskState,
}

impl<'a> DownloadTask<'a> {
    pub fn new(plan: &'a DownloadPlan, settings: &'a DownloadSettings) -> Self {
        Self {
            plan,
            settings,
            state: TaskState::NotStarted,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    fn transition(&mut self, next: TaskState) {
        debug_assert!(!self.state.is_terminal(), "终态之后不应再变更");
        debug!(target: "download", from = ?self.state, to = ?next, "任务状态变更");
        self.state = next;
    }

    /// 阻塞运行 aria2c 直到退出。`interrupted` 由 Ctrl-C 处理器置位。
    pub fn run(&mut self, interrupted: &AtomicBool) -> FetchResult<TaskOutcome> {
        let version = check_tool(&self.settings.aria2_path)?;
        info!(target: "download", %version, "检测到 aria2c");

        let total = self.plan.entries.len();
        let existing = count_existing(self.plan);
        if existing > 0 {
            info!(
                target: "download",
                existing,
                total,
                "本地已有部分文件，交由 aria2c 校验并断点续传"
            );
        }

        write_input_file(self.plan, &self.settings.urls_file)?;
        info!(
            target: "download",
            urls_file = %self.settings.urls_file.display(),
            entries = total,
            "已写入 aria2 输入文件"
        );

        let mut cmd = build_command(self.plan, self.settings);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        info!(target: "download", command = %describe_command(&cmd), "启动 aria2c");

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                FetchError::ExternalToolMissing {
                    binary: self.settings.aria2_path.clone(),
                    message: e.to_string(),
                }
            }
            _ => FetchError::Io {
                path: self.settings.aria2_path.clone().into(),
                source: e,
            },
        })?;
        self.transition(TaskState::Running);

        let reporter = ProgressReporter::new(total);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let waited = thread::scope(|scope| {
            if let Some(out) = stdout {
                let reporter = &reporter;
                scope.spawn(move || pump_lines(out, StreamKind::Stdout, reporter));
            }
            if let Some(err) = stderr {
                let reporter = &reporter;
                scope.spawn(move || pump_lines(err, StreamKind::Stderr, reporter));
            }
            child.wait()
        });
        reporter.finish();

        let status = match waited {
            Ok(status) => status,
            Err(source) => {
                self.transition(TaskState::Failed { code: -1 });
                return Err(FetchError::Io {
                    path: self.settings.aria2_path.clone().into(),
                    source,
                });
            }
        };

        let outcome = TaskOutcome {
            total,
            existing,
            completed: reporter.completed(),
        };

        if status.success() {
            self.transition(TaskState::Succeeded);
            info!(
                target: "download",
                total,
                completed = outcome.completed,
                "aria2c 下载完成"
            );
            return Ok(outcome);
        }

        if interrupted.load(Ordering::SeqCst) {
            self.transition(TaskState::Interrupted);
            warn!(target: "download", "下载被中断，已下载的分块会在下次运行时续传");
            return Err(FetchError::Interrupted);
        }

        let code = exit_code(status);
        self.transition(TaskState::Failed { code });
        error!(
            target: "download",
            code,
            aria2_log = %self.settings.aria2_log_file.display(),
            "aria2c 异常退出"
        );
        Err(FetchError::DownloadFailed { code })
    }
}

fn pump_lines<R: Read>(reader: R, stream: StreamKind, reporter: &ProgressReporter) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => reporter.forward(stream, &String::from_utf8_lossy(&buf)),
            Err(e) => {
                debug!(target: "download", ?stream, error = %e, "读取 aria2c 输出失败");
                break;
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::{PatternSpec, PlanEntry, RepositoryRef};
    use crate::download::template::Template;
    use std::path::PathBuf;

    fn plan(output_dir: &Path) -> DownloadPlan {
        let names = ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"];
        DownloadPlan {
            repo: RepositoryRef::new("org", "model"),
            output_dir: output_dir.to_path_buf(),
            pattern: PatternSpec {
                template: Template::parse("model-{i:05d}-of-00002.safetensors").unwrap(),
                num_files: 2,
                start_index: 1,
            },
            entries: names
                .iter()
                .map(|name| PlanEntry {
                    name: name.to_string(),
                    url: format!("https://huggingface.co/org/model/resolve/main/{name}"),
                    local_path: output_dir.join(name),
                    auxiliary: false,
                })
                .collect(),
        }
    }

    fn settings(dir: &Path, aria2_path: &str) -> DownloadSettings {
        DownloadSettings {
            aria2_path: aria2_path.to_string(),
            urls_file: dir.join("aria2_urls.txt"),
            aria2_log_file: dir.join("aria2_download.log"),
            ..DownloadSettings::default()
        }
    }

    #[test]
    fn input_file_lists_url_then_out_directive() {
        let plan = plan(Path::new("model"));
        assert_eq!(
            render_input_file(&plan),
            "https://huggingface.co/org/model/resolve/main/model-00001-of-00002.safetensors\n  out=model-00001-of-00002.safetensors\n\
             https://huggingface.co/org/model/resolve/main/model-00002-of-00002.safetensors\n  out=model-00002-of-00002.safetensors\n"
        );
    }

    #[test]
    fn command_carries_tuning_flags() {
        let plan = plan(Path::new("model"));
        let mut settings = settings(Path::new("."), "aria2c");
        settings.max_concurrent_downloads = 4;
        settings.max_connection_per_server = 8;
        settings.min_split_size = "4M".parse().unwrap();
        settings.auth_token = Some("hf_secret".to_string());

        let cmd = build_command(&plan, &settings);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        for expected in [
            "--max-concurrent-downloads=4",
            "--max-connection-per-server=8",
            "--split=8",
            "--min-split-size=4M",
            "--continue=true",
            "--max-tries=5",
            "--retry-wait=10",
            "--header=Authorization: Bearer hf_secret",
        ] {
            assert!(args.iter().any(|a| a == expected), "missing {expected}");
        }
        let dir_pos = args.iter().position(|a| a == "--dir").unwrap();
        assert_eq!(args[dir_pos + 1], "model");

        let described = describe_command(&cmd);
        assert!(!described.contains("hf_secret"));
        assert!(described.starts_with("aria2c --input-file"));
    }

    #[test]
    fn counts_only_non_empty_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path());
        assert_eq!(count_existing(&plan), 0);
        fs::write(&plan.entries[0].local_path, b"partial").unwrap();
        fs::write(&plan.entries[1].local_path, b"").unwrap();
        assert_eq!(count_existing(&plan), 1);
    }

    #[test]
    fn missing_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path());
        let missing = dir.path().join("no-such-aria2c");
        let settings = settings(dir.path(), &missing.to_string_lossy());

        let mut task = DownloadTask::new(&plan, &settings);
        let err = task.run(&AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, FetchError::ExternalToolMissing { .. }));
        assert_eq!(task.state(), TaskState::NotStarted);
        assert!(!settings.urls_file.exists());
    }

    #[cfg(unix)]
    fn fake_aria2(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-aria2c");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 'aria2 version 1.37.0'; exit 0; fi\n{body}\n"
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn successful_run_counts_completions() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(&dir.path().join("model"));
        let aria2 = fake_aria2(
            dir.path(),
            "echo '[NOTICE] Download complete: model/model-00001-of-00002.safetensors'\n\
             echo '[NOTICE] Download complete: model/model-00002-of-00002.safetensors'\n\
             exit 0",
        );
        let settings = settings(dir.path(), &aria2.to_string_lossy());

        let mut task = DownloadTask::new(&plan, &settings);
        let outcome = task.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(outcome.total, 2);
        assert_eq!(outcome.completed, 2);
        assert_eq!(
            fs::read_to_string(&settings.urls_file).unwrap(),
            render_input_file(&plan)
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_surfaces_download_failed() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(&dir.path().join("model"));
        let aria2 = fake_aria2(dir.path(), "echo 'errorCode=1 network problem' >&2\nexit 1");
        let settings = settings(dir.path(), &aria2.to_string_lossy());

        let mut task = DownloadTask::new(&plan, &settings);
        let err = task.run(&AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, FetchError::DownloadFailed { code: 1 }));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(task.state(), TaskState::Failed { code: 1 });
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_flag_marks_task_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(&dir.path().join("model"));
        let aria2 = fake_aria2(dir.path(), "exit 7");
        let settings = settings(dir.path(), &aria2.to_string_lossy());

        let mut task = DownloadTask::new(&plan, &settings);
        let err = task.run(&AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, FetchError::Interrupted));
        assert_eq!(task.state(), TaskState::Interrupted);
    }

    #[cfg(unix)]
    #[test]
    fn existing_files_are_not_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("model");
        fs::create_dir_all(&out).unwrap();
        let plan = plan(&out);
        fs::write(&plan.entries[0].local_path, b"done").unwrap();
        let aria2 = fake_aria2(dir.path(), "exit 0");
        let settings = settings(dir.path(), &aria2.to_string_lossy());

        let outcome = DownloadTask::new(&plan, &settings)
            .run(&AtomicBool::new(false))
            .unwrap();
        assert_eq!(outcome.existing, 1);
        let written = fs::read_to_string(&settings.urls_file).unwrap();
        assert_eq!(written.matches("  out=").count(), 2);
    }
}
