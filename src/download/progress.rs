//! aria2c 输出转发与 CLI 进度条管理。
//!
//! 进度条画在 stderr 上；转发的 aria2c 输出按原来的流写回，stdout 行仍走 stdout。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use regex::Regex;
use tracing::debug;

static RE_COMPLETE: OnceLock<Regex> = OnceLock::new();

fn re_complete() -> &'static Regex {
    RE_COMPLETE.get_or_init(|| {
        Regex::new(r"Download complete: (?P<path>.+?)\s*$").expect("compile RE_COMPLETE")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

/// 两个管道读取线程共享同一个 reporter，因此全部方法只需 `&self`。
pub(crate) struct ProgressReporter {
    bar: ProgressBar,
    completed: AtomicUsize,
}

impl ProgressReporter {
    pub(crate) fn new(total: usize) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} 个文件",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        bar.set_style(style);
        bar.set_prefix("文件下载");
        Self::with_bar(bar)
    }

    #[cfg(test)]
    pub(crate) fn hidden(total: usize) -> Self {
        Self::with_bar(ProgressBar::with_draw_target(
            Some(total as u64),
            ProgressDrawTarget::hidden(),
        ))
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            completed: AtomicUsize::new(0),
        }
    }

    /// 转发一行 aria2c 输出：写入终端与执行日志，并根据完成通知推进进度条。
    pub(crate) fn forward(&self, stream: StreamKind, raw: &str) {
        // 非终端输出时 aria2 仍可能用 '\r' 刷新同一行，只保留最后一段。
        let Some(line) = raw
            .split('\r')
            .map(str::trim_end)
            .filter(|s| !s.trim().is_empty())
            .last()
        else {
            return;
        };

        debug!(target: "aria2", ?stream, "{line}");
        // 暂停进度条再输出，aria2 的 stdout / stderr 保持各自的流，重定向不受影响
        self.bar.suspend(|| echo(stream, line));

        if completed_path(line).is_some() {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.bar.inc(1);
        }
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn echo(stream: StreamKind, line: &str) {
    match stream {
        StreamKind::Stdout => println!("{line}"),
        StreamKind::Stderr => eprintln!("{line}"),
    }
}

pub(crate) fn completed_path(line: &str) -> Option<&str> {
    re_complete()
        .captures(line)
        .and_then(|caps| caps.name("path"))
        .map(|m| m.as_str())
}
