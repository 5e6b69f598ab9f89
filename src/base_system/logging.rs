//! 日志系统：控制台 + `logs/latest.log` 双通道输出，过大日志启动时打包，
//! 并负责 Ctrl-C 与 panic 时的收尾。

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{io, panic, thread, time::Duration};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const LOG_FILE_NAME: &str = "latest.log";
const ROTATE_THRESHOLD: u64 = 10 * 1024 * 1024;
const FLUSH_GRACE: Duration = Duration::from_millis(300);
const SECOND_INTERRUPT_EXIT_CODE: i32 = 130;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("全局日志订阅器已被注册")]
    AlreadyInitialized,
    #[error("注册日志订阅器失败: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("日志文件读写失败: {0}")]
    Io(#[from] io::Error),
    #[error("打包日志失败: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("生成归档时间戳失败: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Debug)]
pub struct LogOptions {
    /// 控制台输出 DEBUG 级别
    pub debug: bool,
    pub use_color: bool,
    /// 退出时把 latest.log 打包为 zip
    pub archive_on_exit: bool,
    pub console: bool,
    pub logs_dir: PathBuf,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            use_color: true,
            archive_on_exit: false,
            console: true,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

/// 持有日志写线程与中断标志；drop 时完成收尾。
pub struct LogSystem {
    shared: Arc<Shared>,
}

struct Shared {
    logs_dir: PathBuf,
    log_file: PathBuf,
    writer_guard: Mutex<Option<WorkerGuard>>,
    finished: AtomicBool,
    interrupted: Arc<AtomicBool>,
    archive_on_exit: bool,
}

impl LogSystem {
    pub fn init(options: LogOptions) -> Result<Self, LogError> {
        let logs_dir = options.logs_dir.clone();
        fs::create_dir_all(&logs_dir)?;
        let log_file = logs_dir.join(LOG_FILE_NAME);
        rotate_oversized(&log_file, &logs_dir)?;

        let (file_writer, writer_guard) = NonBlockingBuilder::default()
            .lossy(false)
            .finish(rolling::never(&logs_dir, LOG_FILE_NAME));
        install_subscriber(&options, file_writer)?;

        let shared = Arc::new(Shared {
            logs_dir,
            log_file,
            writer_guard: Mutex::new(Some(writer_guard)),
            finished: AtomicBool::new(false),
            interrupted: Arc::new(AtomicBool::new(false)),
            archive_on_exit: options.archive_on_exit,
        });
        shared.watch_ctrl_c();
        shared.watch_panics();

        Ok(Self { shared })
    }

    /// Ctrl-C 标志。aria2c 与本进程同属前台进程组，会自行收到 SIGINT 并退出，
    /// 这里只记录中断，由下载流程据此区分“中断”与“失败”。
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.interrupted)
    }

    /// 刷新日志并按配置打包；可重复调用，只执行一次。
    pub fn safe_exit(&self) {
        self.shared.finish();
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.shared.finish();
    }
}

fn install_subscriber(options: &LogOptions, file_writer: NonBlocking) -> Result<(), LogError> {
    let console_level = if options.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let console_writer = if options.console {
        BoxMakeWriter::new(io::stdout)
    } else {
        BoxMakeWriter::new(io::sink)
    };

    // aria2 原始输出已由进度模块直接回显，控制台不再重复
    let console = fmt::layer()
        .with_target(false)
        .with_ansi(options.use_color)
        .with_writer(console_writer)
        .with_filter(
            Targets::new()
                .with_default(console_level)
                .with_target("aria2", LevelFilter::OFF),
        );

    let file = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| {
            if e.to_string().contains("already") {
                LogError::AlreadyInitialized
            } else {
                LogError::SubscriberInit(e)
            }
        })
}

impl Shared {
    fn watch_ctrl_c(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let registered = ctrlc::set_handler(move || {
            if shared.interrupted.swap(true, Ordering::SeqCst) {
                // 第二次 Ctrl-C：不再等待 aria2c
                shared.finish();
                std::process::exit(SECOND_INTERRUPT_EXIT_CODE);
            }
            warn!(target: "startup", "收到中断信号，等待 aria2c 退出（再次按 Ctrl-C 立即退出）");
        });
        if let Err(err) = registered {
            warn!(target: "startup", error = %err, "无法注册 Ctrl-C 处理器");
        }
    }

    fn watch_panics(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            error!(target: "startup", %location, "程序崩溃: {info}");
            shared.finish();
            default_hook(info);
        }));
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.writer_guard.lock() {
            guard.take();
        }
        if !self.archive_on_exit {
            return;
        }
        thread::sleep(FLUSH_GRACE);
        if let Err(err) = zip_log(&self.log_file, &self.logs_dir) {
            eprintln!("打包日志失败: {err}");
        }
    }
}

fn rotate_oversized(log_file: &Path, logs_dir: &Path) -> Result<(), LogError> {
    let oversized = fs::metadata(log_file).is_ok_and(|m| m.len() >= ROTATE_THRESHOLD);
    if oversized {
        zip_log(log_file, logs_dir)?;
    }
    Ok(())
}

/// 把日志压缩为 `log_<时间戳>.zip` 并删除原文件；空文件直接删除。
fn zip_log(log_file: &Path, logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let size = match fs::metadata(log_file) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if size == 0 {
        let _ = fs::remove_file(log_file);
        return Ok(None);
    }

    let stamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let archive = unique_archive_path(logs_dir, &stamp);

    {
        let mut writer = zip::ZipWriter::new(File::create(&archive)?);
        writer.start_file(
            format!("{stamp}.log"),
            FileOptions::default().compression_method(CompressionMethod::Deflated),
        )?;
        io::copy(&mut File::open(log_file)?, &mut writer)?;
        writer.finish()?;
    }
    let _ = fs::remove_file(log_file);

    info!(target: "startup", archive = %archive.display(), "日志已打包");
    Ok(Some(archive))
}

/// 同一秒内多次打包时追加序号，避免覆盖。
fn unique_archive_path(logs_dir: &Path, stamp: &str) -> PathBuf {
    let first = logs_dir.join(format!("log_{stamp}.zip"));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| logs_dir.join(format!("log_{stamp}_{n}.zip")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn archives_non_empty_log_into_zip() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LOG_FILE_NAME);
        fs::write(&latest, "INFO listing: 共 163 个文件\n").unwrap();

        let archive = zip_log(&latest, dir.path()).unwrap().unwrap();
        assert!(!latest.exists());

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut content = String::new();
        zip.by_index(0).unwrap().read_to_string(&mut content).unwrap();
        assert!(content.contains("163"));
    }

    #[test]
    fn empty_or_missing_log_is_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LOG_FILE_NAME);
        assert!(zip_log(&latest, dir.path()).unwrap().is_none());

        fs::write(&latest, "").unwrap();
        assert!(zip_log(&latest, dir.path()).unwrap().is_none());
        assert!(!latest.exists());
    }

    #[test]
    fn small_log_is_kept_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join(LOG_FILE_NAME);
        fs::write(&latest, "short").unwrap();
        rotate_oversized(&latest, dir.path()).unwrap();
        assert!(latest.exists());
    }

    #[test]
    fn archive_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_archive_path(dir.path(), "20261019_120000");
        File::create(&first).unwrap();
        let second = unique_archive_path(dir.path(), "20261019_120000");
        assert_ne!(first, second);
        assert!(second.ends_with("log_20261019_120000_1.zip"));
    }
}
