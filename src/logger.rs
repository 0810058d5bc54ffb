//! 日志初始化: 终端 + 按日期命名、按大小轮转的日志文件
//!
//! 目标 (target) 约定:
//! - `system`: 系统事件
//! - `user`: 用户操作

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// 单个日志文件上限
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
/// 超过上限后保留的旧文件数 (`.1` .. `.5`)
pub const LOG_BACKUPS: usize = 5;

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

fn file_for_day(logs_dir: &Path, day: &str) -> PathBuf {
    logs_dir.join(format!("yolocount_{}.log", day))
}

fn backup_path(base: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", base.display(), n))
}

/// 按日期命名, 超过大小上限时轮转的日志文件
struct DailyFile {
    dir: PathBuf,
    day: String,
    file: Option<File>,
    written: u64,
    max_bytes: u64,
}

impl DailyFile {
    fn open(dir: &Path, day: String, max_bytes: u64) -> io::Result<Self> {
        let mut daily = Self {
            dir: dir.to_path_buf(),
            day,
            file: None,
            written: 0,
            max_bytes,
        };
        daily.reopen()?;
        Ok(daily)
    }

    fn path(&self) -> PathBuf {
        file_for_day(&self.dir, &self.day)
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(self.path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// `name.log` → `name.log.1` → ... → `name.log.5`, 最旧的丢弃
    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        let base = self.path();
        let _ = fs::remove_file(backup_path(&base, LOG_BACKUPS));
        for n in (1..LOG_BACKUPS).rev() {
            let from = backup_path(&base, n);
            if from.exists() {
                fs::rename(&from, backup_path(&base, n + 1))?;
            }
        }
        fs::rename(&base, backup_path(&base, 1))?;
        self.reopen()
    }

    fn write_record(&mut self, buf: &[u8], day: &str) -> io::Result<()> {
        if day != self.day {
            self.day = day.to_string();
            self.reopen()?;
        } else if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        if self.file.is_none() {
            self.reopen()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("日志文件未打开"))?;
        file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 同时写入 stderr 和日志文件
struct Tee {
    daily: DailyFile,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.daily.write_record(buf, &today())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.daily.flush()
    }
}

/// 当天的日志文件路径
pub fn log_file_path(logs_dir: &Path) -> PathBuf {
    file_for_day(logs_dir, &today())
}

/// 初始化全局日志, 返回日志文件路径
///
/// `RUST_LOG` 优先; 否则默认 `info`, `verbose` 时为 `debug`
pub fn init(logs_dir: &Path, verbose: bool) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("无法创建日志目录 {}", logs_dir.display()))?;
    let daily = DailyFile::open(logs_dir, today(), MAX_LOG_BYTES)
        .with_context(|| format!("无法打开日志文件 {}", log_file_path(logs_dir).display()))?;
    let path = daily.path();

    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(Tee { daily })))
        .try_init()
        .context("日志系统已初始化")?;

    Ok(path)
}

/// 记录用户操作
pub fn log_user_action(user: &str, action: &str) {
    log::info!(target: "user", "👤 {} - {}", user, action);
}

/// 记录系统事件
pub fn log_system_event(event: &str) {
    log::info!(target: "system", "⚙️ {}", event);
}
