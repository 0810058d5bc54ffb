//! 用户数据目录
//!
//! 默认位于系统配置目录下的 `YoloCount`, 其次 `~/.yolocount`,
//! 目录无法创建时退回当前目录

use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "YoloCount";
const HOME_DIR: &str = ".yolocount";

/// 应用数据路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// 解析数据目录, `override_dir` 优先
    pub fn resolve(override_dir: Option<&Path>) -> Self {
        let candidate = override_dir
            .map(Path::to_path_buf)
            .or_else(|| dirs::config_dir().map(|dir| dir.join(APP_DIR)))
            .or_else(|| dirs::home_dir().map(|dir| dir.join(HOME_DIR)))
            .unwrap_or_else(|| PathBuf::from("."));

        match fs::create_dir_all(&candidate) {
            Ok(()) => Self { root: candidate },
            Err(e) => {
                log::error!(
                    "❌ 无法创建数据目录 {}: {}, 使用当前目录",
                    candidate.display(),
                    e
                );
                Self {
                    root: PathBuf::from("."),
                }
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn preview_dir(&self) -> PathBuf {
        self.root.join("preview")
    }

    /// 创建所有子目录
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.reports_dir(), self.logs_dir(), self.preview_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
