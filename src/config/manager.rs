//! 配置管理器: config.json 的加载、保存与摄像头增删改

use std::fs;
use std::path::{Path, PathBuf};

use super::{parse_config, AppConfig, CameraConfig, ConfigError, DetectionConfig};

/// 摄像头部分更新 (None 表示不修改)
#[derive(Debug, Clone, Default)]
pub struct CameraUpdate {
    pub name: Option<String>,
    pub source: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

impl CameraUpdate {
    fn apply(self, camera: &mut CameraConfig) -> bool {
        let mut changed = false;
        if let Some(name) = self.name {
            changed |= replace_if_different(&mut camera.name, name);
        }
        if let Some(source) = self.source {
            changed |= replace_if_different(&mut camera.source, source);
        }
        if let Some(description) = self.description {
            changed |= replace_if_different(&mut camera.description, description);
        }
        if let Some(enabled) = self.enabled {
            changed |= replace_if_different(&mut camera.enabled, enabled);
        }
        changed
    }
}

fn replace_if_different<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// 配置管理器
pub struct ConfigManager {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// 打开配置文件
    ///
    /// 文件不存在时写入默认配置; 解析失败时备份坏文件 (`.bak`) 后恢复默认配置。
    /// 无论磁盘状态如何都会返回一个可用的管理器。
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut manager = Self {
            path: path.into(),
            config: AppConfig::default(),
        };
        manager.load();
        manager
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn camera(&self, camera_id: u32) -> Option<&CameraConfig> {
        self.config.cameras.get(&camera_id)
    }

    /// 从文件读取并解析 (不修改管理器状态)
    pub fn read_file(path: &Path) -> Result<AppConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        parse_config(&text)
    }

    fn load(&mut self) {
        if !self.path.exists() {
            log::info!(target: "system", "📝 配置文件不存在, 创建默认配置: {}", self.path.display());
            if let Err(e) = self.create_default() {
                log::error!("❌ 保存默认配置失败: {}", e);
            }
            return;
        }

        match Self::read_file(&self.path) {
            Ok(config) => {
                self.config = config;
                log::info!(target: "system", "✅ 配置已从 {} 加载", self.path.display());
            }
            Err(e) => {
                log::error!("⚠️ 配置文件加载失败: {}, 恢复默认配置", e);
                self.backup_broken_file();
                if let Err(e) = self.create_default() {
                    log::error!("❌ 保存默认配置失败: {}", e);
                }
            }
        }
    }

    fn backup_broken_file(&self) {
        let backup = self.path.with_extension("json.bak");
        match fs::copy(&self.path, &backup) {
            Ok(_) => log::warn!("💾 损坏的配置已备份到 {}", backup.display()),
            Err(e) => log::warn!("⚠️ 备份损坏配置失败: {}", e),
        }
    }

    /// 用默认配置替换内存中的配置并尝试保存
    fn create_default(&mut self) -> Result<(), ConfigError> {
        self.config = AppConfig::with_default_cameras();
        self.save()?;
        log::info!(target: "system", "💾 默认配置已创建");
        Ok(())
    }

    /// 保存配置 (临时文件 + 重命名, 避免写一半的文件)
    pub fn save(&self) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        log::debug!("💾 配置已保存到 {}", self.path.display());
        Ok(())
    }

    /// 恢复默认配置 (内存 + 磁盘)
    pub fn restore_defaults(&mut self) -> Result<(), ConfigError> {
        log::info!(target: "system", "🔄 恢复默认配置");
        self.create_default()
    }

    /// 重新从磁盘加载
    pub fn reload(&mut self) {
        self.load();
    }

    pub fn add_camera(&mut self, camera: CameraConfig) -> Result<(), ConfigError> {
        let camera_id = camera.id;
        if self.config.cameras.contains_key(&camera_id) {
            return Err(ConfigError::DuplicateCamera(camera_id));
        }
        let name = camera.name.clone();
        self.config.cameras.insert(camera_id, camera);
        if let Err(e) = self.save() {
            self.config.cameras.remove(&camera_id);
            return Err(e);
        }
        log::info!(target: "system", "➕ 摄像头已添加: ID={}, 名称={}", camera_id, name);
        Ok(())
    }

    pub fn remove_camera(&mut self, camera_id: u32) -> Result<CameraConfig, ConfigError> {
        let removed = self
            .config
            .cameras
            .remove(&camera_id)
            .ok_or(ConfigError::UnknownCamera(camera_id))?;
        if let Err(e) = self.save() {
            self.config.cameras.insert(camera_id, removed);
            return Err(e);
        }
        log::info!(target: "system", "➖ 摄像头已删除: ID={}", camera_id);
        Ok(removed)
    }

    /// 更新摄像头, 返回是否有字段发生变化 (无变化时不写盘)
    pub fn update_camera(&mut self, camera_id: u32, update: CameraUpdate) -> Result<bool, ConfigError> {
        let camera = self
            .config
            .cameras
            .get_mut(&camera_id)
            .ok_or(ConfigError::UnknownCamera(camera_id))?;
        let previous = camera.clone();
        if !update.apply(camera) {
            return Ok(false);
        }
        if let Err(e) = self.save() {
            self.config.cameras.insert(camera_id, previous);
            return Err(e);
        }
        log::info!(target: "system", "✏️ 摄像头配置已更新: ID={}", camera_id);
        Ok(true)
    }

    pub fn update_detection(&mut self, detection: DetectionConfig) -> Result<(), ConfigError> {
        detection.validate()?;
        let previous = std::mem::replace(&mut self.config.detection, detection);
        if let Err(e) = self.save() {
            self.config.detection = previous;
            return Err(e);
        }
        log::info!(target: "system", "✏️ 检测配置已更新");
        Ok(())
    }

    pub fn set_api_base_url(&mut self, url: impl Into<String>) -> Result<(), ConfigError> {
        let previous = std::mem::replace(&mut self.config.api_base_url, url.into());
        if let Err(e) = self.save() {
            self.config.api_base_url = previous;
            return Err(e);
        }
        Ok(())
    }

    /// 整体替换配置 (例如迁移结果), 校验后保存
    pub fn replace(&mut self, config: AppConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let previous = std::mem::replace(&mut self.config, config);
        if let Err(e) = self.save() {
            self.config = previous;
            return Err(e);
        }
        Ok(())
    }
}
