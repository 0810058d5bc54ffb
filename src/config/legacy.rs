//! v1 扁平配置迁移

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{AppConfig, CameraConfig, ConfigError, DetectionConfig, RawSource};

/// v1 扁平配置
///
/// 字段名同时接受小写和全大写写法 (`RTSP_LINKS` 等)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LegacyConfig {
    #[serde(alias = "YOLO_MODEL_PATH")]
    pub yolo_model_path: String,
    #[serde(alias = "CONFIDENCE_THRESHOLD", default = "default_threshold")]
    pub confidence_threshold: f32,
    #[serde(alias = "SHOW_WINDOW", default)]
    pub show_window: bool,
    /// 摄像头ID → 设备索引 或 URL
    #[serde(alias = "RTSP_LINKS", default)]
    pub rtsp_links: BTreeMap<String, RawSource>,
}

fn default_threshold() -> f32 {
    0.5
}

impl LegacyConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 把 v1 配置转换成 v2 结构
///
/// 每个 `rtsp_links` 条目成为一个启用的摄像头; 旧的 `.pt` 权重路径换成同名 `.onnx`
pub fn migrate_legacy(legacy: &LegacyConfig) -> Result<AppConfig, ConfigError> {
    let mut cameras = BTreeMap::new();
    for (key, source) in &legacy.rtsp_links {
        let id: u32 = key
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidCameraKey(key.clone()))?;
        let camera = CameraConfig::new(id, format!("Camera {}", id), source.to_string())
            .with_description(format!("Migrated camera {}", id));
        cameras.insert(id, camera);
    }

    let model_path = match legacy.yolo_model_path.strip_suffix(".pt") {
        Some(stem) => format!("{}.onnx", stem),
        None => legacy.yolo_model_path.clone(),
    };

    let config = AppConfig {
        cameras,
        detection: DetectionConfig {
            model_path,
            confidence_threshold: legacy.confidence_threshold,
            show_window: legacy.show_window,
            ..Default::default()
        },
        ..Default::default()
    };
    config.validate()?;
    log::info!(
        target: "system",
        "🔄 v1 配置迁移完成: {} 个摄像头",
        config.cameras.len()
    );
    Ok(config)
}
