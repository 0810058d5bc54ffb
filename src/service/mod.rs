/// 检测服务 (Detection Service)
///
/// 每个摄像头一个检测线程: 解码 → 检测 → 跟踪 → 过线计数 → 标注
/// - DetectionService: 启停与状态查询
/// - PipelineFactory: 视频源与检测器的创建入口
/// - ServiceEvent: 通过 crossbeam 通道发给界面/CLI 的事件
mod manager;
mod pipeline;
mod worker;

use std::sync::Arc;

use chrono::{DateTime, Local};
use image::RgbaImage;
use serde::Serialize;

pub use manager::{DetectionService, STOP_TIMEOUT};
pub use pipeline::{OrtPipeline, PipelineFactory};

/// 标注帧回调: (摄像头ID, 当前计数, 标注后的画面)
pub type FrameCallback = Arc<dyn Fn(u32, u64, &RgbaImage) + Send + Sync>;

/// 服务事件
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// 服务级错误 (例如没有可用的推理后端)
    Error(String),
    DetectionStarting { camera_id: u32 },
    DetectionStarted { camera_id: u32 },
    DetectionFailed { camera_id: u32, reason: String },
    DetectionStopped { camera_id: u32 },
    ObjectCrossed { camera_id: u32, track_id: u32, count: u64 },
    CountReset { camera_id: u32 },
}

impl ServiceEvent {
    pub fn camera_id(&self) -> Option<u32> {
        match self {
            ServiceEvent::Error(_) => None,
            ServiceEvent::DetectionStarting { camera_id }
            | ServiceEvent::DetectionStarted { camera_id }
            | ServiceEvent::DetectionFailed { camera_id, .. }
            | ServiceEvent::DetectionStopped { camera_id }
            | ServiceEvent::ObjectCrossed { camera_id, .. }
            | ServiceEvent::CountReset { camera_id } => Some(*camera_id),
        }
    }
}

/// 启动检测被拒绝的原因
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("摄像头 {0} 的检测已在运行")]
    AlreadyActive(u32),
    #[error("摄像头 {0} 不存在")]
    UnknownCamera(u32),
    #[error("摄像头 {0} 已禁用")]
    CameraDisabled(u32),
    #[error("摄像头 {0} 没有配置视频源")]
    EmptySource(u32),
    #[error("没有可用的推理后端")]
    NoBackend,
    #[error("无法创建检测线程: {0}")]
    Spawn(#[from] std::io::Error),
}

/// 摄像头运行状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStatus {
    pub camera_id: u32,
    pub is_active: bool,
    pub detection_count: u64,
    pub session_start: Option<DateTime<Local>>,
    pub last_update: DateTime<Local>,
    pub backend: String,
}

/// 当前推理后端信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendInfo {
    pub backend_name: String,
    pub model_path: String,
    pub device_args: String,
    pub active_sessions: usize,
}
