#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod backend; // 推理后端选择
pub mod config; // 配置与迁移
pub mod detection; // 检测、跟踪、计数与标注
pub mod input; // 视频输入系统
pub mod logger;
pub mod models; // 模型接口与具体实现
pub mod optimizer; // 首次运行的模型优化
pub mod ort_backend;
pub mod paths;
pub mod report; // 会话报告与上报
pub mod service; // 多摄像头检测服务

pub use crate::backend::{select_backend, Backend, BackendPreference, BackendSelection};
pub use crate::config::{AppConfig, CameraConfig, ConfigManager, DetectionConfig};
pub use crate::models::{Model, YOLOv8};
pub use crate::ort_backend::OrtBackend;
pub use crate::report::{CargoType, DetectionSession};
pub use crate::service::{DetectionService, OrtPipeline, ServiceEvent};
