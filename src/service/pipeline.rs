use anyhow::Result;

use crate::backend::{BackendSelection, HardwareProbe, OrtProbe};
use crate::config::{CameraSource, DetectionConfig};
use crate::detection::{ObjectDetector, YoloDetector};
use crate::input::{FrameSource, StreamDecoder};

/// 检测线程依赖的外部资源
///
/// 两个创建方法都在检测线程内部调用
pub trait PipelineFactory: Send + Sync {
    /// 后端选择使用的硬件查询
    fn hardware(&self) -> &dyn HardwareProbe;

    fn open_source(&self, camera_id: u32, source: &CameraSource) -> Result<Box<dyn FrameSource>>;

    fn load_detector(
        &self,
        selection: &BackendSelection,
        cfg: &DetectionConfig,
    ) -> Result<Box<dyn ObjectDetector>>;
}

/// FFmpeg 解码 + ONNX Runtime 推理
#[derive(Debug, Default)]
pub struct OrtPipeline {
    probe: OrtProbe,
}

impl OrtPipeline {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineFactory for OrtPipeline {
    fn hardware(&self) -> &dyn HardwareProbe {
        &self.probe
    }

    fn open_source(&self, camera_id: u32, source: &CameraSource) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(StreamDecoder::open(camera_id, source)?))
    }

    fn load_detector(
        &self,
        selection: &BackendSelection,
        cfg: &DetectionConfig,
    ) -> Result<Box<dyn ObjectDetector>> {
        Ok(Box::new(YoloDetector::new(selection, cfg)?))
    }
}
