//! 检测器 (Detector)
//! 职责: DecodedFrame → YOLO检测 → 原图坐标检测框

use std::time::Instant;

use anyhow::Result;

use super::types::{BBox, DecodedFrame};
use crate::backend::BackendSelection;
use crate::config::DetectionConfig;
use crate::models::{Model, YOLOv8};

/// 目标检测器接口 (工作线程只依赖这个 trait)
pub trait ObjectDetector {
    fn detect(&mut self, frame: &DecodedFrame) -> Result<Vec<BBox>>;
}

/// 基于 YOLOv8 + ONNX Runtime 的检测器
pub struct YoloDetector {
    model: YOLOv8,

    // 统计
    count: u64,
    last: Instant,
    current_fps: f64,
    last_ms: f64,
}

impl YoloDetector {
    pub fn new(selection: &BackendSelection, cfg: &DetectionConfig) -> Result<Self> {
        let model = YOLOv8::new(
            selection,
            cfg.image_size,
            cfg.confidence_threshold,
            cfg.iou_threshold,
        )?;
        log::info!("✅ 检测模型加载成功: {}", model.summary());
        Ok(Self::from_model(model))
    }

    pub fn from_model(model: YOLOv8) -> Self {
        Self {
            model,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
            last_ms: 0.0,
        }
    }

    pub fn fps(&self) -> f64 {
        self.current_fps
    }

    pub fn last_ms(&self) -> f64 {
        self.last_ms
    }

    pub fn class_name(&self, class_id: u32) -> Option<&str> {
        self.model.names().get(class_id as usize).map(String::as_str)
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, frame: &DecodedFrame) -> Result<Vec<BBox>> {
        let start = Instant::now();
        let boxes = self.model.forward(frame)?;
        self.last_ms = start.elapsed().as_secs_f64() * 1000.0;

        self.count += 1;
        let elapsed = self.last.elapsed();
        if elapsed.as_secs() >= 1 {
            self.current_fps = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.last = Instant::now();
            log::debug!(
                "🎯 检测: {}个 | {:.1}ms/帧 | {:.1}fps",
                boxes.len(),
                self.last_ms,
                self.current_fps
            );
        }
        Ok(boxes)
    }
}
