/// 检测模型接口与实现
///
/// ## Model Trait
/// 统一的模型接口, 标准流程: preprocess → run → postprocess
///
/// ```text
/// 解码帧 → preprocess (letterbox) → NCHW 张量
///        ↓
///   OrtBackend run
///        ↓
/// 原始输出 → postprocess (置信度过滤 + NMS) → 检测框 (原图坐标)
/// ```
use anyhow::Result;
use ndarray::{Array, IxDyn};

use crate::detection::types::{BBox, DecodedFrame};

pub mod yolov8;

pub use yolov8::YOLOv8;

/// Letterbox 缩放信息 (用于把检测框还原到原图)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// 缩放比例 (输入尺寸 / 原图尺寸)
    pub ratio: f32,
    pub src_width: u32,
    pub src_height: u32,
}

impl Letterbox {
    pub fn new(src_width: u32, src_height: u32, size: u32) -> Self {
        let ratio = (size as f32 / src_width.max(1) as f32).min(size as f32 / src_height.max(1) as f32);
        Self {
            ratio,
            src_width,
            src_height,
        }
    }

    /// 缩放后的图像尺寸 (放在输入的左上角)
    pub fn scaled_size(&self) -> (u32, u32) {
        (
            ((self.src_width as f32 * self.ratio).round() as u32).max(1),
            ((self.src_height as f32 * self.ratio).round() as u32).max(1),
        )
    }

    /// 模型坐标系 (cx, cy, w, h) → 原图坐标 BBox
    pub fn restore(&self, cx: f32, cy: f32, w: f32, h: f32, confidence: f32, class_id: u32) -> BBox {
        let (cx, cy, w, h) = (cx / self.ratio, cy / self.ratio, w / self.ratio, h / self.ratio);
        let max_x = self.src_width as f32;
        let max_y = self.src_height as f32;
        BBox::new(
            (cx - w / 2.0).clamp(0.0, max_x),
            (cy - h / 2.0).clamp(0.0, max_y),
            (cx + w / 2.0).clamp(0.0, max_x),
            (cy + h / 2.0).clamp(0.0, max_y),
            confidence,
            class_id,
        )
    }
}

/// 统一的检测模型接口
pub trait Model {
    /// 预处理: 帧 → NCHW 张量
    fn preprocess(&mut self, frame: &DecodedFrame) -> Result<(Array<f32, IxDyn>, Letterbox)>;

    /// 推理: 执行模型前向传播, 返回原始输出
    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>>;

    /// 后处理: 原始输出 → 原图坐标检测框
    fn postprocess(&self, ys: &[Array<f32, IxDyn>], letterbox: &Letterbox) -> Result<Vec<BBox>>;

    /// 完整的推理流程: preprocess → run → postprocess
    fn forward(&mut self, frame: &DecodedFrame) -> Result<Vec<BBox>> {
        let (xs, letterbox) = self.preprocess(frame)?;
        let ys = self.run(xs)?;
        self.postprocess(&ys, &letterbox)
    }

    /// 模型信息
    fn summary(&self) -> String;
}

/// 类别无关的非极大值抑制 (按置信度降序保留)
pub fn non_max_suppression(boxes: &mut Vec<BBox>, iou_threshold: f32) {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes.drain(..) {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    *boxes = kept;
}
