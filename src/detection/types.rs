use std::sync::Arc;

use image::RgbaImage;

/// 检测框 (像素坐标, 左上 / 右下)
#[derive(Clone, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// 交并比 (Intersection over Union)
    pub fn iou(&self, other: &BBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// 带跟踪ID的检测框 (跟踪器 → 计数器/标注)
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedBox {
    pub track_id: u32,
    pub bbox: BBox,
}

/// 已解码帧 (解码线程 → 检测线程)
#[derive(Clone)]
pub struct DecodedFrame {
    pub rgba_data: Arc<Vec<u8>>, // 使用Arc共享数据,避免复制
    pub width: u32,
    pub height: u32,
    pub decode_fps: f64,
    pub decoder_name: String,
}

impl DecodedFrame {
    pub fn from_image(image: RgbaImage, decoder_name: impl Into<String>) -> Self {
        let (width, height) = image.dimensions();
        Self {
            rgba_data: Arc::new(image.into_raw()),
            width,
            height,
            decode_fps: 0.0,
            decoder_name: decoder_name.into(),
        }
    }

    /// 复制为可绘制的图像, 尺寸与数据不符时返回 None
    pub fn to_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.rgba_data.as_ref().clone())
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("decode_fps", &self.decode_fps)
            .field("decoder_name", &self.decoder_name)
            .finish()
    }
}
