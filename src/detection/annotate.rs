//! 帧标注: 检测框 + 跟踪ID + 计数线 + 计数

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;

use super::counter::CountLine;
use super::tracker::id_to_color;
use super::types::TrackedBox;

const LINE_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const COUNT_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);

/// 标注器 (字体可选, 没有字体时只画框和线)
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font }
    }

    /// 从 TTF/OTF 文件加载字体, 路径为空时不加载
    pub fn from_font_path(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            return Ok(Self::new(None));
        }
        let bytes = std::fs::read(Path::new(path))
            .with_context(|| format!("无法读取字体文件 {}", path))?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| anyhow::anyhow!("字体解析失败 {}: {}", path, e))?;
        Ok(Self::new(Some(font)))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, image: &mut RgbaImage, tracks: &[TrackedBox], line: CountLine, count: u64) {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return;
        }

        for track in tracks {
            let [r, g, b] = id_to_color(track.track_id);
            let color = Rgba([r, g, b, 255]);
            let rect = to_rect(track, w, h);
            draw_hollow_rect_mut(image, rect, color);
            // 两像素线宽
            if rect.width() > 2 && rect.height() > 2 {
                let inner = Rect::at(rect.left() + 1, rect.top() + 1)
                    .of_size(rect.width() - 2, rect.height() - 2);
                draw_hollow_rect_mut(image, inner, color);
            }
            if let Some(font) = &self.font {
                let label = format!("#{} {:.2}", track.track_id, track.bbox.confidence);
                let y = (rect.top() - 14).max(0);
                draw_text_mut(image, color, rect.left(), y, PxScale::from(14.0), font, &label);
            }
        }

        let y = line.y.min((h - 1) as f32);
        for offset in [0.0, 1.0] {
            let y = (y + offset).min((h - 1) as f32);
            draw_line_segment_mut(image, (line.x_start, y), (line.x_end, y), LINE_COLOR);
        }

        if let Some(font) = &self.font {
            let text = format!("Count: {}", count);
            draw_text_mut(image, COUNT_COLOR, 20, 20, PxScale::from(32.0), font, &text);
        }
    }
}

fn to_rect(track: &TrackedBox, w: u32, h: u32) -> Rect {
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;
    let x1 = track.bbox.x1.clamp(0.0, max_x);
    let y1 = track.bbox.y1.clamp(0.0, max_y);
    let x2 = track.bbox.x2.clamp(0.0, max_x);
    let y2 = track.bbox.y2.clamp(0.0, max_y);
    let width = (x2 - x1).max(1.0).round() as u32;
    let height = (y2 - y1).max(1.0).round() as u32;
    Rect::at(x1.round() as i32, y1.round() as i32).of_size(width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::BBox;

    #[test]
    fn draws_line_and_boxes_without_font() {
        let mut image = RgbaImage::new(100, 100);
        let annotator = Annotator::from_font_path("").unwrap();
        assert!(!annotator.has_font());
        let tracks = [TrackedBox {
            track_id: 3,
            bbox: BBox::new(10.0, 10.0, 30.0, 30.0, 0.9, 0),
        }];
        let line = CountLine {
            y: 50.0,
            x_start: 0.0,
            x_end: 99.0,
        };
        annotator.draw(&mut image, &tracks, line, 2);

        assert_eq!(*image.get_pixel(50, 50), LINE_COLOR);
        let [r, g, b] = id_to_color(3);
        assert_eq!(*image.get_pixel(10, 10), Rgba([r, g, b, 255]));
        assert_eq!(*image.get_pixel(20, 20), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn boxes_outside_frame_are_clamped() {
        let mut image = RgbaImage::new(50, 50);
        let tracks = [TrackedBox {
            track_id: 1,
            bbox: BBox::new(-20.0, -20.0, 80.0, 80.0, 0.9, 0),
        }];
        let line = CountLine {
            y: 60.0,
            x_start: 0.0,
            x_end: 49.0,
        };
        Annotator::new(None).draw(&mut image, &tracks, line, 0);
        assert_eq!(*image.get_pixel(49, 49), LINE_COLOR);
    }

    #[test]
    fn missing_font_file_is_an_error() {
        assert!(Annotator::from_font_path("/nonexistent/font.ttf").is_err());
    }
}
