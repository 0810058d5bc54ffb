// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测模型
// 包含: 模型加载、letterbox 预处理、推理、解码 + NMS

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ndarray::{s, Array, Axis, IxDyn};

use super::{non_max_suppression, Letterbox, Model};
use crate::backend::BackendSelection;
use crate::detection::types::{BBox, DecodedFrame};
use crate::ort_backend::OrtBackend;

/// letterbox 填充灰度 (与 Ultralytics 训练时一致)
const PAD_VALUE: f32 = 144.0 / 255.0;
const CXYWH_OFFSET: usize = 4;

/// YOLOv8 检测模型
pub struct YOLOv8 {
    engine: OrtBackend,
    size: u32,
    conf: f32,
    iou: f32,
    resizer: fr::Resizer,
}

impl YOLOv8 {
    pub fn new(selection: &BackendSelection, size: u32, conf: f32, iou: f32) -> Result<Self> {
        let engine = OrtBackend::build(selection, size)?;
        Ok(Self::with_engine(engine, conf, iou))
    }

    pub fn with_engine(engine: OrtBackend, conf: f32, iou: f32) -> Self {
        Self {
            size: engine.image_size(),
            engine,
            conf,
            iou,
            resizer: fr::Resizer::new(),
        }
    }

    pub fn names(&self) -> &[String] {
        self.engine.names()
    }

    pub fn conf(&self) -> f32 {
        self.conf
    }

    pub fn set_conf(&mut self, val: f32) {
        self.conf = val;
    }

    pub fn iou(&self) -> f32 {
        self.iou
    }

    pub fn set_iou(&mut self, val: f32) {
        self.iou = val;
    }
}

/// RGBA 帧 letterbox 到 size×size 的 NCHW 张量
pub fn letterbox_tensor(
    resizer: &mut fr::Resizer,
    frame: &DecodedFrame,
    size: u32,
) -> Result<(Array<f32, IxDyn>, Letterbox)> {
    let letterbox = Letterbox::new(frame.width, frame.height, size);
    let (w_new, h_new) = letterbox.scaled_size();

    let src = fr::images::ImageRef::new(
        frame.width,
        frame.height,
        frame.rgba_data.as_slice(),
        fr::PixelType::U8x4,
    )
    .context("帧尺寸与数据长度不一致")?;
    let mut dst = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x4);
    resizer.resize(
        &src,
        &mut dst,
        &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
    )?;

    let size = size as usize;
    let mut xs = Array::from_elem((1, 3, size, size), PAD_VALUE);
    let row = w_new as usize * 4;
    for (y, line) in dst.buffer().chunks_exact(row).enumerate() {
        for (x, px) in line.chunks_exact(4).enumerate() {
            xs[[0, 0, y, x]] = px[0] as f32 / 255.0;
            xs[[0, 1, y, x]] = px[1] as f32 / 255.0;
            xs[[0, 2, y, x]] = px[2] as f32 / 255.0;
        }
    }
    Ok((xs.into_dyn(), letterbox))
}

/// 解码 [1, 4 + nc, N] 输出
pub fn decode_detections(
    preds: &Array<f32, IxDyn>,
    letterbox: &Letterbox,
    conf: f32,
    iou: f32,
) -> Result<Vec<BBox>> {
    if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
        anyhow::bail!("不支持的输出形状: {:?}", preds.shape());
    }
    let preds = preds.slice(s![0, .., ..]);

    let mut boxes = Vec::new();
    for pred in preds.axis_iter(Axis(1)) {
        let classes = pred.slice(s![CXYWH_OFFSET..]);
        let Some((class_id, &confidence)) = classes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if confidence < conf {
            continue;
        }
        boxes.push(letterbox.restore(
            pred[0],
            pred[1],
            pred[2],
            pred[3],
            confidence,
            class_id as u32,
        ));
    }

    non_max_suppression(&mut boxes, iou);
    Ok(boxes)
}

impl Model for YOLOv8 {
    fn preprocess(&mut self, frame: &DecodedFrame) -> Result<(Array<f32, IxDyn>, Letterbox)> {
        letterbox_tensor(&mut self.resizer, frame, self.size)
    }

    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        self.engine.run(xs)
    }

    fn postprocess(&self, ys: &[Array<f32, IxDyn>], letterbox: &Letterbox) -> Result<Vec<BBox>> {
        let preds = ys.first().context("模型没有输出")?;
        decode_detections(preds, letterbox, self.conf, self.iou)
    }

    fn summary(&self) -> String {
        format!(
            "YOLOv8 | {} | conf: {} iou: {}",
            self.engine.summary(),
            self.conf,
            self.iou
        )
    }
}
