//! 跟踪公共组件: 卡尔曼框滤波 + 轨迹配色

use super::types::BBox;

/// 简化卡尔曼滤波器 (对角协方差, 匀速模型)
///
/// 状态向量: [cx, cy, w, h, vx, vy, vw, vh]
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    state: [f32; 8],
    /// 各状态分量的估计方差
    p: [f32; 8],
    /// 过程噪声
    q: f32,
    /// 观测噪声
    r: f32,
}

/// 速度每帧保留比例, 防止丢失目标漂移过远
const VELOCITY_DECAY: f32 = 0.9;

impl KalmanBoxFilter {
    pub fn new(bbox: &BBox, q: f32, r: f32) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            state: [cx, cy, bbox.width(), bbox.height(), 0.0, 0.0, 0.0, 0.0],
            p: [10.0, 10.0, 10.0, 10.0, 100.0, 100.0, 100.0, 100.0],
            q: q.max(1e-4),
            r: r.max(1e-4),
        }
    }

    /// 预测下一帧
    pub fn predict(&mut self) {
        for i in 0..4 {
            self.state[i] += self.state[i + 4];
            self.state[i + 4] *= VELOCITY_DECAY;
            // 位置方差吸收速度方差
            self.p[i] += self.p[i + 4] + self.q;
            self.p[i + 4] += self.q;
        }
        self.state[2] = self.state[2].max(1.0);
        self.state[3] = self.state[3].max(1.0);
    }

    /// 融合观测值
    pub fn update(&mut self, bbox: &BBox) {
        let (cx, cy) = bbox.center();
        let z = [cx, cy, bbox.width(), bbox.height()];
        for (i, &measured) in z.iter().enumerate() {
            let residual = measured - self.state[i];
            let gain = self.p[i] / (self.p[i] + self.r);
            let velocity_gain = self.p[i + 4] / (self.p[i + 4] + self.r * 10.0);
            self.state[i] += gain * residual;
            self.state[i + 4] += velocity_gain * residual;
            self.p[i] *= 1.0 - gain;
            self.p[i + 4] *= 1.0 - velocity_gain;
        }
    }

    /// 当前估计框
    pub fn bbox(&self, confidence: f32, class_id: u32) -> BBox {
        let (cx, cy) = (self.state[0], self.state[1]);
        let w = self.state[2].max(1.0);
        let h = self.state[3].max(1.0);
        BBox::new(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            confidence,
            class_id,
        )
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.state[4], self.state[5])
    }
}

/// 根据ID生成不同颜色 (黄金角度采样色相)
pub fn id_to_color(id: u32) -> [u8; 3] {
    let hue = (id as f32 * 137.508) % 360.0;
    hsv_to_rgb(hue, 0.8, 0.9)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (h / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    ]
}
