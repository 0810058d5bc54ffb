//! 过线计数
//!
//! 计数线是一条水平线段: y = 高度 × position, 水平方向居中占宽度 × width_percent。
//! 目标框位于线下方的比例从 < 0.70 变为 ≥ 0.70, 且中心 x 落在线段范围内时计一次。
//! 比例回落到 0.70 以下后该轨迹才能再次计数。

use std::collections::HashMap;

use super::types::TrackedBox;
use crate::config::CROSSING_THRESHOLD;

/// 计数线在画面中的像素位置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountLine {
    pub y: f32,
    pub x_start: f32,
    pub x_end: f32,
}

/// 一次过线事件
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub track_id: u32,
    /// 过线时目标框位于线下方的比例
    pub fraction: f32,
}

#[derive(Debug, Clone, Copy)]
struct TrackState {
    previous_fraction: f32,
    counted: bool,
}

/// 单路摄像头的过线计数器
#[derive(Debug, Clone)]
pub struct LineCounter {
    position: f32,
    width_percent: f32,
    states: HashMap<u32, TrackState>,
}

impl LineCounter {
    pub fn new(position: f32, width_percent: f32) -> Self {
        Self {
            position: position.clamp(0.0, 1.0),
            width_percent: width_percent.clamp(0.0, 1.0),
            states: HashMap::new(),
        }
    }

    pub fn line(&self, width: u32, height: u32) -> CountLine {
        let y = (height as f32 * self.position).floor();
        let span = width as f32 * self.width_percent;
        let x_start = ((width as f32 - span) / 2.0).floor();
        let x_end = (x_start + span).floor();
        CountLine { y, x_start, x_end }
    }

    /// 处理一帧的跟踪结果, 返回本帧新产生的过线
    pub fn update(&mut self, tracks: &[TrackedBox], width: u32, height: u32) -> Vec<Crossing> {
        let line = self.line(width, height);
        let mut crossings = Vec::new();
        let mut seen = Vec::with_capacity(tracks.len());

        for track in tracks {
            seen.push(track.track_id);
            // 与计数线一样按整像素判定
            let bbox = &track.bbox;
            let (x1, y1, x2, y2) = (bbox.x1.trunc(), bbox.y1.trunc(), bbox.x2.trunc(), bbox.y2.trunc());
            let h = y2 - y1;
            if h <= 0.0 {
                continue;
            }
            let fraction = ((y2 - line.y).max(0.0) / h).clamp(0.0, 1.0);
            let cx = ((x1 + x2) / 2.0).floor();
            let inside = cx >= line.x_start && cx <= line.x_end;

            match self.states.get_mut(&track.track_id) {
                // 首次出现只记录状态
                None => {
                    self.states.insert(
                        track.track_id,
                        TrackState {
                            previous_fraction: fraction,
                            counted: false,
                        },
                    );
                }
                Some(state) => {
                    if state.previous_fraction < CROSSING_THRESHOLD
                        && fraction >= CROSSING_THRESHOLD
                        && !state.counted
                        && inside
                    {
                        state.counted = true;
                        crossings.push(Crossing {
                            track_id: track.track_id,
                            fraction,
                        });
                    } else if fraction < CROSSING_THRESHOLD {
                        state.counted = false;
                    }
                    state.previous_fraction = fraction;
                }
            }
        }

        self.states.retain(|id, _| seen.contains(id));
        crossings
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}
