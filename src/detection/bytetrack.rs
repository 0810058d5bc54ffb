//! ByteTrack 多目标跟踪
//!
//! 1. 高低分检测框分开处理
//! 2. 高分框先与全部轨迹按 IOU 匹配
//! 3. 低分框只用来救援第一轮没匹配上的轨迹
//! 4. 未匹配的高分框 (≥ new_track_threshold) 新建轨迹
//! 5. 丢失超过 max_lost_frames 的轨迹删除

use super::tracker::KalmanBoxFilter;
use super::types::{BBox, TrackedBox};
use crate::config::TrackerConfig;

#[derive(Clone, Debug)]
struct Track {
    id: u32,
    kalman: KalmanBoxFilter,
    class_id: u32,
    score: f32,
    frames_lost: u32,
    hits: u32,
}

impl Track {
    fn new(id: u32, det: &BBox, cfg: &TrackerConfig) -> Self {
        Self {
            id,
            kalman: KalmanBoxFilter::new(det, cfg.kalman_process_noise, cfg.kalman_obs_noise),
            class_id: det.class_id,
            score: det.confidence,
            frames_lost: 0,
            hits: 1,
        }
    }

    fn predicted(&self) -> BBox {
        self.kalman.bbox(self.score, self.class_id)
    }

    fn update(&mut self, det: &BBox) {
        self.kalman.update(det);
        self.class_id = det.class_id;
        self.score = det.confidence;
        self.frames_lost = 0;
        self.hits += 1;
    }
}

/// ByteTrack 跟踪器
pub struct ByteTracker {
    tracks: Vec<Track>,
    next_id: u32,
    cfg: TrackerConfig,
}

impl ByteTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            cfg,
        }
    }

    /// 输入当前帧检测框, 返回本帧匹配到的轨迹 (带ID)
    pub fn update(&mut self, detections: &[BBox]) -> Vec<TrackedBox> {
        for track in &mut self.tracks {
            track.kalman.predict();
        }

        let (high, low): (Vec<usize>, Vec<usize>) = (0..detections.len())
            .filter(|&i| detections[i].confidence >= self.cfg.low_score_threshold)
            .partition(|&i| detections[i].confidence >= self.cfg.high_score_threshold);

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];

        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        for (det, track) in self.associate(detections, &high, &all_tracks, self.cfg.high_iou_threshold) {
            self.tracks[track].update(&detections[det]);
            track_matched[track] = true;
            det_matched[det] = true;
        }

        let remaining: Vec<usize> = all_tracks.into_iter().filter(|&t| !track_matched[t]).collect();
        for (det, track) in self.associate(detections, &low, &remaining, self.cfg.low_iou_threshold) {
            self.tracks[track].update(&detections[det]);
            track_matched[track] = true;
            det_matched[det] = true;
        }

        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if !matched {
                track.frames_lost += 1;
            }
        }

        let mut output: Vec<TrackedBox> = self
            .tracks
            .iter()
            .filter(|t| t.frames_lost == 0)
            .map(|t| TrackedBox {
                track_id: t.id,
                bbox: t.predicted(),
            })
            .collect();

        for &i in &high {
            if det_matched[i] || detections[i].confidence < self.cfg.new_track_threshold {
                continue;
            }
            let track = Track::new(self.next_id, &detections[i], &self.cfg);
            output.push(TrackedBox {
                track_id: track.id,
                bbox: detections[i].clone(),
            });
            self.tracks.push(track);
            self.next_id += 1;
        }

        let max_lost = self.cfg.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);
        output
    }

    /// 贪心 IOU 匹配, 返回 (检测序号, 轨迹序号)
    fn associate(
        &self,
        detections: &[BBox],
        det_indices: &[usize],
        track_indices: &[usize],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        let mut candidates = Vec::new();
        for &d in det_indices {
            for &t in track_indices {
                let iou = detections[d].iou(&self.tracks[t].predicted());
                if iou >= iou_threshold {
                    candidates.push((iou, d, t));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut used_det = Vec::new();
        let mut used_track = Vec::new();
        let mut pairs = Vec::new();
        for (_, d, t) in candidates {
            if used_det.contains(&d) || used_track.contains(&t) {
                continue;
            }
            used_det.push(d);
            used_track.push(t);
            pairs.push((d, t));
        }
        pairs
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn stats(&self) -> String {
        let confirmed = self.tracks.iter().filter(|t| t.hits > 1).count();
        format!(
            "跟踪: {} 个 (确认 {}) | 总ID: {}",
            self.tracks.len(),
            confirmed,
            self.next_id - 1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, conf: f32) -> BBox {
        BBox::new(x, y, x + 40.0, y + 40.0, conf, 0)
    }

    #[test]
    fn keeps_id_for_moving_object() {
        let mut tracker = ByteTracker::new(TrackerConfig::default());
        let first = tracker.update(&[det(100.0, 100.0, 0.9)]);
        assert_eq!(first.len(), 1);
        let id = first[0].track_id;
        for step in 1..10 {
            let out = tracker.update(&[det(100.0, 100.0 + step as f32 * 4.0, 0.9)]);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].track_id, id);
        }
    }

    #[test]
    fn low_score_rescues_existing_track_only() {
        let mut tracker = ByteTracker::new(TrackerConfig::default());
        let id = tracker.update(&[det(0.0, 0.0, 0.9)])[0].track_id;
        let out = tracker.update(&[det(2.0, 2.0, 0.2)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, id);

        // 低分框不会新建轨迹
        let out = tracker.update(&[det(2.0, 2.0, 0.2), det(500.0, 500.0, 0.2)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn below_new_track_threshold_is_ignored() {
        let mut tracker = ByteTracker::new(TrackerConfig::default());
        assert!(tracker.update(&[det(0.0, 0.0, 0.55)]).is_empty());
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn lost_tracks_expire() {
        let cfg = TrackerConfig {
            max_lost_frames: 2,
            ..Default::default()
        };
        let mut tracker = ByteTracker::new(cfg);
        tracker.update(&[det(0.0, 0.0, 0.9)]);
        for _ in 0..2 {
            assert!(tracker.update(&[]).is_empty());
            assert_eq!(tracker.track_count(), 1);
        }
        tracker.update(&[]);
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn two_objects_get_distinct_ids() {
        let mut tracker = ByteTracker::new(TrackerConfig::default());
        let out = tracker.update(&[det(0.0, 0.0, 0.9), det(300.0, 0.0, 0.8)]);
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].track_id, out[1].track_id);
        tracker.reset();
        assert_eq!(tracker.update(&[det(0.0, 0.0, 0.9)])[0].track_id, 1);
    }
}
