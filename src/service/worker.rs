//! 单路摄像头检测循环

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Sender;

use super::{FrameCallback, PipelineFactory, ServiceEvent};
use crate::backend::BackendSelection;
use crate::config::{CameraConfig, CameraSource, DetectionConfig};
use crate::detection::{Annotator, BBox, ByteTracker, LineCounter, ObjectDetector, TrackedBox};
use crate::input::FrameSource;
use crate::logger::log_system_event;
use crate::report::DetectionSession;

/// 关闭跟踪时所有检测框的 ID 都是 0, 不参与计数
fn untracked(detections: &[BBox]) -> Vec<TrackedBox> {
    detections
        .iter()
        .map(|bbox| TrackedBox {
            track_id: 0,
            bbox: bbox.clone(),
        })
        .collect()
}

pub(super) struct Worker {
    pub camera: CameraConfig,
    pub source: CameraSource,
    pub detection: DetectionConfig,
    pub font_path: String,
    pub selection: BackendSelection,
    pub factory: Arc<dyn PipelineFactory>,
    pub events: Sender<ServiceEvent>,
    pub stop: Arc<AtomicBool>,
    pub session: Arc<Mutex<DetectionSession>>,
    pub callback: Option<FrameCallback>,
}

impl Worker {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("❌ [摄像头 {}] {}", self.camera.id, reason);
        self.emit(ServiceEvent::DetectionFailed {
            camera_id: self.camera.id,
            reason,
        });
    }

    fn session(&self) -> std::sync::MutexGuard<'_, DetectionSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 运行到停止或失败; 返回前结束会话
    pub fn run(self) {
        let camera_id = self.camera.id;
        log_system_event(&format!(
            "检测线程启动: 摄像头 {} 后端 {} 模型 {}",
            camera_id,
            self.selection.backend,
            self.selection.model_path.display()
        ));

        self.run_inner();

        let count = {
            let mut session = self.session();
            session.end();
            session.detection_count
        };
        log_system_event(&format!("检测线程结束: 摄像头 {} 总计 {}", camera_id, count));
    }

    fn run_inner(&self) {
        let camera_id = self.camera.id;

        log::info!("🔄 [摄像头 {}] 加载检测模型...", camera_id);
        let mut detector = match self.factory.load_detector(&self.selection, &self.detection) {
            Ok(detector) => detector,
            Err(e) => return self.fail(format!("模型加载失败: {:#}", e)),
        };
        if self.stopped() {
            return;
        }

        log::info!("🔄 [摄像头 {}] 连接视频源 {}...", camera_id, self.source.redacted());
        let mut source = match self.factory.open_source(camera_id, &self.source) {
            Ok(source) => source,
            Err(e) => return self.fail(format!("连接错误: {:#}", e)),
        };
        log::info!("✅ [摄像头 {}] 已连接 {}", camera_id, source.describe());

        let annotator = match Annotator::from_font_path(&self.font_path) {
            Ok(annotator) => annotator,
            Err(e) => {
                log::warn!("⚠️ 字体加载失败, 标注将不含文字: {:#}", e);
                Annotator::new(None)
            }
        };

        self.emit(ServiceEvent::DetectionStarted { camera_id });
        self.detect_loop(detector.as_mut(), source.as_mut(), &annotator);
    }

    fn detect_loop(
        &self,
        detector: &mut dyn ObjectDetector,
        source: &mut dyn FrameSource,
        annotator: &Annotator,
    ) {
        let camera_id = self.camera.id;
        let cfg = &self.detection;
        let max_failures = cfg.max_detection_failures;
        let mut failures = 0u32;
        let mut tracker = ByteTracker::new(cfg.tracker.clone());
        let mut counter = LineCounter::new(cfg.line_position(), cfg.line_width());

        log::info!("🎬 [摄像头 {}] 开始检测循环", camera_id);
        while !self.stopped() {
            let frame = source.read_frame();
            if self.stopped() {
                break;
            }

            let detections = match frame.as_ref().map(|f| detector.detect(f)) {
                Some(Ok(detections)) => detections,
                failure => {
                    if let Some(Err(e)) = failure {
                        log::warn!("⚠️ [摄像头 {}] 检测失败: {:#}", camera_id, e);
                    }
                    failures += 1;
                    if failures > max_failures {
                        self.fail(format!("视频流丢失 (连续 {} 次失败)", failures));
                        break;
                    }
                    continue;
                }
            };
            failures = 0;
            let Some(frame) = frame else { continue };
            if self.stopped() {
                break;
            }

            let tracks = if cfg.tracking_enabled {
                tracker.update(&detections)
            } else {
                untracked(&detections)
            };

            if cfg.tracking_enabled {
                for crossing in counter.update(&tracks, frame.width, frame.height) {
                    let count = {
                        let mut session = self.session();
                        session.detection_count += 1;
                        session.detection_count
                    };
                    log_system_event(&format!(
                        "目标过线: 摄像头 {} ID {} 计数 {}",
                        camera_id, crossing.track_id, count
                    ));
                    log::info!(
                        "✅ [摄像头 {}] ID {} 过线 ({:.2} 在线下)! 总计: {}",
                        camera_id,
                        crossing.track_id,
                        crossing.fraction,
                        count
                    );
                    self.emit(ServiceEvent::ObjectCrossed {
                        camera_id,
                        track_id: crossing.track_id,
                        count,
                    });
                }
            }

            let Some(callback) = &self.callback else {
                continue;
            };
            let Some(mut image) = frame.to_image() else {
                continue;
            };
            let count = self.session().detection_count;
            annotator.draw(&mut image, &tracks, counter.line(frame.width, frame.height), count);
            if catch_unwind(AssertUnwindSafe(|| callback(camera_id, count, &image))).is_err() {
                log::error!("❌ [摄像头 {}] 帧回调异常", camera_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_boxes_share_id_zero() {
        let detections = vec![
            BBox::new(0.0, 0.0, 10.0, 10.0, 0.9, 0),
            BBox::new(20.0, 20.0, 40.0, 40.0, 0.8, 0),
        ];
        let tracks = untracked(&detections);
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.track_id == 0));
        assert_eq!(tracks[1].bbox, detections[1]);
    }
}
