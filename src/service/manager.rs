use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::Sender;

use super::worker::Worker;
use super::{BackendInfo, CameraStatus, FrameCallback, PipelineFactory, ServiceError, ServiceEvent};
use crate::backend::{select_backend, BackendSelection};
use crate::config::ConfigManager;
use crate::logger::{log_system_event, log_user_action};
use crate::report::{CargoType, DetectionSession};

/// 停止检测时等待线程退出的上限
pub const STOP_TIMEOUT: Duration = Duration::from_secs(7);

struct WorkerEntry {
    run_id: u64,
    stop: Arc<AtomicBool>,
    session: Arc<Mutex<DetectionSession>>,
    thread: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<u32, WorkerEntry>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 结束会话并取出快照
fn close_session(session: &Mutex<DetectionSession>) -> DetectionSession {
    let mut session = lock(session);
    session.end();
    session.clone()
}

/// 轮询等待线程结束 (JoinHandle 没有带超时的 join)
fn join_until(thread: JoinHandle<()>, deadline: Instant) -> bool {
    while !thread.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    if thread.join().is_err() {
        log::error!("❌ 检测线程异常退出");
    }
    true
}

/// 多摄像头检测服务
///
/// 注册表里的条目只会被移除一次: 要么由 `stop_detection`/`stop_all_detections` 移除,
/// 要么由自行结束的检测线程移除。移除者负责把会话放入已完成列表。
pub struct DetectionService {
    config: Arc<RwLock<ConfigManager>>,
    factory: Arc<dyn PipelineFactory>,
    events: Sender<ServiceEvent>,
    selection: Option<BackendSelection>,
    workers: Registry,
    finished: Arc<Mutex<Vec<DetectionSession>>>,
    next_run: AtomicU64,
}

impl DetectionService {
    /// 创建服务并选择推理后端; 选中的模型不存在时后端为 "N/A"
    pub fn new(
        config: Arc<RwLock<ConfigManager>>,
        factory: Arc<dyn PipelineFactory>,
        events: Sender<ServiceEvent>,
    ) -> Self {
        let detection = config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config()
            .detection
            .clone();

        let selection = select_backend(&detection, factory.hardware());
        let selection = if selection.model_exists() {
            log_system_event(&format!("检测服务初始化, 后端 {}", selection.backend));
            Some(selection)
        } else {
            log::error!(
                "❌ 模型文件不存在: {} (基础模型 {})",
                selection.model_path.display(),
                selection.base_model.display()
            );
            let _ = events.send(ServiceEvent::Error("推理后端初始化失败: 模型文件不存在".to_string()));
            None
        };

        Self {
            config,
            factory,
            events,
            selection,
            workers: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Mutex::new(Vec::new())),
            next_run: AtomicU64::new(1),
        }
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.events.send(event);
    }

    fn reject(&self, camera_id: u32, error: ServiceError) -> Result<(), ServiceError> {
        log::error!("❌ {}", error);
        self.emit(ServiceEvent::DetectionFailed {
            camera_id,
            reason: error.to_string(),
        });
        Err(error)
    }

    pub fn selection(&self) -> Option<&BackendSelection> {
        self.selection.as_ref()
    }

    /// 后端名称, 没有可用后端时为 "N/A"
    pub fn backend_name(&self) -> String {
        self.selection
            .as_ref()
            .map(|s| s.backend.name().to_string())
            .unwrap_or_else(|| "N/A".to_string())
    }

    /// 启动摄像头检测
    pub fn start_detection(
        &self,
        camera_id: u32,
        user: &str,
        cargo_type: CargoType,
        callback: Option<FrameCallback>,
    ) -> Result<(), ServiceError> {
        if self.is_detection_active(camera_id) {
            return self.reject(camera_id, ServiceError::AlreadyActive(camera_id));
        }

        let (camera, detection, font_path) = {
            let manager = self.config.read().unwrap_or_else(PoisonError::into_inner);
            let config = manager.config();
            (
                config.cameras.get(&camera_id).cloned(),
                config.detection.clone(),
                config.ui.font_path.clone(),
            )
        };
        let camera = match camera {
            Some(camera) if camera.enabled => camera,
            Some(_) => return self.reject(camera_id, ServiceError::CameraDisabled(camera_id)),
            None => return self.reject(camera_id, ServiceError::UnknownCamera(camera_id)),
        };
        let Some(source) = camera.parsed_source() else {
            return self.reject(camera_id, ServiceError::EmptySource(camera_id));
        };
        let Some(selection) = self.selection.clone() else {
            return self.reject(camera_id, ServiceError::NoBackend);
        };

        let backend_name = selection.backend.name();
        let session = Arc::new(Mutex::new(DetectionSession::new(
            camera_id,
            user,
            backend_name,
            cargo_type,
        )));
        let stop = Arc::new(AtomicBool::new(false));
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);

        let worker = Worker {
            camera,
            source,
            detection,
            font_path,
            selection,
            factory: Arc::clone(&self.factory),
            events: self.events.clone(),
            stop: Arc::clone(&stop),
            session: Arc::clone(&session),
            callback,
        };

        let registry = Arc::clone(&self.workers);
        let finished = Arc::clone(&self.finished);
        let events = self.events.clone();

        // 持锁创建线程, 线程的自清理必须等条目写入之后
        let mut workers = lock(&self.workers);
        if workers.get(&camera_id).is_some_and(|w| !w.thread.is_finished()) {
            drop(workers);
            return self.reject(camera_id, ServiceError::AlreadyActive(camera_id));
        }
        self.emit(ServiceEvent::DetectionStarting { camera_id });
        let spawned = std::thread::Builder::new()
            .name(format!("detection-cam-{}", camera_id))
            .spawn(move || {
                worker.run();
                cleanup_finished_worker(camera_id, run_id, &registry, &finished, &events);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                drop(workers);
                return self.reject(camera_id, ServiceError::Spawn(e));
            }
        };
        // 旧条目的线程已结束但还没被清理
        if let Some(stale) = workers.insert(
            camera_id,
            WorkerEntry {
                run_id,
                stop,
                session,
                thread,
            },
        ) {
            lock(&self.finished).push(close_session(&stale.session));
        }
        drop(workers);

        log_user_action(
            user,
            &format!(
                "开始检测: 摄像头 {} 类型 {} 后端 {}",
                camera_id,
                cargo_type.code(),
                backend_name
            ),
        );
        Ok(())
    }

    /// 停止摄像头检测, 返回线程是否在超时内退出
    pub fn stop_detection(&self, camera_id: u32) -> bool {
        let Some(entry) = lock(&self.workers).remove(&camera_id) else {
            return false;
        };
        log_system_event(&format!("请求停止检测: 摄像头 {}", camera_id));
        entry.stop.store(true, Ordering::Relaxed);

        let name = entry.thread.thread().name().unwrap_or("detection").to_string();
        let clean = join_until(entry.thread, Instant::now() + STOP_TIMEOUT);
        if !clean {
            log::error!("❌ 线程 {} 未在 {:?} 内退出", name, STOP_TIMEOUT);
        }

        lock(&self.finished).push(close_session(&entry.session));
        log_system_event(&format!("检测已停止: 摄像头 {}", camera_id));
        if clean {
            self.emit(ServiceEvent::DetectionStopped { camera_id });
        }
        clean
    }

    /// 停止所有检测 (共用一个超时)
    pub fn stop_all_detections(&self) {
        let entries: Vec<(u32, WorkerEntry)> = lock(&self.workers).drain().collect();
        if entries.is_empty() {
            log_system_event("停止全部检测: 没有运行中的检测");
            return;
        }
        log_system_event(&format!("停止全部检测: {} 路", entries.len()));
        for (_, entry) in &entries {
            entry.stop.store(true, Ordering::Relaxed);
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        for (camera_id, entry) in entries {
            let clean = join_until(entry.thread, deadline);
            lock(&self.finished).push(close_session(&entry.session));
            if clean {
                self.emit(ServiceEvent::DetectionStopped { camera_id });
            } else {
                log::error!("❌ 摄像头 {} 的检测线程未在超时内退出", camera_id);
            }
        }
        log_system_event("全部检测已停止");
    }

    pub fn is_detection_active(&self, camera_id: u32) -> bool {
        lock(&self.workers)
            .get(&camera_id)
            .is_some_and(|w| !w.thread.is_finished())
    }

    pub fn active_cameras(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = lock(&self.workers)
            .iter()
            .filter(|(_, w)| !w.thread.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn detection_count(&self, camera_id: u32) -> u64 {
        lock(&self.workers)
            .get(&camera_id)
            .map(|w| lock(&w.session).detection_count)
            .unwrap_or(0)
    }

    /// 计数清零, 之后的过线从 0 继续累加
    pub fn reset_count(&self, camera_id: u32) -> bool {
        let reset = match lock(&self.workers).get(&camera_id) {
            Some(worker) => {
                lock(&worker.session).detection_count = 0;
                true
            }
            None => false,
        };
        if reset {
            log_system_event(&format!("计数已清零: 摄像头 {}", camera_id));
            self.emit(ServiceEvent::CountReset { camera_id });
        } else {
            log::warn!("⚠️ 尝试清零未运行摄像头 {} 的计数", camera_id);
        }
        reset
    }

    /// 当前会话快照
    pub fn session(&self, camera_id: u32) -> Option<DetectionSession> {
        lock(&self.workers)
            .get(&camera_id)
            .map(|w| lock(&w.session).clone())
    }

    pub fn camera_status(&self, camera_id: u32) -> Option<CameraStatus> {
        let workers = lock(&self.workers);
        let worker = workers.get(&camera_id)?;
        let session = lock(&worker.session);
        Some(CameraStatus {
            camera_id,
            is_active: !worker.thread.is_finished(),
            detection_count: session.detection_count,
            session_start: Some(session.start_time),
            last_update: Local::now(),
            backend: self.backend_name(),
        })
    }

    pub fn backend_info(&self) -> BackendInfo {
        let active_sessions = self.active_cameras().len();
        match &self.selection {
            Some(selection) => BackendInfo {
                backend_name: selection.backend.name().to_string(),
                model_path: selection.model_path.display().to_string(),
                device_args: selection.device.to_string(),
                active_sessions,
            },
            None => BackendInfo {
                backend_name: "N/A".to_string(),
                model_path: String::new(),
                device_args: "{}".to_string(),
                active_sessions,
            },
        }
    }

    /// 取出已结束的会话 (用于生成报告)
    pub fn take_finished_sessions(&self) -> Vec<DetectionSession> {
        std::mem::take(&mut *lock(&self.finished))
    }
}

impl Drop for DetectionService {
    fn drop(&mut self) {
        self.stop_all_detections();
    }
}

/// 自行结束的线程清理自己的注册表条目
fn cleanup_finished_worker(
    camera_id: u32,
    run_id: u64,
    registry: &Mutex<HashMap<u32, WorkerEntry>>,
    finished: &Mutex<Vec<DetectionSession>>,
    events: &Sender<ServiceEvent>,
) {
    let entry = {
        let mut workers = lock(registry);
        match workers.get(&camera_id) {
            Some(entry) if entry.run_id == run_id => workers.remove(&camera_id),
            _ => None,
        }
    };
    let Some(entry) = entry else {
        return;
    };
    log_system_event(&format!("检测线程自行结束: 摄像头 {}", camera_id));
    lock(finished).push(close_session(&entry.session));
    let _ = events.send(ServiceEvent::DetectionStopped { camera_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::FakeProbe;
    use crate::backend::HardwareProbe;
    use crate::config::{CameraConfig, CameraSource, DetectionConfig};
    use crate::detection::{BBox, DecodedFrame, ObjectDetector};
    use crate::input::FrameSource;
    use crossbeam_channel::{unbounded, Receiver};
    use image::RgbaImage;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    const W: u32 = 100;
    const H: u32 = 100;

    /// 脚本化视频源: 每帧给出一组检测框, 结束后返回 None
    ///
    /// `gate` 为 (帧序号, 开关): 播放到该帧时先输出空画面, 直到开关打开
    struct ScriptedSource {
        frames: VecDeque<Vec<BBox>>,
        script: Arc<Mutex<VecDeque<Vec<BBox>>>>,
        gate: Option<(usize, Arc<AtomicBool>)>,
        served: usize,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Option<DecodedFrame> {
            if let Some((at, open)) = &self.gate {
                if self.served == *at && !open.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5));
                    lock(&self.script).push_back(Vec::new());
                    return Some(DecodedFrame::from_image(RgbaImage::new(W, H), "scripted"));
                }
            }
            let next = self.frames.pop_front();
            match next {
                Some(boxes) => {
                    self.served += 1;
                    lock(&self.script).push_back(boxes);
                    Some(DecodedFrame::from_image(RgbaImage::new(W, H), "scripted"))
                }
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    None
                }
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct ScriptedDetector {
        script: Arc<Mutex<VecDeque<Vec<BBox>>>>,
    }

    impl ObjectDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &DecodedFrame) -> anyhow::Result<Vec<BBox>> {
            Ok(lock(&self.script).pop_front().unwrap_or_default())
        }
    }

    struct FakePipeline {
        probe: FakeProbe,
        frames: Vec<Vec<BBox>>,
        fail_open: bool,
        /// 帧脚本播放完后是否继续无限提供空帧
        endless: bool,
        opened: AtomicUsize,
    }

    impl FakePipeline {
        fn new(frames: Vec<Vec<BBox>>) -> Self {
            Self {
                probe: FakeProbe::default(),
                frames,
                fail_open: false,
                endless: false,
                opened: AtomicUsize::new(0),
            }
        }
    }

    struct EndlessSource;

    impl FrameSource for EndlessSource {
        fn read_frame(&mut self) -> Option<DecodedFrame> {
            std::thread::sleep(Duration::from_millis(5));
            Some(DecodedFrame::from_image(RgbaImage::new(W, H), "endless"))
        }

        fn describe(&self) -> String {
            "endless".to_string()
        }
    }

    impl PipelineFactory for FakePipeline {
        fn hardware(&self) -> &dyn HardwareProbe {
            &self.probe
        }

        fn open_source(
            &self,
            _camera_id: u32,
            _source: &CameraSource,
        ) -> anyhow::Result<Box<dyn FrameSource>> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            if self.fail_open {
                anyhow::bail!("connection refused");
            }
            if self.endless {
                return Ok(Box::new(EndlessSource));
            }
            Ok(Box::new(ScriptedSource {
                frames: self.frames.clone().into(),
                script: Arc::new(Mutex::new(VecDeque::new())),
                gate: None,
                served: 0,
            }))
        }

        fn load_detector(
            &self,
            _selection: &BackendSelection,
            _cfg: &DetectionConfig,
        ) -> anyhow::Result<Box<dyn ObjectDetector>> {
            Ok(Box::new(ScriptedDetector {
                script: Arc::new(Mutex::new(VecDeque::new())),
            }))
        }
    }

    /// 一个目标从上往下穿过 y=50 的计数线
    fn crossing_script() -> Vec<Vec<BBox>> {
        (0..14)
            .map(|i| {
                let top = 10.0 + i as f32 * 8.0;
                vec![BBox::new(40.0, top, 60.0, top + 20.0, 0.9, 0)]
            })
            .collect()
    }

    fn setup_service(
        pipeline: impl PipelineFactory + 'static,
        tweak: impl FnOnce(&mut DetectionConfig),
    ) -> (TempDir, DetectionService, Receiver<ServiceEvent>) {
        let dir = tempdir().unwrap();
        let model = dir.path().join("best.onnx");
        std::fs::write(&model, b"onnx").unwrap();

        let mut manager = ConfigManager::open(dir.path().join("config.json"));
        let mut detection = DetectionConfig {
            model_path: model.display().to_string(),
            model_path_tensorrt: dir.path().join("missing.engine").display().to_string(),
            model_path_openvino: dir.path().join("missing_ov").display().to_string(),
            max_detection_failures: 3,
            ..Default::default()
        };
        tweak(&mut detection);
        manager.update_detection(detection).unwrap();
        manager
            .add_camera(CameraConfig::new(9, "empty", ""))
            .unwrap();

        let (tx, rx) = unbounded();
        let service = DetectionService::new(
            Arc::new(RwLock::new(manager)),
            Arc::new(pipeline),
            tx,
        );
        (dir, service, rx)
    }

    fn setup(pipeline: FakePipeline) -> (TempDir, DetectionService, Receiver<ServiceEvent>) {
        setup_service(pipeline, |_| {})
    }

    /// 按顺序把检测框交给检测器: 视频源和检测器共享同一个脚本队列
    fn linked_pipeline(frames: Vec<Vec<BBox>>) -> LinkedPipeline {
        LinkedPipeline {
            inner: FakePipeline::new(frames),
            script: Arc::new(Mutex::new(VecDeque::new())),
            gate: None,
        }
    }

    struct LinkedPipeline {
        inner: FakePipeline,
        script: Arc<Mutex<VecDeque<Vec<BBox>>>>,
        gate: Option<(usize, Arc<AtomicBool>)>,
    }

    impl PipelineFactory for LinkedPipeline {
        fn hardware(&self) -> &dyn HardwareProbe {
            &self.inner.probe
        }

        fn open_source(
            &self,
            _camera_id: u32,
            _source: &CameraSource,
        ) -> anyhow::Result<Box<dyn FrameSource>> {
            Ok(Box::new(ScriptedSource {
                frames: self.inner.frames.clone().into(),
                script: Arc::clone(&self.script),
                gate: self.gate.clone(),
                served: 0,
            }))
        }

        fn load_detector(
            &self,
            _selection: &BackendSelection,
            _cfg: &DetectionConfig,
        ) -> anyhow::Result<Box<dyn ObjectDetector>> {
            Ok(Box::new(ScriptedDetector {
                script: Arc::clone(&self.script),
            }))
        }
    }

    fn setup_linked(frames: Vec<Vec<BBox>>) -> (TempDir, DetectionService, Receiver<ServiceEvent>) {
        setup_service(linked_pipeline(frames), |_| {})
    }

    fn wait_for(rx: &Receiver<ServiceEvent>, pred: impl Fn(&ServiceEvent) -> bool) -> Vec<ServiceEvent> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }
        panic!("event not received, saw {:?}", seen);
    }

    #[test]
    fn cpu_backend_selected_when_nothing_else_ready() {
        let (_dir, service, _rx) = setup(FakePipeline::new(vec![]));
        let info = service.backend_info();
        assert_eq!(info.backend_name, "CPU");
        assert_eq!(info.device_args, "device=cpu");
        assert_eq!(info.active_sessions, 0);
    }

    #[test]
    fn missing_model_means_no_backend() {
        let dir = tempdir().unwrap();
        let mut manager = ConfigManager::open(dir.path().join("config.json"));
        manager
            .update_detection(DetectionConfig {
                model_path: dir.path().join("nope.onnx").display().to_string(),
                ..Default::default()
            })
            .unwrap();
        let (tx, rx) = unbounded();
        let service = DetectionService::new(
            Arc::new(RwLock::new(manager)),
            Arc::new(FakePipeline::new(vec![])),
            tx,
        );
        assert!(matches!(rx.try_recv(), Ok(ServiceEvent::Error(_))));
        assert_eq!(service.backend_info().backend_name, "N/A");
        assert!(matches!(
            service.start_detection(0, "op", CargoType::default(), None),
            Err(ServiceError::NoBackend)
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(ServiceEvent::DetectionFailed { camera_id: 0, .. })
        ));
    }

    #[test]
    fn rejects_unknown_disabled_and_empty_cameras() {
        let (_dir, service, rx) = setup(FakePipeline::new(vec![]));
        assert!(matches!(
            service.start_detection(42, "op", CargoType::default(), None),
            Err(ServiceError::UnknownCamera(42))
        ));
        assert!(matches!(
            service.start_detection(2, "op", CargoType::default(), None),
            Err(ServiceError::CameraDisabled(2))
        ));
        assert!(matches!(
            service.start_detection(9, "op", CargoType::default(), None),
            Err(ServiceError::EmptySource(9))
        ));
        let failures = rx
            .try_iter()
            .filter(|e| matches!(e, ServiceEvent::DetectionFailed { .. }))
            .count();
        assert_eq!(failures, 3);
    }

    #[test]
    fn counts_crossing_and_reports_stream_loss() {
        let (_dir, service, rx) = setup_linked(crossing_script());
        service
            .start_detection(0, "op", CargoType::SojaSeca, None)
            .unwrap();

        let events = wait_for(&rx, |e| matches!(e, ServiceEvent::DetectionStopped { .. }));
        assert!(matches!(events[0], ServiceEvent::DetectionStarting { camera_id: 0 }));
        assert!(events.contains(&ServiceEvent::DetectionStarted { camera_id: 0 }));
        let crossings: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ServiceEvent::ObjectCrossed { .. }))
            .collect();
        assert_eq!(crossings.len(), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServiceEvent::DetectionFailed { camera_id: 0, .. })));

        // 线程自行结束后清理了注册表
        assert!(!service.is_detection_active(0));
        assert!(service.camera_status(0).is_none());
        let sessions = service.take_finished_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].detection_count, 1);
        assert_eq!(sessions[0].cargo_type, CargoType::SojaSeca);
        assert!(sessions[0].is_finished());
        assert!(service.take_finished_sessions().is_empty());
    }

    #[test]
    fn open_failure_emits_failed_and_cleans_up() {
        let mut pipeline = FakePipeline::new(vec![]);
        pipeline.fail_open = true;
        let (_dir, service, rx) = setup(pipeline);
        service.start_detection(0, "op", CargoType::default(), None).unwrap();

        let events = wait_for(&rx, |e| matches!(e, ServiceEvent::DetectionStopped { .. }));
        let reason = events.iter().find_map(|e| match e {
            ServiceEvent::DetectionFailed { reason, .. } => Some(reason.clone()),
            _ => None,
        });
        assert!(reason.unwrap().contains("connection refused"));
        assert!(!events.contains(&ServiceEvent::DetectionStarted { camera_id: 0 }));
        assert_eq!(service.take_finished_sessions().len(), 1);
    }

    #[test]
    fn stop_reset_and_status_on_running_camera() {
        let mut pipeline = FakePipeline::new(vec![]);
        pipeline.endless = true;
        let (_dir, service, rx) = setup(pipeline);
        let frames = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&frames);
        let callback: FrameCallback = Arc::new(move |camera_id, _count, image| {
            assert_eq!(camera_id, 0);
            assert_eq!(image.dimensions(), (W, H));
            seen.fetch_add(1, Ordering::Relaxed);
        });
        service
            .start_detection(0, "op", CargoType::TortaNormal, Some(callback))
            .unwrap();
        wait_for(&rx, |e| matches!(e, ServiceEvent::DetectionStarted { .. }));

        assert!(service.is_detection_active(0));
        assert!(matches!(
            service.start_detection(0, "op", CargoType::TortaNormal, None),
            Err(ServiceError::AlreadyActive(0))
        ));
        let status = service.camera_status(0).unwrap();
        assert!(status.is_active);
        assert_eq!(status.backend, "CPU");
        assert_eq!(service.backend_info().active_sessions, 1);
        assert_eq!(service.session(0).unwrap().user, "op");

        assert!(service.reset_count(0));
        assert_eq!(service.detection_count(0), 0);
        assert!(!service.reset_count(5));

        assert!(service.stop_detection(0));
        assert!(!service.is_detection_active(0));
        assert!(!service.stop_detection(0));
        assert!(frames.load(Ordering::Relaxed) > 0);

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&ServiceEvent::CountReset { camera_id: 0 }));
        assert!(events.contains(&ServiceEvent::DetectionStopped { camera_id: 0 }));
        let sessions = service.take_finished_sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].end_time.is_some());
    }

    #[test]
    fn tracking_disabled_annotates_but_never_counts() {
        let (_dir, service, rx) =
            setup_service(linked_pipeline(crossing_script()), |cfg| cfg.tracking_enabled = false);
        let frames = Arc::new(AtomicUsize::new(0));
        let max_count = Arc::new(AtomicU64::new(0));
        let (seen, max_seen) = (Arc::clone(&frames), Arc::clone(&max_count));
        let callback: FrameCallback = Arc::new(move |_camera_id, count, _image| {
            max_seen.fetch_max(count, Ordering::Relaxed);
            seen.fetch_add(1, Ordering::Relaxed);
        });
        service
            .start_detection(0, "op", CargoType::default(), Some(callback))
            .unwrap();

        let events = wait_for(&rx, |e| matches!(e, ServiceEvent::DetectionStopped { .. }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServiceEvent::ObjectCrossed { .. })));
        assert_eq!(frames.load(Ordering::Relaxed), crossing_script().len());
        assert_eq!(max_count.load(Ordering::Relaxed), 0);
        let sessions = service.take_finished_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].detection_count, 0);
    }

    #[test]
    fn panicking_callback_keeps_detection_running() {
        let mut pipeline = FakePipeline::new(vec![]);
        pipeline.endless = true;
        let (_dir, service, rx) = setup(pipeline);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let callback: FrameCallback = Arc::new(move |_camera_id, _count, _image| {
            if seen.fetch_add(1, Ordering::Relaxed) == 0 {
                panic!("preview sink failed");
            }
        });
        service
            .start_detection(0, "op", CargoType::default(), Some(callback))
            .unwrap();
        wait_for(&rx, |e| matches!(e, ServiceEvent::DetectionStarted { .. }));

        let deadline = Instant::now() + Duration::from_secs(10);
        while calls.load(Ordering::Relaxed) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(calls.load(Ordering::Relaxed) >= 5);
        assert!(service.is_detection_active(0));

        assert!(service.stop_detection(0));
        let events: Vec<_> = rx.try_iter().collect();
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServiceEvent::DetectionFailed { .. })));
        assert!(events.contains(&ServiceEvent::DetectionStopped { camera_id: 0 }));
    }

    #[test]
    fn reset_count_restarts_from_zero() {
        let gate = Arc::new(AtomicBool::new(false));
        let mut frames = crossing_script();
        let first_len = frames.len();
        frames.extend(crossing_script());
        let mut pipeline = linked_pipeline(frames);
        pipeline.gate = Some((first_len, Arc::clone(&gate)));
        let (_dir, service, rx) = setup_service(pipeline, |_| {});
        service
            .start_detection(0, "op", CargoType::default(), None)
            .unwrap();

        wait_for(&rx, |e| matches!(e, ServiceEvent::ObjectCrossed { count: 1, .. }));
        assert_eq!(service.detection_count(0), 1);
        assert!(service.reset_count(0));
        assert_eq!(service.detection_count(0), 0);
        // 第二个目标在清零之后才出现
        gate.store(true, Ordering::Relaxed);

        let events = wait_for(&rx, |e| matches!(e, ServiceEvent::DetectionStopped { .. }));
        let counting: Vec<_> = events
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    ServiceEvent::CountReset { .. } | ServiceEvent::ObjectCrossed { .. }
                )
            })
            .collect();
        assert_eq!(counting.len(), 2, "{:?}", counting);
        assert_eq!(counting[0], ServiceEvent::CountReset { camera_id: 0 });
        assert!(matches!(
            counting[1],
            ServiceEvent::ObjectCrossed { camera_id: 0, count: 1, .. }
        ));
        let sessions = service.take_finished_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].detection_count, 1);
    }

    #[test]
    fn stop_all_stops_every_camera() {
        let mut pipeline = FakePipeline::new(vec![]);
        pipeline.endless = true;
        let (_dir, service, rx) = setup(pipeline);
        service.start_detection(0, "op", CargoType::default(), None).unwrap();
        service.start_detection(1, "op", CargoType::default(), None).unwrap();
        wait_for(&rx, |e| matches!(e, ServiceEvent::DetectionStarted { camera_id: 0 }));
        assert_eq!(service.active_cameras().len(), 2);

        service.stop_all_detections();
        assert!(service.active_cameras().is_empty());
        assert_eq!(service.take_finished_sessions().len(), 2);
    }
}
