/// 视频流解码器: RTSP / 本地摄像头 → RGBA 帧
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};

use super::camera;
use super::decode_filter::DecodeFilter;
use super::FrameSource;
use crate::config::CameraSource;
use crate::detection::types::DecodedFrame;

/// 读帧超时
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// 解码线程与检测线程之间的缓冲帧数
const FRAME_QUEUE: usize = 2;
/// 打开摄像头的重试次数
const OPEN_RETRIES: usize = 3;
/// 等待 FFmpeg 启动结果的上限
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// FFmpeg 输入描述
#[derive(Debug, Clone, PartialEq)]
struct InputTarget {
    url: String,
    format: Option<&'static str>,
    rtsp: bool,
    name: String,
}

impl InputTarget {
    fn for_source(source: &CameraSource) -> Result<Self> {
        Ok(match source {
            CameraSource::Device(index) => Self {
                url: camera::device_url(*index)?,
                format: Some(camera::capture_format()),
                rtsp: false,
                name: format!("FFmpeg {}", camera::capture_format()),
            },
            CameraSource::Url(url) if source.is_rtsp() => Self {
                url: url.clone(),
                format: None,
                rtsp: true,
                name: "FFmpeg RTSP (tcp)".to_string(),
            },
            CameraSource::Url(url) => Self {
                url: url.clone(),
                format: None,
                rtsp: false,
                name: "FFmpeg".to_string(),
            },
        })
    }

    fn to_input(&self) -> Input {
        let mut input = Input::new(self.url.as_str());
        if let Some(format) = self.format {
            input = input.set_format(format);
        }
        if self.rtsp {
            input = input.set_input_opts(
                [
                    ("rtsp_transport", "tcp"),
                    ("buffer_size", "67108864"),
                    ("rtsp_flags", "prefer_tcp"),
                ]
                .into(),
            );
        }
        input
    }
}

/// 后台线程中运行 FFmpeg 的解码器
///
/// 析构时置位停止标志, 过滤器在下一帧结束 FFmpeg 管线
pub struct StreamDecoder {
    camera_id: u32,
    description: String,
    receiver: Receiver<DecodedFrame>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamDecoder {
    /// 打开视频源, FFmpeg 启动成功后返回
    pub fn open(camera_id: u32, source: &CameraSource) -> Result<Self> {
        let target = InputTarget::for_source(source)?;
        let description = source.redacted();
        log::info!("🎬 [摄像头 {}] 打开视频源: {} ({})", camera_id, description, target.name);

        let (frame_tx, frame_rx) = bounded(FRAME_QUEUE);
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let retries = if source.is_device() { OPEN_RETRIES } else { 1 };

        let filter = DecodeFilter::new(camera_id, target.name.clone(), frame_tx, Arc::clone(&stop));
        let handle = std::thread::Builder::new()
            .name(format!("decoder-cam-{}", camera_id))
            .spawn(move || run_ffmpeg(camera_id, target, filter, retries, ready_tx))
            .context("无法创建解码线程")?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(anyhow!("无法打开视频源 {}: {}", description, e)),
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                return Err(anyhow!("打开视频源超时: {}", description));
            }
        }

        Ok(Self {
            camera_id,
            description,
            receiver: frame_rx,
            stop,
            handle: Some(handle),
        })
    }

    /// 解码线程是否仍在运行
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if !self.stop.swap(true, Ordering::Relaxed) {
            log::debug!("🛑 [摄像头 {}] 请求停止解码", self.camera_id);
        }
    }
}

impl FrameSource for StreamDecoder {
    fn read_frame(&mut self) -> Option<DecodedFrame> {
        match self.receiver.recv_timeout(READ_TIMEOUT) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // 解码线程已退出, 避免空转
                std::thread::sleep(READ_TIMEOUT);
                None
            }
        }
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        self.stop();
        // 不等待解码线程: 卡住的网络流可能长时间不返回
        self.handle.take();
    }
}

fn run_ffmpeg(
    camera_id: u32,
    target: InputTarget,
    filter: DecodeFilter,
    retries: usize,
    ready: crossbeam_channel::Sender<Result<(), String>>,
) {
    let mut attempt = 0;
    let scheduler = loop {
        attempt += 1;
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("decode", Box::new(filter.clone()));
        let out = create_null_output().add_frame_pipeline(pipe);

        let started = FfmpegContext::builder()
            .input(target.to_input())
            .filter_descs(["format=yuv420p"].into())
            .output(out)
            .build()
            .map_err(|e| format!("构建失败: {}", e))
            .and_then(|ctx| ctx.start().map_err(|e| format!("启动失败: {}", e)));

        match started {
            Ok(scheduler) => break scheduler,
            Err(e) if attempt < retries => {
                log::warn!(
                    "⚠️ [摄像头 {}] {}, 1秒后重试... ({}/{})",
                    camera_id,
                    e,
                    attempt,
                    retries
                );
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => {
                log::error!("❌ [摄像头 {}] {}", camera_id, e);
                let _ = ready.send(Err(e));
                return;
            }
        }
    };

    log::info!("✅ [摄像头 {}] 视频源连接成功, 开始解码", camera_id);
    let _ = ready.send(Ok(()));
    drop(ready);

    if let Err(e) = scheduler.wait() {
        log::warn!("📹 [摄像头 {}] 解码结束: {}", camera_id, e);
    } else {
        log::info!("📹 [摄像头 {}] 解码循环结束", camera_id);
    }
}
