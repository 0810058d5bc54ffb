//! FFmpeg 帧过滤器: YUV420P → RGBA, 通过有界通道交给检测线程

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};

use crate::detection::types::DecodedFrame;

/// 允许的最大分辨率 (宽/高)
const MAX_DIMENSION: u32 = 4096;
/// `AV_PIX_FMT_YUV420P` 在 FFmpeg ABI 中的取值
const PIX_FMT_YUV420P: i32 = 0;

/// 滤镜链输出固定为 yuv420p, 其他格式说明管线配置错误
pub fn check_pixel_format(format: i32) -> Result<(), String> {
    if format == PIX_FMT_YUV420P {
        Ok(())
    } else {
        Err(format!("不支持的像素格式 {} (需要 yuv420p)", format))
    }
}

/// 一帧 YUV420P 的三个平面
pub struct Yuv420Planes<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub y_stride: usize,
    pub uv_stride: usize,
}

/// BT.601 YUV420P → RGBA (定点系数 ×128)
///
/// `out` 长度必须是 `width * height * 4`
pub fn yuv420p_to_rgba(planes: &Yuv420Planes<'_>, width: usize, height: usize, out: &mut [u8]) {
    for row in 0..height {
        let y_row = row * planes.y_stride;
        let uv_row = (row >> 1) * planes.uv_stride;
        let out_row = row * width * 4;

        for col in 0..width {
            let y = planes.y[y_row + col] as i32;
            let u = planes.u[uv_row + (col >> 1)] as i32 - 128;
            let v = planes.v[uv_row + (col >> 1)] as i32 - 128;

            let idx = out_row + col * 4;
            out[idx] = (y + ((v * 179) >> 7)).clamp(0, 255) as u8;
            out[idx + 1] = (y - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8;
            out[idx + 2] = (y + ((u * 227) >> 7)).clamp(0, 255) as u8;
            out[idx + 3] = 255;
        }
    }
}

/// 解码过滤器
///
/// 停止标志置位后下一帧返回错误, FFmpeg 管线随之结束
#[derive(Clone)]
pub struct DecodeFilter {
    camera_id: u32,
    decoder_name: String,
    sender: Sender<DecodedFrame>,
    stop: Arc<AtomicBool>,
    count: usize,
    last: Instant,
    current_fps: f64,
    dropped_frames: usize,
    total_frames: usize,
}

impl DecodeFilter {
    pub fn new(
        camera_id: u32,
        decoder_name: impl Into<String>,
        sender: Sender<DecodedFrame>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera_id,
            decoder_name: decoder_name.into(),
            sender,
            stop,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
            dropped_frames: 0,
            total_frames: 0,
        }
    }

    fn drop_frame(&mut self, reason: &str) -> Result<Option<Frame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            log::warn!(
                "⚠️ [摄像头 {}] 丢弃帧 #{}: {}",
                self.camera_id,
                self.total_frames,
                reason
            );
        }
        Ok(None)
    }

    fn update_fps(&mut self) {
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed < 1.0 {
            return;
        }
        self.current_fps = self.count as f64 / elapsed;
        let drop_rate = self.dropped_frames as f64 / self.total_frames.max(1) as f64 * 100.0;
        log::debug!(
            "📺 [摄像头 {}] 解码 {:.1}fps | 总帧{} | 丢弃{} ({:.1}%)",
            self.camera_id,
            self.current_fps,
            self.total_frames,
            self.dropped_frames,
            drop_rate
        );
        self.last = Instant::now();
        self.count = 0;
    }

    /// 投递给检测线程; 通道满时丢弃, 检测端只关心最新画面
    fn deliver(&mut self, frame: DecodedFrame) -> Result<(), String> {
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped_frames += 1;
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err("frame receiver dropped".to_string()),
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        log::info!("✅ [摄像头 {}] 解码线程启动 ({})", self.camera_id, self.decoder_name);
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.stop.load(Ordering::Relaxed) {
            log::info!("🛑 [摄像头 {}] 收到停止信号, 结束解码", self.camera_id);
            return Err("decoder stopped".to_string());
        }

        self.total_frames += 1;

        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            return self.drop_frame("空帧/损坏帧");
        }

        // SAFETY: 指针非空, 帧在本次调用期间由 FFmpeg 持有
        let raw = unsafe { &*frame.as_ptr() };
        let (w, h) = (raw.width as u32, raw.height as u32);
        if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
            return self.drop_frame(&format!("非法分辨率 {}x{}", w, h));
        }
        // 缺少参考帧或无效比特流
        if raw.decode_error_flags & 0x03 != 0 {
            return self.drop_frame(&format!("解码错误标志=0x{:02x}", raw.decode_error_flags));
        }

        if let Err(e) = check_pixel_format(raw.format) {
            log::error!("❌ [摄像头 {}] {}", self.camera_id, e);
            return Err(e);
        }

        let (y_ptr, u_ptr, v_ptr) = (raw.data[0], raw.data[1], raw.data[2]);
        if y_ptr.is_null() || u_ptr.is_null() || v_ptr.is_null() {
            return self.drop_frame("YUV指针为空");
        }
        if raw.linesize[0] <= 0 || raw.linesize[1] <= 0 || raw.linesize[2] != raw.linesize[1] {
            return self.drop_frame("步长异常");
        }
        let (width, height) = (w as usize, h as usize);
        let y_stride = raw.linesize[0] as usize;
        let uv_stride = raw.linesize[1] as usize;
        if y_stride < width || uv_stride < width.div_ceil(2) {
            return self.drop_frame(&format!("步长异常 y={} uv={}", y_stride, uv_stride));
        }

        let uv_rows = height.div_ceil(2);
        // SAFETY: yuv420p 平面大小为 stride × 行数, 由上面的检查保证
        let planes = unsafe {
            Yuv420Planes {
                y: std::slice::from_raw_parts(y_ptr, y_stride * height),
                u: std::slice::from_raw_parts(u_ptr, uv_stride * uv_rows),
                v: std::slice::from_raw_parts(v_ptr, uv_stride * uv_rows),
                y_stride,
                uv_stride,
            }
        };

        let mut rgba = vec![0u8; width * height * 4];
        yuv420p_to_rgba(&planes, width, height, &mut rgba);

        self.count += 1;
        self.update_fps();

        self.deliver(DecodedFrame {
            rgba_data: Arc::new(rgba),
            width: w,
            height: h,
            decode_fps: self.current_fps,
            decoder_name: self.decoder_name.clone(),
        })?;

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        log::info!(
            "✅ [摄像头 {}] 解码线程退出 (总帧{}, 丢弃{})",
            self.camera_id,
            self.total_frames,
            self.dropped_frames
        );
    }
}
