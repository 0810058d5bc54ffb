/// 视频输入系统 (Video Input System)
///
/// 每个摄像头一个独立解码线程
/// - StreamDecoder: RTSP / 网络流 / 本地摄像头 (DirectShow/AVFoundation/V4L2)
/// - DecodeFilter:  YUV420P → RGBA 与帧投递
pub mod camera;
pub mod decode_filter;
pub mod decoder;

pub use camera::get_camera_devices;
pub use decode_filter::DecodeFilter;
pub use decoder::StreamDecoder;

use crate::detection::types::DecodedFrame;

/// 帧来源
pub trait FrameSource: Send {
    /// 读取下一帧; 超时或解码已结束时返回 None
    fn read_frame(&mut self) -> Option<DecodedFrame>;

    /// 日志用描述 (不含密码)
    fn describe(&self) -> String;
}
