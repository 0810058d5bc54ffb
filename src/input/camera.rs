//! 本地摄像头输入 - DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)

use anyhow::{bail, Result};

/// 当前平台的采集格式
pub fn capture_format() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dshow"
    }
    #[cfg(target_os = "macos")]
    {
        "avfoundation"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "v4l2"
    }
}

/// 获取可用的摄像头设备列表 (索引, 名称)
pub fn get_camera_devices() -> Vec<(usize, String)> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices.into_iter().enumerate().collect(),
        Err(e) => {
            log::warn!("⚠️ 获取摄像头列表失败: {}", e);
            vec![]
        }
    }
}

/// 设备索引 → FFmpeg 输入 URL
///
/// dshow 按名称打开设备, 名称来自设备枚举; 其余平台直接使用索引
pub fn device_url(index: u32) -> Result<String> {
    if capture_format() == "dshow" {
        let devices = get_camera_devices();
        return match devices.into_iter().find(|(i, _)| *i == index as usize) {
            Some((_, name)) => Ok(format!("video={}", name)),
            None => bail!("摄像头设备 {} 不存在", index),
        };
    }
    Ok(format_device_url(capture_format(), index))
}

fn format_device_url(format: &str, index: u32) -> String {
    match format {
        "v4l2" => format!("/dev/video{}", index),
        _ => index.to_string(),
    }
}
