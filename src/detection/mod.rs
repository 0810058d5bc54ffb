/// 检测系统 (Detection System)
///
/// - Detector: 目标检测
/// - Tracker:  ByteTrack 目标追踪
/// - Counter:  过线计数
/// - Annotate: 结果标注
pub mod annotate;
pub mod bytetrack;
pub mod counter;
pub mod detector;
pub mod tracker;
pub mod types;

pub use annotate::Annotator;
pub use bytetrack::ByteTracker;
pub use counter::{CountLine, Crossing, LineCounter};
pub use detector::{ObjectDetector, YoloDetector};
pub use types::{BBox, DecodedFrame, TrackedBox};
