/// 检测系统 (Detection System)
///
/// - Engine:  检测引擎与能力接口
/// - Tracker: 目标追踪 (ByteTrack)
/// - Plate:   车牌文本规范化
pub mod bytetrack;
pub mod engine;
pub mod plate;
pub mod tracker;
pub mod types;

pub use bytetrack::ByteTracker;
pub use engine::{
    DetectionEngine, EngineFactory, ObjectDetector, PlateDetector, TextRecognizer,
    DEFAULT_MATCH_THRESHOLD,
};
pub use plate::PlateFormatter;
pub use tracker::{boxes_match, compute_iou, match_track, TrackedBox, Tracker};
pub use types::{
    BBox, DetectedObject, Detection, DetectionEvent, Frame, InferenceResult, PlateDetection,
};
