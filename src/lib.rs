#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 摄像头与子系统配置
pub mod connection; // 连接状态机
pub mod detection; // 智能检测系统
pub mod error;
pub mod input; // 视频输入系统
#[cfg(feature = "onnx")]
pub mod models; // ONNX 模型实现
pub mod pipeline; // 采集 → 推理 → 渲染
pub mod ptz; // 云台控制
pub mod store; // 事件存储

pub use crate::config::{AppConfig, CameraKind, CameraSpec, Capability, SourceLocator, TaskKind};
pub use crate::connection::{ConnectionManager, ConnectionState, Services};
pub use crate::detection::{DetectionEngine, DetectionEvent, InferenceResult, PlateFormatter};
pub use crate::error::{Error, Result};
pub use crate::input::{DefaultSourceOpener, FrameSource, SourceOpener};
pub use crate::pipeline::{FramePipeline, Overlay, RenderedFrame, RenderedFrames};
pub use crate::ptz::{PtzAction, PtzController};
pub use crate::store::{EventRecord, EventStore};

