//! 配置 - 通过YAML文件描述摄像头列表与各子系统参数
//!
//! ```yaml
//! database: records.db
//! cameras:
//!   - gate:
//!       type: ptz
//!       source: rtsp://10.0.0.5/stream
//!       task: Anpr
//!       model_used: ANPRModel
//!       base_url: http://10.0.0.5
//!       url: ws://10.0.0.5/ws
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ========== 摄像头描述 ==========

/// 摄像头任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(alias = "detect")]
    Detect,
    #[serde(alias = "segment")]
    Segment,
    #[serde(alias = "anpr", alias = "ANPR")]
    Anpr,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Detect => "Detect",
            TaskKind::Segment => "Segment",
            TaskKind::Anpr => "Anpr",
        }
    }
}

/// 摄像头硬件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraKind {
    #[default]
    Fixed,
    /// 全功能云台
    Ptz,
    /// 固定机位, 仅支持雨刷与变焦
    PtzFixed,
}

impl CameraKind {
    pub fn has_ptz(&self) -> bool {
        matches!(self, CameraKind::Ptz | CameraKind::PtzFixed)
    }
}

/// 推理能力组合, 在加载配置时一次性确定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Detector,
    Segmenter,
    AnprPipeline,
}

impl Capability {
    /// 根据 `model_used` 选择能力; 缺省时按任务类型推断
    pub fn resolve(model_used: Option<&str>, task: TaskKind) -> Result<Self> {
        match model_used.map(str::trim) {
            None | Some("") => Ok(match task {
                TaskKind::Detect => Capability::Detector,
                TaskKind::Segment => Capability::Segmenter,
                TaskKind::Anpr => Capability::AnprPipeline,
            }),
            Some("ANPRModel") | Some("anpr") => Ok(Capability::AnprPipeline),
            Some("YOLOv11DetectionModel") | Some("detector") => Ok(Capability::Detector),
            Some("YOLOv11SegmentationModel") | Some("segmenter") => Ok(Capability::Segmenter),
            Some(other) => Err(Error::Config(format!("未知模型: {}", other))),
        }
    }
}

/// 视频源定位
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// 本地摄像头设备索引
    Device(u32),
    /// 文件路径 / 流地址 / 图片目录
    Uri(String),
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Device(index) => write!(f, "device:{}", index),
            SourceLocator::Uri(uri) => f.write_str(uri),
        }
    }
}

/// PTZ 控制端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtzEndpoint {
    /// 获取会话 Cookie 的页面地址, 同时作为 Origin
    pub base_url: String,
    /// 控制通道 (WebSocket) 地址
    pub control_url: String,
}

/// 单路摄像头描述, 加载后不可变
#[derive(Debug, Clone)]
pub struct CameraSpec {
    pub name: String,
    pub task: TaskKind,
    pub source: SourceLocator,
    pub kind: CameraKind,
    pub capability: Capability,
    pub ptz: Option<PtzEndpoint>,
}

// ========== 子系统参数 ==========

/// 帧流水线参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_stride: u64,             // 每隔几帧送一次推理
    pub handoff_capacity: usize,       // 采集→推理 通道容量
    pub max_consecutive_failures: u32, // 连续推理失败上限
    pub jpeg_quality: u8,
    pub display_buffer: usize, // 显示通道容量
    pub font_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_stride: 2,
            handoff_capacity: 10,
            max_consecutive_failures: 3,
            jpeg_quality: 80,
            display_buffer: 2,
            font_path: None,
        }
    }
}

/// 模型参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub object_model: PathBuf,
    pub segment_model: PathBuf,
    pub plate_model: PathBuf,
    pub ocr_model: PathBuf,
    pub ocr_charset: PathBuf,
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub ocr_min_confidence: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            object_model: PathBuf::from("models/yolo11n.onnx"),
            segment_model: PathBuf::from("models/yolo11n-seg.onnx"),
            plate_model: PathBuf::from("models/license_plate_detector.onnx"),
            ocr_model: PathBuf::from("models/en_PP-OCRv4_rec.onnx"),
            ocr_charset: PathBuf::from("models/en_dict.txt"),
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            ocr_min_confidence: 0.0,
        }
    }
}

/// 跟踪器参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_lost_frames: u32,
    pub high_score_threshold: f32,
    pub low_score_threshold: f32,
    pub high_iou_threshold: f32,
    pub low_iou_threshold: f32,
    pub kalman_process_noise: f32,
    pub kalman_obs_noise: f32,
    /// 检测框与跟踪框的匹配阈值(像素)
    pub match_threshold: f32,
    /// 普通检测任务是否也启用跟踪
    pub track_detections: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_lost_frames: 30,
            high_score_threshold: 0.4,
            low_score_threshold: 0.1,
            high_iou_threshold: 0.3,
            low_iou_threshold: 0.2,
            kalman_process_noise: 0.1,
            kalman_obs_noise: 0.5,
            match_threshold: 5.0,
            track_detections: true,
        }
    }
}

/// PTZ 控制参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PtzConfig {
    pub pan_speed: u32,
    pub zoom_in_speed: u32,
    pub zoom_out_speed: u32,
    pub heartbeat_secs: u64,
    pub timeout_secs: u64,
    pub mailbox_capacity: usize,
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            pan_speed: 30,
            zoom_in_speed: 5,
            zoom_out_speed: 30,
            heartbeat_secs: 30,
            timeout_secs: 10,
            mailbox_capacity: 16,
        }
    }
}

impl PtzConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

// ========== 顶层配置 ==========

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: PathBuf,
    pub cameras: Vec<CameraSpec>,
    pub pipeline: PipelineConfig,
    pub models: ModelConfig,
    pub tracker: TrackerConfig,
    pub ptz: PtzConfig,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    database: Option<PathBuf>,
    #[serde(default)]
    cameras: Vec<BTreeMap<String, RawCamera>>,
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    models: ModelConfig,
    #[serde(default)]
    tracker: TrackerConfig,
    #[serde(default)]
    ptz: PtzConfig,
}

#[derive(Deserialize)]
struct RawCamera {
    #[serde(rename = "type", default)]
    kind: CameraKind,
    source: RawSource,
    task: TaskKind,
    #[serde(default)]
    model_used: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSource {
    Index(u32),
    Text(String),
}

impl From<RawSource> for SourceLocator {
    fn from(raw: RawSource) -> Self {
        match raw {
            RawSource::Index(index) => SourceLocator::Device(index),
            RawSource::Text(text) => match text.trim().parse::<u32>() {
                Ok(index) => SourceLocator::Device(index),
                Err(_) => SourceLocator::Uri(text),
            },
        }
    }
}

impl AppConfig {
    /// 从YAML文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("读取 {} 失败: {}", path.display(), e)))?;
        let config = Self::from_yaml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            cameras = config.cameras.len(),
            "配置已加载"
        );
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)?;

        let mut names = HashSet::new();
        let mut cameras = Vec::new();
        for entry in raw.cameras {
            for (name, camera) in entry {
                if !names.insert(name.clone()) {
                    return Err(Error::Config(format!("摄像头名称重复: {}", name)));
                }
                cameras.push(camera.into_spec(name)?);
            }
        }

        Ok(Self {
            database: raw.database.unwrap_or_else(|| PathBuf::from("records.db")),
            cameras,
            pipeline: raw.pipeline,
            models: raw.models,
            tracker: raw.tracker,
            ptz: raw.ptz,
        })
    }

    pub fn camera(&self, name: &str) -> Option<&CameraSpec> {
        self.cameras.iter().find(|c| c.name == name)
    }
}

impl RawCamera {
    fn into_spec(self, name: String) -> Result<CameraSpec> {
        let capability = Capability::resolve(self.model_used.as_deref(), self.task)?;

        let ptz = if self.kind.has_ptz() {
            match (self.base_url, self.url) {
                (Some(base_url), Some(control_url)) => Some(PtzEndpoint {
                    base_url,
                    control_url,
                }),
                _ => {
                    return Err(Error::Config(format!(
                        "云台摄像头 {} 缺少 base_url/url",
                        name
                    )))
                }
            }
        } else {
            None
        };

        Ok(CameraSpec {
            name,
            task: self.task,
            source: self.source.into(),
            kind: self.kind,
            capability,
            ptz,
        })
    }
}
