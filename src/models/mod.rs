/// ONNX 模型实现 (需启用 `onnx` 特性)
///
/// - YoloDetector:  YOLO 检测/分割/车牌检测, 实现 ObjectDetector + PlateDetector
/// - CtcRecognizer: CTC 文字识别 (PP-OCR rec), 实现 TextRecognizer
/// - OnnxEngineFactory: 按摄像头能力组装 DetectionEngine
///
/// ## 核心流程
/// ```text
/// RgbImage → preprocess → NCHW 张量 → Session::run → 原始输出 → postprocess
/// ```
pub mod ocr;
pub mod yolo;

pub use ocr::CtcRecognizer;
pub use yolo::YoloDetector;

use std::path::{Path, PathBuf};

use anyhow::Context;
use ndarray::{Array4, ArrayD, ArrayViewD};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use crate::config::{CameraSpec, Capability, ModelConfig, TrackerConfig};
use crate::detection::{compute_iou, BBox, ByteTracker, DetectionEngine, EngineFactory};
use crate::error::{Error, Result};

/// 单输入模型会话
pub struct OnnxModel {
    session: Session,
    input: String,
    outputs: Vec<String>,
    path: PathBuf,
}

impl OnnxModel {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

        #[cfg(feature = "cuda")]
        let builder = builder.with_execution_providers([
            ort::execution_providers::CUDAExecutionProvider::default().build(),
        ])?;

        let session = builder
            .commit_from_file(path)
            .with_context(|| format!("加载模型失败: {}", path.display()))?;

        let input = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("模型没有输入")?;
        let outputs: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if outputs.is_empty() {
            anyhow::bail!("模型没有输出: {}", path.display());
        }

        tracing::info!(model = %path.display(), input = %input, outputs = ?outputs, "✅ 模型加载成功");
        Ok(Self {
            session,
            input,
            outputs,
            path: path.to_path_buf(),
        })
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 前向推理, 按输出顺序返回
    pub fn run(&mut self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input.as_str() => tensor])?;

        let mut ys = Vec::with_capacity(self.outputs.len());
        for name in &self.outputs {
            let view: ArrayViewD<f32> = outputs[name.as_str()].try_extract_array()?;
            ys.push(view.into_owned());
        }
        Ok(ys)
    }
}

/// 按类别分别做 NMS, 置信度降序保留; 不同类别的重叠框互不抑制
pub fn non_max_suppression(boxes: &mut Vec<BBox>, iou_threshold: f32) {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..boxes.len() {
        let overlaps = (0..kept).any(|prev| {
            boxes[prev].class_id == boxes[index].class_id
                && compute_iou(&boxes[prev], &boxes[index]) > iou_threshold
        });
        if !overlaps {
            boxes.swap(kept, index);
            kept += 1;
        }
    }
    boxes.truncate(kept);
}

/// 按摄像头能力加载模型
#[derive(Clone, Debug, Default)]
pub struct OnnxEngineFactory {
    pub models: ModelConfig,
    pub tracker: TrackerConfig,
}

impl OnnxEngineFactory {
    pub fn new(models: ModelConfig, tracker: TrackerConfig) -> Self {
        Self { models, tracker }
    }

    fn yolo(&self, path: &Path, label: Option<&'static str>) -> Result<YoloDetector> {
        let m = &self.models;
        let detector = YoloDetector::load(path, m.input_size, m.conf_threshold, m.iou_threshold)
            .map_err(|e| Error::Config(format!("{:#}", e)))?;
        Ok(match label {
            Some(label) => detector.with_fixed_label(label),
            None => detector,
        })
    }

    fn tracker(&self) -> Box<ByteTracker> {
        Box::new(ByteTracker::new(self.tracker.clone()))
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn build(&self, spec: &CameraSpec) -> Result<DetectionEngine> {
        let m = &self.models;
        let engine = match spec.capability {
            Capability::Detector => {
                let engine = DetectionEngine::new(
                    Capability::Detector,
                    Box::new(self.yolo(&m.object_model, None)?),
                );
                if self.tracker.track_detections {
                    engine.with_tracker(self.tracker())
                } else {
                    engine
                }
            }
            Capability::Segmenter => DetectionEngine::new(
                Capability::Segmenter,
                Box::new(self.yolo(&m.segment_model, None)?),
            ),
            Capability::AnprPipeline => {
                let ocr = CtcRecognizer::load(&m.ocr_model, &m.ocr_charset, m.ocr_min_confidence)
                    .map_err(|e| Error::Config(format!("{:#}", e)))?;
                DetectionEngine::new(
                    Capability::AnprPipeline,
                    Box::new(self.yolo(&m.object_model, None)?),
                )
                .with_tracker(self.tracker())
                .with_plate_reader(
                    Box::new(self.yolo(&m.plate_model, Some("license_plate"))?),
                    Box::new(ocr),
                )
            }
        };

        tracing::info!(camera = %spec.name, capability = ?spec.capability, "检测引擎已创建");
        engine
            .with_match_threshold(self.tracker.match_threshold)
            .validate()
    }
}
