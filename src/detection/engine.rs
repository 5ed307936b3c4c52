//! 检测引擎 (DetectionEngine)
//!
//! 组合检测器、跟踪器、车牌检测器与文字识别器, 完成
//! 检测 → 跟踪 → 车牌检测 → OCR → 规范化 的整条链路。
//! 各能力只通过 trait 调用, 具体模型实现见 `models` 模块。

use image::{imageops, RgbImage};

use super::plate::PlateFormatter;
use super::tracker::{match_track, Tracker};
use super::types::{BBox, DetectedObject, Detection, Frame, InferenceResult, PlateDetection};
use crate::config::{CameraSpec, Capability};
use crate::error::{Error, Result};

// ========== 能力接口 ==========

/// 目标检测/分割模型
pub trait ObjectDetector: Send {
    /// 返回源图像素坐标下的检测结果
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// 车牌检测模型, 输入为车辆裁剪图
pub trait PlateDetector: Send {
    /// 返回相对裁剪图的车牌框
    fn detect_plates(&mut self, crop: &RgbImage) -> Result<Vec<BBox>>;
}

/// 文字识别引擎
pub trait TextRecognizer: Send {
    /// 按引擎顺序返回识别出的文本行
    fn recognize(&mut self, crop: &RgbImage) -> Result<Vec<String>>;
}

/// 按摄像头描述构建检测引擎
pub trait EngineFactory: Send + Sync {
    fn build(&self, spec: &CameraSpec) -> Result<DetectionEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(&CameraSpec) -> Result<DetectionEngine> + Send + Sync,
{
    fn build(&self, spec: &CameraSpec) -> Result<DetectionEngine> {
        self(spec)
    }
}

// ========== 检测引擎 ==========

/// 默认检测框/跟踪框匹配阈值(像素)
pub const DEFAULT_MATCH_THRESHOLD: f32 = 5.0;

pub struct DetectionEngine {
    capability: Capability,
    detector: Box<dyn ObjectDetector>,
    plates: Option<Box<dyn PlateDetector>>,
    ocr: Option<Box<dyn TextRecognizer>>,
    tracker: Option<Box<dyn Tracker>>,
    match_threshold: f32,
    formatter: PlateFormatter,
}

impl DetectionEngine {
    pub fn new(capability: Capability, detector: Box<dyn ObjectDetector>) -> Self {
        Self {
            capability,
            detector,
            plates: None,
            ocr: None,
            tracker: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            formatter: PlateFormatter,
        }
    }

    pub fn with_tracker(mut self, tracker: Box<dyn Tracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_plate_reader(
        mut self,
        plates: Box<dyn PlateDetector>,
        ocr: Box<dyn TextRecognizer>,
    ) -> Self {
        self.plates = Some(plates);
        self.ocr = Some(ocr);
        self
    }

    pub fn with_match_threshold(mut self, threshold: f32) -> Self {
        self.match_threshold = threshold.max(0.0);
        self
    }

    /// ANPR 需要跟踪器、车牌检测器和文字识别器齐全
    pub fn validate(self) -> Result<Self> {
        if self.capability == Capability::AnprPipeline
            && (self.tracker.is_none() || self.plates.is_none() || self.ocr.is_none())
        {
            return Err(Error::Config(
                "ANPR 需要跟踪器、车牌检测器和文字识别器".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// 新连接开始前清空跟踪状态
    pub fn reset(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.reset();
        }
    }

    /// 主检测 (+ 跟踪ID关联)
    pub fn detect_objects(&mut self, frame: &Frame) -> Result<Vec<DetectedObject>> {
        let detections = self.detector.detect(&frame.image)?;

        let tracks = match self.tracker.as_mut() {
            Some(tracker) if !detections.is_empty() => {
                let boxes: Vec<BBox> = detections.iter().map(|d| d.bbox.clone()).collect();
                tracker.update(&boxes)
            }
            _ => Vec::new(),
        };

        Ok(detections
            .into_iter()
            .map(|d| DetectedObject {
                track_id: match_track(&d.bbox, &tracks, self.match_threshold),
                confidence: d.bbox.confidence,
                bbox: d.bbox,
                label: d.label,
                plates: Vec::new(),
            })
            .collect())
    }

    /// 车辆裁剪 → 车牌检测 → 车牌裁剪 → OCR → 规范化
    pub fn detect_plates(
        &mut self,
        object: &DetectedObject,
        frame: &Frame,
    ) -> Result<Vec<PlateDetection>> {
        if !object.is_vehicle() {
            return Ok(Vec::new());
        }
        let (Some(plates), Some(ocr)) = (self.plates.as_mut(), self.ocr.as_mut()) else {
            return Ok(Vec::new());
        };

        let image = &*frame.image;
        let Some((x, y, w, h)) = object.bbox.pixel_region(image.width(), image.height()) else {
            return Ok(Vec::new());
        };
        let vehicle = imageops::crop_imm(image, x, y, w, h).to_image();

        let mut found = Vec::new();
        for plate_box in plates.detect_plates(&vehicle)? {
            let Some((px, py, pw, ph)) = plate_box.pixel_region(w, h) else {
                continue;
            };
            let plate_crop = imageops::crop_imm(&vehicle, px, py, pw, ph).to_image();

            let raw_text: String = ocr
                .recognize(&plate_crop)?
                .into_iter()
                .filter(|line| !line.is_empty())
                .collect();
            let formatted = if raw_text.is_empty() {
                String::new()
            } else {
                self.formatter.format(&raw_text)
            };

            tracing::trace!(raw = %raw_text, formatted = %formatted, "车牌识别");
            found.push(PlateDetection {
                bbox: plate_box,
                raw_text,
                formatted,
            });
        }
        Ok(found)
    }

    /// 完整处理一帧
    pub fn process(&mut self, frame: &Frame) -> Result<InferenceResult> {
        let mut objects = self.detect_objects(frame)?;

        if self.capability == Capability::AnprPipeline {
            for i in 0..objects.len() {
                let plates = self.detect_plates(&objects[i], frame)?;
                objects[i].plates = plates;
            }
        }

        Ok(InferenceResult {
            seq: frame.seq,
            objects,
        })
    }
}
