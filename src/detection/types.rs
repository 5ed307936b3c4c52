/// 检测系统数据结构定义
/// Data structures for the detection system
use chrono::{DateTime, Local};
use image::RgbImage;
use std::sync::Arc;

// ========== 类别表 ==========

/// COCO 80 类别名称 (按模型输出 class_id 排列)
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// 需要做车牌识别的车辆类别
pub const VEHICLE_CLASSES: [&str; 6] = ["car", "motorcycle", "airplane", "bus", "train", "truck"];

/// 类别名称, 超出范围时返回 `class_{id}`
pub fn coco_label(class_id: u32) -> String {
    COCO_CLASSES
        .get(class_id as usize)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("class_{}", class_id))
}

// ========== 数据结构 ==========

/// 检测框 (Detection bounding box), 源图像素坐标
#[derive(Clone, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence: 1.0,
            class_id: 0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn coords(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// 裁剪到图像范围内的整数像素区域 (x, y, w, h); 空区域返回 None
    pub fn pixel_region(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.max(0.0).floor() as u32;
        let y1 = self.y1.max(0.0).floor() as u32;
        let x2 = (self.x2.max(0.0).ceil() as u32).min(width);
        let y2 = (self.y2.max(0.0).ceil() as u32).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// 检测器原始输出: 检测框 + 类别名称
#[derive(Clone, Debug)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
}

/// 已解码帧 (采集线程 → 推理线程/渲染)
#[derive(Clone, Debug)]
pub struct Frame {
    /// 单次连接内严格递增, 从1开始
    pub seq: u64,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(seq: u64, image: RgbImage) -> Self {
        Self {
            seq,
            image: Arc::new(image),
        }
    }
}

/// 车牌检测结果, 坐标相对于所属目标的裁剪图
#[derive(Clone, Debug, PartialEq)]
pub struct PlateDetection {
    pub bbox: BBox,
    pub raw_text: String,
    /// 规范化车牌, 无效时为空串
    pub formatted: String,
}

/// 单个检测目标 (每次推理新建, 创建后不再修改)
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedObject {
    pub bbox: BBox,
    pub label: String,
    pub confidence: f32,
    pub track_id: Option<u64>,
    pub plates: Vec<PlateDetection>,
}

impl DetectedObject {
    pub fn is_vehicle(&self) -> bool {
        VEHICLE_CLASSES.contains(&self.label.as_str())
    }
}

/// 推理结果 (推理线程 → 渲染)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InferenceResult {
    /// 来源帧序号
    pub seq: u64,
    pub objects: Vec<DetectedObject>,
}

/// 检测事件 (写入事件存储)
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionEvent {
    pub timestamp: DateTime<Local>,
    pub track_id: Option<u64>,
    pub object_type: String,
    /// 车牌号, 非车牌事件为空串
    pub plate: String,
}

impl DetectionEvent {
    pub fn new(track_id: Option<u64>, object_type: impl Into<String>, plate: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            track_id,
            object_type: object_type.into(),
            plate: plate.into(),
        }
    }

    /// 写库用的ID文本, 未分配跟踪ID时为空串
    pub fn id_text(&self) -> String {
        self.track_id.map(|id| id.to_string()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_region_clamps_to_image() {
        let b = BBox::new(-5.0, 10.2, 700.0, 50.0);
        assert_eq!(b.pixel_region(640, 480), Some((0, 10, 640, 40)));
        assert_eq!(BBox::new(10.0, 10.0, 10.0, 20.0).pixel_region(640, 480), None);
        assert_eq!(BBox::new(700.0, 10.0, 800.0, 20.0).pixel_region(640, 480), None);
    }

    #[test]
    fn vehicle_subset_and_labels() {
        assert_eq!(coco_label(2), "car");
        assert_eq!(coco_label(200), "class_200");
        let mut obj = DetectedObject {
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            label: "truck".into(),
            confidence: 0.9,
            track_id: None,
            plates: vec![],
        };
        assert!(obj.is_vehicle());
        obj.label = "person".into();
        assert!(!obj.is_vehicle());
    }
}
