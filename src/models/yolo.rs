// YOLO 检测 / 分割 / 车牌检测
// 输出: [1, 4 + nc (+ nm), N], 前4行为 cx, cy, w, h (输入尺度)

use std::path::Path;

use image::{imageops, RgbImage};
use ndarray::{Array, Array4, ArrayD, Ix3};

use super::{non_max_suppression, OnnxModel};
use crate::detection::types::coco_label;
use crate::detection::{BBox, Detection, ObjectDetector, PlateDetector};
use crate::error::{Error, Result};

const CXYWH_OFFSET: usize = 4;
/// 分割模型的掩码系数个数
const MASK_COEFFICIENTS: usize = 32;
const PAD_VALUE: f32 = 144.0 / 255.0;

pub struct YoloDetector {
    model: OnnxModel,
    input_size: u32,
    conf: f32,
    iou: f32,
    fixed_label: Option<&'static str>,
    name: String,
}

impl YoloDetector {
    pub fn load(path: &Path, input_size: u32, conf: f32, iou: f32) -> anyhow::Result<Self> {
        let model = OnnxModel::load(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "yolo".to_string());
        Ok(Self {
            model,
            input_size: input_size.max(32),
            conf,
            iou,
            fixed_label: None,
            name,
        })
    }

    /// 单类别模型 (如车牌检测) 使用固定标签
    pub fn with_fixed_label(mut self, label: &'static str) -> Self {
        self.fixed_label = Some(label);
        self
    }

    fn mask_coefficients(&self) -> usize {
        // 第二个输出为原型掩码
        if self.model.output_count() > 1 {
            MASK_COEFFICIENTS
        } else {
            0
        }
    }

    /// 返回源图坐标的检测框
    pub fn infer(&mut self, image: &RgbImage) -> Result<Vec<BBox>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, ratio) = letterbox(image, self.input_size);
        let outputs = self.model.run(input)?;
        let preds = outputs
            .first()
            .ok_or_else(|| Error::Inference(format!("{} 没有输出", self.model.path().display())))?;

        let mut boxes = decode(
            preds,
            ratio,
            image.width() as f32,
            image.height() as f32,
            self.conf,
            self.mask_coefficients(),
        )?;
        non_max_suppression(&mut boxes, self.iou);
        Ok(boxes)
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let fixed = self.fixed_label;
        Ok(self
            .infer(image)?
            .into_iter()
            .map(|bbox| Detection {
                label: fixed
                    .map(str::to_string)
                    .unwrap_or_else(|| coco_label(bbox.class_id)),
                bbox,
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl PlateDetector for YoloDetector {
    fn detect_plates(&mut self, crop: &RgbImage) -> Result<Vec<BBox>> {
        self.infer(crop)
    }
}

/// 等比缩放到左上角, 其余填充; 返回张量与缩放比
fn letterbox(image: &RgbImage, size: u32) -> (Array4<f32>, f32) {
    let (w0, h0) = (image.width() as f32, image.height() as f32);
    let ratio = (size as f32 / w0).min(size as f32 / h0);
    let w = ((w0 * ratio).round() as u32).clamp(1, size);
    let h = ((h0 * ratio).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, w, h, imageops::FilterType::Triangle);

    let s = size as usize;
    let mut input = Array::from_elem((1, 3, s, s), PAD_VALUE);
    for (x, y, rgb) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        input[[0, 0, y, x]] = rgb[0] as f32 / 255.0;
        input[[0, 1, y, x]] = rgb[1] as f32 / 255.0;
        input[[0, 2, y, x]] = rgb[2] as f32 / 255.0;
    }
    (input, ratio)
}

fn decode(
    preds: &ArrayD<f32>,
    ratio: f32,
    width: f32,
    height: f32,
    conf: f32,
    mask_coefficients: usize,
) -> Result<Vec<BBox>> {
    let preds = preds
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| Error::Inference(format!("检测输出维度异常: {}", e)))?;
    let (_, channels, anchors) = preds.dim();
    if channels <= CXYWH_OFFSET + mask_coefficients {
        return Err(Error::Inference(format!("检测输出通道数异常: {}", channels)));
    }
    let nc = channels - CXYWH_OFFSET - mask_coefficients;

    let mut boxes = Vec::new();
    for i in 0..anchors {
        let (class_id, confidence) = (0..nc)
            .map(|c| (c, preds[[0, CXYWH_OFFSET + c, i]]))
            .fold((0, f32::MIN), |best, x| if x.1 > best.1 { x } else { best });
        if confidence < conf {
            continue;
        }

        let cx = preds[[0, 0, i]] / ratio;
        let cy = preds[[0, 1, i]] / ratio;
        let w = preds[[0, 2, i]] / ratio;
        let h = preds[[0, 3, i]] / ratio;
        boxes.push(BBox {
            x1: (cx - w / 2.0).clamp(0.0, width),
            y1: (cy - h / 2.0).clamp(0.0, height),
            x2: (cx + w / 2.0).clamp(0.0, width),
            y2: (cy + h / 2.0).clamp(0.0, height),
            confidence,
            class_id: class_id as u32,
        });
    }
    Ok(boxes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn letterbox_keeps_aspect_ratio_in_top_left() {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 0, 0]));
        let (input, ratio) = letterbox(&image, 64);
        assert!((ratio - 0.32).abs() < 1e-6);
        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert_eq!(input[[0, 0, 0, 0]], 1.0);
        assert_eq!(input[[0, 0, 63, 0]], PAD_VALUE);
    }

    #[test]
    fn decode_rescales_and_filters() {
        // 2 个类别, 3 个候选
        let mut preds = ArrayD::<f32>::zeros(vec![1, 6, 3]);
        let rows = [
            [32.0, 32.0, 16.0, 8.0, 0.1, 0.9],
            [10.0, 10.0, 4.0, 4.0, 0.2, 0.1],
            [60.0, 2.0, 20.0, 20.0, 0.8, 0.0],
        ];
        for (i, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                preds[[0, c, i]] = *v;
            }
        }
        let boxes = decode(&preds, 0.5, 100.0, 100.0, 0.25, 0).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].class_id, 1);
        assert_eq!(boxes[0].coords(), [48.0, 56.0, 80.0, 72.0]);
        // 越界部分被裁剪
        assert_eq!(boxes[1].y1, 0.0);
        assert_eq!(boxes[1].x2, 100.0);
    }
}
