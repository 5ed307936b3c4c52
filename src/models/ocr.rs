//! CTC 文字识别 (PP-OCR rec 模型)
//!
//! 输入 [1, 3, 48, W], 输出 [1, T, C]; 索引 0 为空白符, 其余对应字符表的行

use std::path::Path;

use anyhow::Context;
use image::{imageops, RgbImage};
use ndarray::{Array, Array4, ArrayView2, Ix3};

use super::OnnxModel;
use crate::detection::TextRecognizer;
use crate::error::{Error, Result};

const INPUT_HEIGHT: u32 = 48;
const MAX_WIDTH: u32 = 320;

pub struct CtcRecognizer {
    model: OnnxModel,
    charset: Vec<String>,
    min_confidence: f32,
}

impl CtcRecognizer {
    pub fn load(model: &Path, charset: &Path, min_confidence: f32) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(charset)
            .with_context(|| format!("读取字符表失败: {}", charset.display()))?;
        let mut charset: Vec<String> = text
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();
        // 模型末尾附带空格类
        charset.push(" ".to_string());

        Ok(Self {
            model: OnnxModel::load(model)?,
            charset,
            min_confidence,
        })
    }
}

impl TextRecognizer for CtcRecognizer {
    fn recognize(&mut self, crop: &RgbImage) -> Result<Vec<String>> {
        if crop.width() == 0 || crop.height() == 0 {
            return Ok(Vec::new());
        }
        let outputs = self.model.run(preprocess(crop))?;
        let probs = outputs
            .first()
            .ok_or_else(|| Error::Inference("识别模型没有输出".to_string()))?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::Inference(format!("识别输出维度异常: {}", e)))?;

        let (text, confidence) = ctc_greedy_decode(probs.index_axis(ndarray::Axis(0), 0), &self.charset);
        tracing::trace!(text = %text, confidence, "OCR");
        Ok(accept_read(&text, confidence, self.min_confidence)
            .into_iter()
            .collect())
    }
}

/// 空文本总是丢弃; 阈值为 0 时保留所有非空读数
fn accept_read(text: &str, confidence: f32, min_confidence: f32) -> Option<String> {
    let text = text.trim();
    if text.is_empty() || confidence < min_confidence {
        return None;
    }
    Some(text.to_string())
}

/// 等高缩放, 右侧补零; 归一化到 [-1, 1]
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let ratio = crop.width() as f32 / crop.height() as f32;
    let w = ((INPUT_HEIGHT as f32 * ratio).ceil() as u32).clamp(1, MAX_WIDTH);
    let resized = imageops::resize(crop, w, INPUT_HEIGHT, imageops::FilterType::Triangle);

    let mut input = Array::zeros((1, 3, INPUT_HEIGHT as usize, MAX_WIDTH as usize));
    for (x, y, rgb) in resized.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = (rgb[c] as f32 / 255.0 - 0.5) / 0.5;
        }
    }
    input
}

/// 逐步取最大类别, 合并重复并去掉空白; 返回文本与平均置信度
pub(crate) fn ctc_greedy_decode(probs: ArrayView2<f32>, charset: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut scores = Vec::new();
    let mut previous = 0usize;

    for step in probs.rows() {
        let (index, score) = step
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &p)| if p > best.1 { (i, p) } else { best });
        if index != 0 && index != previous {
            if let Some(ch) = charset.get(index - 1) {
                text.push_str(ch);
                scores.push(score);
            }
        }
        previous = index;
    }

    let confidence = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f32>() / scores.len() as f32
    };
    (text, confidence)
}
