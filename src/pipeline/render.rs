//! 渲染: 原始帧 + 最新推理结果 → 标注 → JPEG → 显示通道

use std::path::Path;
use std::time::Duration;

use ab_glyph::{FontVec, PxScale};
use base64::Engine as _;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detection::{Frame, InferenceResult};
use crate::error::{Error, Result};

const OBJECT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const PLATE_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const LABEL_SCALE: f32 = 20.0;

/// 编码后的显示帧
#[derive(Clone, Debug)]
pub struct RenderedFrame {
    pub camera: String,
    pub seq: u64,
    pub jpeg: Vec<u8>,
}

impl RenderedFrame {
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.jpeg)
    }
}

/// 标注样式; 没有字体时只画框
pub struct Overlay {
    font: Option<FontVec>,
    jpeg_quality: u8,
}

impl Overlay {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            font: None,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn with_font_file(mut self, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| Error::Config(format!("字体 {} 无效: {}", path.display(), e)))?;
        self.font = Some(font);
        Ok(self)
    }

    /// 在帧副本上绘制标注
    pub fn annotate(&self, image: &RgbImage, result: Option<&InferenceResult>) -> RgbImage {
        let mut canvas = image.clone();
        let Some(result) = result else {
            return canvas;
        };

        for object in &result.objects {
            let b = &object.bbox;
            self.draw_box(&mut canvas, b.x1, b.y1, b.x2, b.y2, OBJECT_COLOR);

            let label = match object.track_id {
                Some(id) => format!("{} {} {:.2}", object.label, id, object.confidence),
                None => format!("{} {:.2}", object.label, object.confidence),
            };
            self.draw_label(&mut canvas, b.x1, b.y1 - 10.0, &label, OBJECT_COLOR);

            // 车牌坐标相对于车辆裁剪图
            for plate in &object.plates {
                let p = &plate.bbox;
                let (x1, y1) = (b.x1 + p.x1, b.y1 + p.y1);
                let (x2, y2) = (b.x1 + p.x2, b.y1 + p.y2);
                self.draw_box(&mut canvas, x1, y1, x2, y2, PLATE_COLOR);
                if !plate.formatted.is_empty() {
                    self.draw_label(&mut canvas, x1, y2 + 2.0, &plate.formatted, PLATE_COLOR);
                }
            }
        }
        canvas
    }

    pub fn encode(&self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality).encode_image(image)?;
        Ok(jpeg)
    }

    pub fn render(
        &self,
        camera: &str,
        frame: &Frame,
        result: Option<&InferenceResult>,
    ) -> Result<RenderedFrame> {
        let canvas = self.annotate(&frame.image, result);
        Ok(RenderedFrame {
            camera: camera.to_string(),
            seq: frame.seq,
            jpeg: self.encode(&canvas)?,
        })
    }

    fn draw_box(&self, canvas: &mut RgbImage, x1: f32, y1: f32, x2: f32, y2: f32, color: Rgb<u8>) {
        let w = (x2 - x1).round() as i64;
        let h = (y2 - y1).round() as i64;
        if w <= 0 || h <= 0 {
            return;
        }
        let rect = Rect::at(x1.round() as i32, y1.round() as i32).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }

    fn draw_label(&self, canvas: &mut RgbImage, x: f32, y: f32, text: &str, color: Rgb<u8>) {
        if let Some(font) = self.font.as_ref() {
            let y = y.max(0.0);
            draw_text_mut(
                canvas,
                color,
                x.round() as i32,
                y.round() as i32,
                PxScale::from(LABEL_SCALE),
                font,
                text,
            );
        }
    }
}

// ========== 显示通道 ==========

/// 显示通道: 满时丢弃最旧帧, 消费者总能拿到最新画面
pub fn display_channel(capacity: usize) -> (FrameSink, RenderedFrames) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        FrameSink {
            tx,
            overflow: rx.clone(),
        },
        RenderedFrames { rx },
    )
}

#[derive(Clone)]
pub struct FrameSink {
    tx: Sender<RenderedFrame>,
    overflow: Receiver<RenderedFrame>,
}

impl FrameSink {
    pub fn push(&self, frame: RenderedFrame) {
        let mut pending = frame;
        // 与消费者竞争时最多重试一次
        for _ in 0..2 {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.overflow.try_recv();
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// 渲染帧序列: 跨越多次连接, 断开期间阻塞等待
#[derive(Clone)]
pub struct RenderedFrames {
    rx: Receiver<RenderedFrame>,
}

impl RenderedFrames {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RenderedFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_next(&self) -> Option<RenderedFrame> {
        self.rx.try_recv().ok()
    }
}

impl Iterator for RenderedFrames {
    type Item = RenderedFrame;

    fn next(&mut self) -> Option<RenderedFrame> {
        self.rx.recv().ok()
    }
}
