//! 采集线程: 读帧 → 按步长交给推理 → 渲染每一帧

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};

use super::cell::LatestResult;
use super::render::{FrameSink, Overlay};
use super::PipelineStats;
use crate::detection::Frame;
use crate::input::FrameSource;

pub(crate) struct CaptureLoop {
    pub camera: String,
    pub source: Box<dyn FrameSource>,
    pub frame_stride: u64,
    pub handoff: Sender<Frame>,
    pub latest: Arc<LatestResult>,
    pub overlay: Arc<Overlay>,
    pub sink: FrameSink,
    pub stats: Arc<PipelineStats>,
    pub stop: Arc<AtomicBool>,
    pub source_lost: Sender<()>,
}

impl CaptureLoop {
    pub fn run(mut self) {
        tracing::info!(camera = %self.camera, source = %self.source.describe(), "📹 采集线程启动");

        let stride = self.frame_stride.max(1);
        let mut seq = 0u64;
        let mut count = 0u32;
        let mut last = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            let image = match self.source.read() {
                Ok(image) => image,
                Err(e) => {
                    if !self.stop.load(Ordering::Acquire) {
                        tracing::error!(camera = %self.camera, error = %e, "❌ 视频源中断");
                        let _ = self.source_lost.try_send(());
                    }
                    break;
                }
            };

            // stop() 之后读到的帧不再处理
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            seq += 1;
            let frame = Frame::new(seq, image);
            self.stats.captured.fetch_add(1, Ordering::Relaxed);

            if seq % stride == 0 {
                self.stats.offered.fetch_add(1, Ordering::Relaxed);
                match self.handoff.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    // 推理线程已退出, 继续输出原始画面
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }

            let result = self.latest.snapshot();
            match self.overlay.render(&self.camera, &frame, result.as_deref()) {
                Ok(rendered) => {
                    self.sink.push(rendered);
                    self.stats.rendered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => tracing::warn!(camera = %self.camera, seq, error = %e, "渲染失败"),
            }

            count += 1;
            if last.elapsed().as_secs_f64() >= 1.0 {
                tracing::debug!(
                    camera = %self.camera,
                    fps = format!("{:.1}", count as f64 / last.elapsed().as_secs_f64()),
                    dropped = self.stats.dropped.load(Ordering::Relaxed),
                    "📺 采集统计"
                );
                count = 0;
                last = Instant::now();
            }
        }

        tracing::info!(camera = %self.camera, frames = seq, "采集线程退出");
        // source 在此释放
    }
}
