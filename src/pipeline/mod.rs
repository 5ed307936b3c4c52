/// 帧流水线 (Frame Pipeline)
///
/// 每路摄像头两个线程:
/// - Capture:   读帧, 按步长投递推理, 每帧渲染输出 (不等待推理)
/// - Inference: 检测引擎处理, 发布最新结果, 写入事件
///
/// 两者通过有界通道 (满则丢帧) 与单槽结果单元交互
pub mod capture;
pub mod cell;
pub mod inference;
pub mod render;

pub use cell::LatestResult;
pub use render::{display_channel, FrameSink, Overlay, RenderedFrame, RenderedFrames};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;

use crate::config::{PipelineConfig, TaskKind};
use crate::detection::DetectionEngine;
use crate::error::Result;
use crate::input::FrameSource;
use crate::store::EventStore;
use capture::CaptureLoop;
use inference::InferenceLoop;

/// 运行计数, 运行中可随时读取
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub captured: AtomicU64,
    pub offered: AtomicU64,
    pub dropped: AtomicU64,
    pub rendered: AtomicU64,
    pub inferred: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub offered: u64,
    pub dropped: u64,
    pub rendered: u64,
    pub inferred: u64,
    pub failed: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            offered: self.offered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rendered: self.rendered.load(Ordering::Relaxed),
            inferred: self.inferred.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// 单路摄像头的流水线参数, 跨连接复用
#[derive(Clone)]
pub struct FramePipeline {
    pub camera: String,
    pub task: TaskKind,
    pub config: PipelineConfig,
    pub store: Arc<EventStore>,
    pub overlay: Arc<Overlay>,
    pub sink: FrameSink,
    /// "有新事件" 信号
    pub events: Sender<()>,
}

impl FramePipeline {
    /// 启动采集与推理线程
    pub fn start(
        &self,
        source: Box<dyn FrameSource>,
        engine: DetectionEngine,
    ) -> Result<PipelineHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let latest = Arc::new(LatestResult::new());
        let stats = Arc::new(PipelineStats::default());
        let (handoff_tx, handoff_rx) = bounded(self.config.handoff_capacity.max(1));
        let (lost_tx, lost_rx) = bounded(1);

        let inference = InferenceLoop {
            camera: self.camera.clone(),
            task: self.task,
            engine,
            handoff: handoff_rx,
            latest: latest.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            max_consecutive_failures: self.config.max_consecutive_failures.max(1),
            stats: stats.clone(),
            stop: stop.clone(),
        };
        let inference = std::thread::Builder::new()
            .name(format!("infer-{}", self.camera))
            .spawn(move || inference.run())?;

        let capture = CaptureLoop {
            camera: self.camera.clone(),
            source,
            frame_stride: self.config.frame_stride,
            handoff: handoff_tx,
            latest: latest.clone(),
            overlay: self.overlay.clone(),
            sink: self.sink.clone(),
            stats: stats.clone(),
            stop: stop.clone(),
            source_lost: lost_tx,
        };
        let capture = match std::thread::Builder::new()
            .name(format!("capture-{}", self.camera))
            .spawn(move || capture.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::Release);
                let _ = inference.join();
                return Err(e.into());
            }
        };

        tracing::info!(camera = %self.camera, task = self.task.as_str(), "▶️ 流水线已启动");
        Ok(PipelineHandle {
            camera: self.camera.clone(),
            stop,
            capture: Some(capture),
            inference: Some(inference),
            latest,
            stats,
            source_lost: lost_rx,
        })
    }
}

/// 运行中的流水线
pub struct PipelineHandle {
    camera: String,
    stop: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    inference: Option<JoinHandle<DetectionEngine>>,
    latest: Arc<LatestResult>,
    stats: Arc<PipelineStats>,
    source_lost: Receiver<()>,
}

impl PipelineHandle {
    pub fn latest(&self) -> &Arc<LatestResult> {
        &self.latest
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// 视频源中断时收到一次通知; 正常停止时通道关闭
    pub fn source_lost(&self) -> Receiver<()> {
        self.source_lost.clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn is_inferring(&self) -> bool {
        self.inference.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 停止两个线程并等待退出; 返回后不会再处理任何帧
    pub fn stop(mut self) -> Option<DetectionEngine> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<DetectionEngine> {
        self.stop.store(true, Ordering::Release);

        if let Some(capture) = self.capture.take() {
            if capture.join().is_err() {
                tracing::error!(camera = %self.camera, "采集线程异常退出");
            }
        }
        let engine = match self.inference.take()?.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                tracing::error!(camera = %self.camera, "推理线程异常退出");
                None
            }
        };

        tracing::info!(camera = %self.camera, "⏹️ 流水线已停止");
        engine
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.capture.is_some() || self.inference.is_some() {
            self.shutdown();
        }
    }
}
