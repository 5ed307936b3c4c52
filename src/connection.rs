//! 连接管理: 视频源 + 云台会话 + 流水线 作为一个整体连接/断开
//!
//! ```text
//! Disconnected --toggle--> Connecting --> Connected --toggle--> Disconnecting --> Disconnected
//! ```
//!
//! 过渡状态中的 toggle 不做任何事。状态切换在锁内完成, 慢操作 (打开设备、握手、
//! 等待线程退出) 在锁外执行。

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crossbeam_channel::{bounded, Receiver};

use crate::config::{CameraSpec, PipelineConfig, PtzConfig};
use crate::detection::{DetectionEngine, EngineFactory, InferenceResult};
use crate::error::Result;
use crate::input::SourceOpener;
use crate::pipeline::{
    display_channel, FramePipeline, Overlay, PipelineHandle, RenderedFrames, StatsSnapshot,
};
use crate::ptz::{ControlConnector, PtzController};
use crate::store::{EventRecord, EventStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(text)
    }
}

/// 各路摄像头共享的服务
#[derive(Clone)]
pub struct Services {
    pub store: Arc<EventStore>,
    pub opener: Arc<dyn SourceOpener>,
    pub engines: Arc<dyn EngineFactory>,
    pub connector: Arc<dyn ControlConnector>,
    pub overlay: Arc<Overlay>,
    pub pipeline: PipelineConfig,
    pub ptz: PtzConfig,
}

struct Slot {
    state: ConnectionState,
    running: Option<PipelineHandle>,
    /// 断开后保留的引擎, 下次连接复用
    engine: Option<DetectionEngine>,
    generation: u64,
}

struct ManagerInner {
    spec: CameraSpec,
    pipeline: FramePipeline,
    opener: Arc<dyn SourceOpener>,
    engines: Arc<dyn EngineFactory>,
    ptz: Option<PtzController>,
    frames: RenderedFrames,
    events: Receiver<()>,
    slot: Mutex<Slot>,
}

pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// 初始化事件表 (清空旧记录); 不自动连接
    pub fn new(spec: CameraSpec, services: &Services) -> Result<Self> {
        services.store.ensure_schema(&spec.name, spec.task)?;

        let (sink, frames) = display_channel(services.pipeline.display_buffer);
        let (events_tx, events) = bounded(1);

        let ptz = match (&spec.ptz, spec.kind.has_ptz()) {
            (Some(endpoint), true) => Some(PtzController::new(
                &spec.name,
                spec.kind,
                endpoint.clone(),
                &services.ptz,
                services.connector.clone(),
            )),
            _ => None,
        };

        let pipeline = FramePipeline {
            camera: spec.name.clone(),
            task: spec.task,
            config: services.pipeline.clone(),
            store: services.store.clone(),
            overlay: services.overlay.clone(),
            sink,
            events: events_tx,
        };

        Ok(Self {
            inner: Arc::new(ManagerInner {
                spec,
                pipeline,
                opener: services.opener.clone(),
                engines: services.engines.clone(),
                ptz,
                frames,
                events,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    running: None,
                    engine: None,
                    generation: 0,
                }),
            }),
        })
    }

    pub fn camera(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn spec(&self) -> &CameraSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// 连接/断开切换, 返回调用结束时的状态
    pub fn toggle(&self) -> ConnectionState {
        let next = {
            let mut slot = self.inner.lock();
            match slot.state {
                ConnectionState::Disconnected => {
                    slot.state = ConnectionState::Connecting;
                    ConnectionState::Connecting
                }
                ConnectionState::Connected => {
                    slot.state = ConnectionState::Disconnecting;
                    ConnectionState::Disconnecting
                }
                busy => {
                    tracing::debug!(camera = %self.camera(), state = %busy, "过渡状态, 忽略切换");
                    return busy;
                }
            }
        };

        match next {
            ConnectionState::Connecting => {
                // 失败已记录日志并回到 Disconnected
                let _ = ManagerInner::establish(&self.inner);
            }
            _ => self.inner.teardown(),
        }
        self.state()
    }

    /// 未连接时连接
    pub fn connect(&self) -> Result<()> {
        {
            let mut slot = self.inner.lock();
            if slot.state != ConnectionState::Disconnected {
                return Ok(());
            }
            slot.state = ConnectionState::Connecting;
        }
        ManagerInner::establish(&self.inner)
    }

    /// 已连接时断开
    pub fn disconnect(&self) {
        {
            let mut slot = self.inner.lock();
            if slot.state != ConnectionState::Connected {
                return;
            }
            slot.state = ConnectionState::Disconnecting;
        }
        self.inner.teardown();
    }

    /// 显示帧序列, 跨连接持续有效
    pub fn frames(&self) -> RenderedFrames {
        self.inner.frames.clone()
    }

    /// "有新事件" 信号
    pub fn events(&self) -> Receiver<()> {
        self.inner.events.clone()
    }

    pub fn latest_result(&self) -> Option<Arc<InferenceResult>> {
        let slot = self.inner.lock();
        slot.running.as_ref().and_then(|h| h.latest().snapshot())
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.inner.lock().running.as_ref().map(PipelineHandle::stats)
    }

    pub fn ptz(&self) -> Option<&PtzController> {
        self.inner.ptz.as_ref()
    }

    pub fn fetch_latest(&self, n: usize) -> Result<Vec<EventRecord>> {
        self.inner.pipeline.store.fetch_latest(self.camera(), n)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock().state = state;
    }

    /// Connecting → Connected / Disconnected
    fn establish(this: &Arc<Self>) -> Result<()> {
        let camera = this.spec.name.as_str();
        tracing::info!(camera, source = %this.spec.source, "🔌 正在连接");

        let source = match this.opener.open(&this.spec.source) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(camera, error = %e, "❌ 视频源打开失败");
                this.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let cached = this.lock().engine.take();
        let mut engine = match cached {
            Some(engine) => engine,
            None => match this.engines.build(&this.spec) {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(camera, error = %e, "❌ 检测引擎创建失败");
                    this.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            },
        };
        engine.reset();

        if let Some(ptz) = this.ptz.as_ref() {
            if let Err(e) = ptz.open() {
                tracing::warn!(camera, error = %e, "⚠️ 云台握手失败, 仅视频模式");
            }
        }

        let handle = match this.pipeline.start(source, engine) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(camera, error = %e, "❌ 流水线启动失败");
                if let Some(ptz) = this.ptz.as_ref() {
                    ptz.close();
                }
                this.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let lost = handle.source_lost();

        let generation = {
            let mut slot = this.lock();
            slot.generation += 1;
            slot.running = Some(handle);
            slot.state = ConnectionState::Connected;
            slot.generation
        };

        let weak = Arc::downgrade(this);
        let spawned = std::thread::Builder::new()
            .name(format!("watch-{}", camera))
            .spawn(move || supervise(weak, lost, generation));
        if let Err(e) = spawned {
            tracing::warn!(camera, error = %e, "断线监视线程启动失败");
        }

        tracing::info!(camera, "✅ 已连接");
        Ok(())
    }

    /// Disconnecting → Disconnected
    fn teardown(&self) {
        let camera = self.spec.name.as_str();
        tracing::info!(camera, "正在断开");

        let running = self.lock().running.take();
        let engine = running.and_then(PipelineHandle::stop);

        if let Some(ptz) = self.ptz.as_ref() {
            ptz.close();
        }

        let mut slot = self.lock();
        if engine.is_some() {
            slot.engine = engine;
        }
        slot.state = ConnectionState::Disconnected;
        tracing::info!(camera, "已断开");
    }

    /// 视频源中断触发的断开, 只作用于发出信号的那次连接
    fn disconnect_generation(&self, generation: u64) {
        {
            let mut slot = self.lock();
            if slot.state != ConnectionState::Connected || slot.generation != generation {
                return;
            }
            slot.state = ConnectionState::Disconnecting;
        }
        self.teardown();
    }
}

fn supervise(manager: Weak<ManagerInner>, lost: Receiver<()>, generation: u64) {
    // 正常停止时采集线程关闭通道, recv 返回错误
    if lost.recv().is_ok() {
        if let Some(manager) = manager.upgrade() {
            tracing::warn!(camera = %manager.spec.name, "视频源中断, 自动断开");
            manager.disconnect_generation(generation);
        }
    }
}
