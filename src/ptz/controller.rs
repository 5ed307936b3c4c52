//! 云台控制器: 动作切换状态 + 会话生命周期

use std::sync::{Arc, Mutex, MutexGuard};

use super::command::{CommandTable, PtzAction, AUTOFOCUS, STOP_MOVE, STOP_ZOOM};
use super::session::{ControlConnector, PtzSession};
use crate::config::{CameraKind, PtzConfig, PtzEndpoint};
use crate::error::Result;

struct ControllerState {
    active: [bool; PtzAction::ALL.len()],
    session: Option<PtzSession>,
}

pub struct PtzController {
    camera: String,
    kind: CameraKind,
    endpoint: PtzEndpoint,
    config: PtzConfig,
    commands: CommandTable,
    connector: Arc<dyn ControlConnector>,
    state: Mutex<ControllerState>,
}

impl PtzController {
    pub fn new(
        camera: &str,
        kind: CameraKind,
        endpoint: PtzEndpoint,
        config: &PtzConfig,
        connector: Arc<dyn ControlConnector>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            kind,
            endpoint,
            config: config.clone(),
            commands: CommandTable::new(config),
            connector,
            state: Mutex::new(ControllerState {
                active: [false; PtzAction::ALL.len()],
                session: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 握手并启动发送线程; 已有会话时先关闭旧会话
    pub fn open(&self) -> Result<()> {
        // 网络握手不持锁
        let channel = self.connector.connect(&self.endpoint, self.config.timeout())?;
        let session = PtzSession::spawn(
            &self.camera,
            channel,
            self.config.heartbeat(),
            self.config.mailbox_capacity,
        )?;

        let previous = self.lock().session.replace(session);
        if let Some(previous) = previous {
            previous.close();
        }
        tracing::info!(camera = %self.camera, url = %self.endpoint.control_url, "🎮 云台会话已建立");
        Ok(())
    }

    /// 关闭会话并复位所有动作状态
    pub fn close(&self) {
        let session = {
            let mut state = self.lock();
            state.active = [false; PtzAction::ALL.len()];
            state.session.take()
        };
        if let Some(session) = session {
            session.close();
        }
    }

    pub fn is_session_open(&self) -> bool {
        self.lock().session.as_ref().is_some_and(PtzSession::is_alive)
    }

    pub fn is_active(&self, action: PtzAction) -> bool {
        self.lock().active[action.index()]
    }

    /// 切换动作; ptz_fixed 机位拒绝方向动作并返回 None, 否则返回新状态
    pub fn toggle(&self, action: PtzAction) -> Option<bool> {
        if self.kind == CameraKind::PtzFixed && action.is_directional() {
            tracing::warn!(camera = %self.camera, action = %action, "固定机位不支持方向控制");
            return None;
        }

        let mut state = self.lock();
        let active = !state.active[action.index()];
        state.active[action.index()] = active;

        let message = self.commands.toggle(action, active);
        self.send(&state, message);
        if active && action.is_directional() {
            self.send(&state, AUTOFOCUS.to_string());
        }
        tracing::debug!(camera = %self.camera, action = %action, active, "云台动作切换");
        Some(active)
    }

    /// 绝对变焦 (0..=100)
    pub fn set_zoom(&self, level: i64) {
        let state = self.lock();
        self.send(&state, self.commands.set_zoom(level));
    }

    /// 停止云台与变焦并复位所有动作
    pub fn stop_all(&self) {
        let mut state = self.lock();
        self.send(&state, STOP_MOVE.to_string());
        self.send(&state, STOP_ZOOM.to_string());
        state.active = [false; PtzAction::ALL.len()];
    }

    fn send(&self, state: &ControllerState, message: String) {
        match state.session.as_ref() {
            Some(session) => {
                session.send(message);
            }
            None => {
                tracing::warn!(camera = %self.camera, message = %message, "云台会话未建立, 忽略报文");
            }
        }
    }
}

impl Drop for PtzController {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ptz::session::ControlChannel;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<String>>>);

    impl ControlChannel for Wire {
        fn send_text(&mut self, text: &str) -> Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn ping(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    struct WireConnector(Wire);

    impl ControlConnector for WireConnector {
        fn connect(
            &self,
            _endpoint: &PtzEndpoint,
            _timeout: Duration,
        ) -> Result<Box<dyn crate::ptz::session::ControlChannel>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    struct Unreachable;

    impl ControlConnector for Unreachable {
        fn connect(
            &self,
            _endpoint: &PtzEndpoint,
            _timeout: Duration,
        ) -> Result<Box<dyn crate::ptz::session::ControlChannel>> {
            Err(Error::ControlChannel("connection refused".into()))
        }
    }

    fn endpoint() -> PtzEndpoint {
        PtzEndpoint {
            base_url: "http://10.0.0.5".into(),
            control_url: "ws://10.0.0.5/ws".into(),
        }
    }

    fn controller(kind: CameraKind) -> (PtzController, Wire) {
        let wire = Wire::default();
        let c = PtzController::new(
            "gate",
            kind,
            endpoint(),
            &PtzConfig::default(),
            Arc::new(WireConnector(wire.clone())),
        );
        (c, wire)
    }

    /// 关闭会话以确保邮箱已发送完毕
    fn sent_after_close(c: &PtzController, wire: &Wire) -> Vec<String> {
        c.close();
        wire.0.lock().unwrap().clone()
    }

    #[test]
    fn directional_toggle_sends_move_then_autofocus() {
        let (c, wire) = controller(CameraKind::Ptz);
        c.open().unwrap();
        assert_eq!(c.toggle(PtzAction::Left), Some(true));
        assert_eq!(c.toggle(PtzAction::Left), Some(false));
        assert_eq!(
            sent_after_close(&c, &wire),
            [
                "type=ptz&move=left&pspd=30",
                "type=ptz&focus=pushaf",
                "type=ptz&move=stop"
            ]
        );
    }

    #[test]
    fn fixed_mount_rejects_directions_but_allows_wiper_and_zoom() {
        let (c, wire) = controller(CameraKind::PtzFixed);
        c.open().unwrap();
        assert_eq!(c.toggle(PtzAction::Up), None);
        assert!(!c.is_active(PtzAction::Up));
        assert_eq!(c.toggle(PtzAction::Wiper), Some(true));
        c.set_zoom(140);
        assert_eq!(
            sent_after_close(&c, &wire),
            ["type=ptz&aux_on=2", "type=ptz&position=set&zoom_pos=100"]
        );
    }

    #[test]
    fn stop_all_resets_every_toggle() {
        let (c, wire) = controller(CameraKind::Ptz);
        c.open().unwrap();
        c.toggle(PtzAction::ZoomIn);
        c.toggle(PtzAction::Wiper);
        c.stop_all();
        assert!(PtzAction::ALL.iter().all(|a| !c.is_active(*a)));
        let sent = sent_after_close(&c, &wire);
        assert_eq!(&sent[sent.len() - 2..], ["type=ptz&move=stop", "type=ptz&zoom=stop"]);
    }

    #[test]
    fn toggles_without_session_only_flip_state() {
        let c = PtzController::new(
            "gate",
            CameraKind::Ptz,
            endpoint(),
            &PtzConfig::default(),
            Arc::new(Unreachable),
        );
        assert!(c.open().is_err());
        assert!(!c.is_session_open());
        assert_eq!(c.toggle(PtzAction::Right), Some(true));
        assert!(c.is_active(PtzAction::Right));
        c.set_zoom(10);
    }
}
