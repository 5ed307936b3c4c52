/// 云台控制 (PTZ Control)
///
/// - Command:    动作与报文编码
/// - Session:    Cookie 握手 + WebSocket 控制通道 + 发送线程
/// - Controller: 动作切换状态机
pub mod command;
pub mod controller;
pub mod session;

pub use command::{CommandTable, PtzAction};
pub use controller::PtzController;
pub use session::{
    fetch_session_cookie, ControlChannel, ControlConnector, PtzSession, WebSocketChannel,
    WebSocketConnector,
};
