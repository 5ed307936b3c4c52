//! 控制通道: Cookie 握手 + WebSocket + 后台发送线程

use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::{Message, WebSocket};

use crate::config::PtzEndpoint;
use crate::error::{Error, Result};

const SESSION_COOKIE: &str = "PHPSESSID";
const POLL: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// 已建立的控制通道
pub trait ControlChannel: Send {
    fn send_text(&mut self, text: &str) -> Result<()>;

    fn ping(&mut self) -> Result<()>;

    /// 读掉对端发来的消息, 无数据时立即返回
    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self);
}

/// 按端点建立控制通道
pub trait ControlConnector: Send + Sync {
    fn connect(&self, endpoint: &PtzEndpoint, timeout: Duration) -> Result<Box<dyn ControlChannel>>;
}

// ========== WebSocket 实现 ==========

/// HTTP 取会话 Cookie, 再带 Cookie + Origin 升级为 WebSocket
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl ControlConnector for WebSocketConnector {
    fn connect(&self, endpoint: &PtzEndpoint, timeout: Duration) -> Result<Box<dyn ControlChannel>> {
        let cookie = fetch_session_cookie(&endpoint.base_url, timeout)?;
        let channel = WebSocketChannel::connect(endpoint, &cookie, timeout)?;
        Ok(Box::new(channel))
    }
}

/// GET base_url, 取 PHPSESSID; 没有则为空串
pub fn fetch_session_cookie(base_url: &str, timeout: Duration) -> Result<String> {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let response = agent.get(base_url).call()?;
    let cookie = parse_session_cookie(&response.all("set-cookie")).unwrap_or_default();
    if cookie.is_empty() {
        tracing::warn!(base_url, "未取得会话 Cookie, 使用空值");
    }
    Ok(cookie)
}

pub(crate) fn parse_session_cookie(headers: &[&str]) -> Option<String> {
    headers.iter().find_map(|header| {
        let pair = header.split(';').next()?;
        let (name, value) = pair.split_once('=')?;
        (name.trim() == SESSION_COOKIE).then(|| value.trim().to_string())
    })
}

pub struct WebSocketChannel {
    ws: WebSocket<TcpStream>,
}

impl WebSocketChannel {
    pub fn connect(endpoint: &PtzEndpoint, cookie: &str, timeout: Duration) -> Result<Self> {
        let mut request = endpoint.control_url.as_str().into_client_request()?;

        let uri = request.uri().clone();
        if uri.scheme_str() != Some("ws") {
            return Err(Error::ControlChannel(format!(
                "仅支持 ws:// 控制地址: {}",
                endpoint.control_url
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| Error::ControlChannel(format!("控制地址缺少主机: {}", uri)))?;
        let port = uri.port_u16().unwrap_or(80);

        let headers = request.headers_mut();
        headers.insert(
            "Cookie",
            HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, cookie))
                .map_err(|e| Error::ControlChannel(e.to_string()))?,
        );
        headers.insert(
            "Origin",
            HeaderValue::from_str(&endpoint.base_url)
                .map_err(|e| Error::ControlChannel(e.to_string()))?,
        );

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::ControlChannel(format!("解析 {} 失败: {}", host, e)))?
            .next()
            .ok_or_else(|| Error::ControlChannel(format!("解析 {} 无结果", host)))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Error::ControlChannel(format!("连接 {} 失败: {}", addr, e)))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let (ws, _response) =
            tungstenite::client(request, stream).map_err(|e| Error::ControlChannel(e.to_string()))?;
        ws.get_ref().set_read_timeout(Some(DRAIN_TIMEOUT))?;

        tracing::info!(url = %endpoint.control_url, "✅ 控制通道已连接");
        Ok(Self { ws })
    }
}

impl ControlChannel for WebSocketChannel {
    fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.to_string()))?;
        Ok(())
    }

    fn ping(&mut self) -> Result<()> {
        self.ws.send(Message::Ping(Vec::new()))?;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            match self.ws.read() {
                Ok(message) => tracing::trace!(?message, "控制通道消息"),
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
    }
}

// ========== 发送线程 ==========

enum Command {
    Send(String),
    Close,
}

/// 一次云台会话: 报文经有界邮箱交给后台线程发送, 调用方不做网络IO
pub struct PtzSession {
    camera: String,
    tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl PtzSession {
    pub fn spawn(
        camera: &str,
        channel: Box<dyn ControlChannel>,
        heartbeat: Duration,
        capacity: usize,
    ) -> Result<Self> {
        let (tx, rx) = bounded(capacity.max(1));
        let name = camera.to_string();
        let worker = std::thread::Builder::new()
            .name(format!("ptz-{}", camera))
            .spawn(move || control_task(name, channel, rx, heartbeat))?;

        Ok(Self {
            camera: camera.to_string(),
            tx,
            worker: Some(worker),
        })
    }

    /// 投递报文; 邮箱满或通道已断开时返回 false
    pub fn send(&self, text: String) -> bool {
        match self.tx.try_send(Command::Send(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(camera = %self.camera, "云台邮箱已满, 丢弃报文");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!(camera = %self.camera, "控制通道已断开, 丢弃报文");
                false
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// 发完已排队的报文后关闭
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // 邮箱满时直接断开, 由发送线程感知
        let _ = self.tx.try_send(Command::Close);
        if let Some(worker) = self.worker.take() {
            let (dead_tx, _) = bounded(0);
            self.tx = dead_tx;
            let _ = worker.join();
            tracing::info!(camera = %self.camera, "控制通道已关闭");
        }
    }
}

impl Drop for PtzSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn control_task(
    camera: String,
    mut channel: Box<dyn ControlChannel>,
    rx: Receiver<Command>,
    heartbeat: Duration,
) {
    let mut last_ping = Instant::now();

    loop {
        match rx.recv_timeout(POLL) {
            Ok(Command::Send(text)) => {
                if let Err(e) = channel.send_text(&text) {
                    tracing::warn!(camera = %camera, message = %text, error = %e, "报文发送失败");
                    break;
                }
                tracing::debug!(camera = %camera, message = %text, "已发送");
            }
            Ok(Command::Close) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_ping.elapsed() >= heartbeat {
            if let Err(e) = channel.ping() {
                tracing::warn!(camera = %camera, error = %e, "心跳失败");
                break;
            }
            last_ping = Instant::now();
        }

        if let Err(e) = channel.drain() {
            tracing::warn!(camera = %camera, error = %e, "控制通道读取失败");
            break;
        }
    }

    channel.close();
}
