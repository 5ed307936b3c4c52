use thiserror::Error;

/// 系统错误类型
///
/// 每一类错误只影响一路摄像头或一帧画面, 不会终止整个进程
#[derive(Error, Debug)]
pub enum Error {
    /// 视频源无法打开 (设备/文件/流), 本次连接失败
    #[error("视频源打开失败 [{locator}]: {reason}")]
    SourceOpen { locator: String, reason: String },

    /// 取流过程中读帧失败, 终止该路流水线并触发断开
    #[error("读帧失败: {0}")]
    FrameRead(String),

    /// 单帧推理失败, 本帧不做标注
    #[error("推理失败: {0}")]
    Inference(String),

    /// PTZ 控制通道握手或发送失败, 只影响云台控制
    #[error("控制通道错误: {0}")]
    ControlChannel(String),

    /// 事件写入失败, 丢弃该事件
    #[error("持久化失败: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("图像处理错误: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn source_open(locator: impl ToString, reason: impl ToString) -> Self {
        Error::SourceOpen {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<ureq::Error> for Error {
    fn from(error: ureq::Error) -> Self {
        Error::ControlChannel(error.to_string())
    }
}

impl From<tungstenite::Error> for Error {
    fn from(error: tungstenite::Error) -> Self {
        Error::ControlChannel(error.to_string())
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for Error {
    fn from(error: ort::Error) -> Self {
        Error::Inference(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
