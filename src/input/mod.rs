/// 视频输入系统 (Video Input System)
///
/// - FrameSource: 阻塞式逐帧读取接口, 由采集线程独占
/// - ImageDirSource: 图片目录回放 (离线测试/复现)
/// - FfmpegSource: FFmpeg 解码 (本地摄像头 / 文件 / RTSP), 需启用 `ffmpeg` 特性
///
/// 设备句柄在 `Drop` 时释放
pub mod image_dir;

#[cfg(feature = "ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ffmpeg")]
pub mod decoder;

pub use image_dir::ImageDirSource;

#[cfg(feature = "ffmpeg")]
pub use decoder::FfmpegSource;

use crate::config::SourceLocator;
use crate::error::Result;
use image::RgbImage;
use std::path::Path;

/// 视频源
pub trait FrameSource: Send {
    /// 阻塞读取下一帧; 设备断开/流结束返回 `Error::FrameRead`
    fn read(&mut self) -> Result<RgbImage>;

    fn describe(&self) -> String;
}

/// 按定位信息打开视频源
pub trait SourceOpener: Send + Sync {
    fn open(&self, locator: &SourceLocator) -> Result<Box<dyn FrameSource>>;
}

impl<F> SourceOpener for F
where
    F: Fn(&SourceLocator) -> Result<Box<dyn FrameSource>> + Send + Sync,
{
    fn open(&self, locator: &SourceLocator) -> Result<Box<dyn FrameSource>> {
        self(locator)
    }
}

/// 默认打开策略: 目录 → 图片序列, 其余交给 FFmpeg
#[derive(Debug, Clone, Default)]
pub struct DefaultSourceOpener {
    /// 图片序列的回放间隔 (毫秒), 0 表示不限速
    pub replay_interval_ms: u64,
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, locator: &SourceLocator) -> Result<Box<dyn FrameSource>> {
        if let SourceLocator::Uri(uri) = locator {
            if Path::new(uri).is_dir() {
                let source = ImageDirSource::open(uri)?
                    .with_interval(std::time::Duration::from_millis(self.replay_interval_ms));
                return Ok(Box::new(source));
            }
        }

        #[cfg(feature = "ffmpeg")]
        {
            Ok(Box::new(FfmpegSource::open(locator)?))
        }

        #[cfg(not(feature = "ffmpeg"))]
        {
            Err(crate::error::Error::source_open(
                locator,
                "未启用 ffmpeg 特性, 仅支持图片目录",
            ))
        }
    }
}
