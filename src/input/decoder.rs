//! FFmpeg 视频源: 本地摄像头 (DirectShow / AVFoundation / V4L2)、视频文件、RTSP

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::core::scheduler::ffmpeg_scheduler::{FfmpegScheduler, Running};
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use image::RgbImage;

use super::decode_filter::RgbFrameFilter;
use super::FrameSource;
use crate::config::SourceLocator;
use crate::error::{Error, Result};

/// 解码与采集之间的缓冲帧数
const DECODE_BUFFER: usize = 2;
/// 超过该时长没有新帧视为设备断开
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FfmpegSource {
    description: String,
    rx: Receiver<RgbImage>,
    closed: Arc<AtomicBool>,
    scheduler: Option<FfmpegScheduler<Running>>,
}

impl FfmpegSource {
    pub fn open(locator: &SourceLocator) -> Result<Self> {
        let input = match locator {
            SourceLocator::Device(index) => {
                let (url, format) = device_input(*index)?;
                Input::new(url).set_format(format)
            }
            SourceLocator::Uri(uri) if uri.starts_with("rtsp://") => Input::new(uri.as_str())
                .set_input_opts([("rtsp_transport", "tcp"), ("rtsp_flags", "prefer_tcp")].into()),
            SourceLocator::Uri(uri) => Input::new(uri.as_str()),
        };
        Self::start(input, locator.to_string())
    }

    fn start(input: Input, description: String) -> Result<Self> {
        let (tx, rx) = bounded(DECODE_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let filter = RgbFrameFilter::new(description.clone(), tx, closed.clone());
        let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
        let pipe = pipe.filter("rgb", Box::new(filter));
        let out = create_null_output().add_frame_pipeline(pipe);

        let ctx = FfmpegContext::builder()
            .input(input)
            .filter_descs(["format=yuv420p"].into())
            .output(out)
            .build()
            .map_err(|e| Error::source_open(&description, e))?;
        // 调度器自带工作线程; 句柄留到 Drop 时中止
        let scheduler = ctx.start().map_err(|e| Error::source_open(&description, e))?;

        tracing::info!(source = %description, "✅ 视频源已打开");
        Ok(Self {
            description,
            rx,
            closed,
            scheduler: Some(scheduler),
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<RgbImage> {
        match self.rx.recv_timeout(READ_TIMEOUT) {
            Ok(image) => Ok(image),
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::FrameRead(format!("{} 读取超时", self.description)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::FrameRead(format!("{} 流已结束", self.description)))
            }
        }
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        // 卡住的 RTSP 读取也会被中断, 不留后台连接
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.abort();
            tracing::debug!(source = %self.description, "FFmpeg 调度已中止");
        }
    }
}

/// 设备索引 → 平台输入格式
fn device_input(index: u32) -> Result<(String, &'static str)> {
    #[cfg(target_os = "windows")]
    {
        // DirectShow 按设备名打开
        let devices = ez_ffmpeg::device::get_input_video_devices()
            .map_err(|e| Error::source_open(index, e))?;
        let name = devices
            .get(index as usize)
            .ok_or_else(|| Error::source_open(index, "设备不存在"))?;
        Ok((format!("video={}", name), "dshow"))
    }
    #[cfg(target_os = "macos")]
    {
        Ok((index.to_string(), "avfoundation"))
    }
    #[cfg(target_os = "linux")]
    {
        Ok((format!("/dev/video{}", index), "v4l2"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        Ok((index.to_string(), "video4linux2"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn dropping_a_live_source_aborts_the_scheduler() {
        // lavfi 测试源不会自然结束, 相当于一路不断流的摄像头
        let input = Input::new("testsrc=size=64x48:rate=25").set_format("lavfi");
        let mut source = FfmpegSource::start(input, "testsrc".into()).unwrap();
        let frame = source.read().unwrap();
        assert_eq!(frame.dimensions(), (64, 48));

        let started = Instant::now();
        drop(source);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
