//! FFmpeg 帧过滤器: YUV420P → RgbImage, 投递给采集线程

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use image::RgbImage;

const MAX_DIMENSION: u32 = 8192;

pub struct RgbFrameFilter {
    locator: String,
    tx: Sender<RgbImage>,
    closed: Arc<AtomicBool>,
    total_frames: u64,
    dropped_frames: u64,
    last_report: Instant,
}

impl RgbFrameFilter {
    pub fn new(locator: String, tx: Sender<RgbImage>, closed: Arc<AtomicBool>) -> Self {
        Self {
            locator,
            tx,
            closed,
            total_frames: 0,
            dropped_frames: 0,
            last_report: Instant::now(),
        }
    }

    fn reject(&mut self, reason: &str) -> Result<Option<Frame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            tracing::warn!(source = %self.locator, frame = self.total_frames, reason, "丢弃帧");
        }
        Ok(None)
    }
}

impl FrameFilter for RgbFrameFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::debug!(source = %self.locator, "解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if self.closed.load(Ordering::Relaxed) {
            return Err("source closed".to_string());
        }
        self.total_frames += 1;

        let image = unsafe {
            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return self.reject("空帧/损坏帧");
            }
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width as u32, raw.height as u32);
            if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
                return self.reject("非法分辨率");
            }
            // 缺少参考帧 / 无效比特流
            if raw.decode_error_flags & 0x03 != 0 {
                return self.reject("解码错误标志");
            }

            let (y_plane, u_plane, v_plane) = (raw.data[0], raw.data[1], raw.data[2]);
            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                return self.reject("YUV指针为空");
            }
            if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
                return self.reject("步长异常");
            }

            let mut buffer = vec![0u8; (w * h * 3) as usize];
            yuv420p_to_rgb(
                y_plane,
                u_plane,
                v_plane,
                y_stride,
                uv_stride,
                &mut buffer,
                w as usize,
                h as usize,
            );
            match RgbImage::from_raw(w, h, buffer) {
                Some(image) => image,
                None => return self.reject("缓冲区尺寸不符"),
            }
        };

        if self.last_report.elapsed() >= Duration::from_secs(10) {
            tracing::debug!(
                source = %self.locator,
                total = self.total_frames,
                dropped = self.dropped_frames,
                "📺 解码统计"
            );
            self.last_report = Instant::now();
        }

        // 采集线程读得慢时阻塞解码, 但要能响应关闭
        let mut pending = image;
        loop {
            match self.tx.send_timeout(pending, Duration::from_millis(100)) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.closed.load(Ordering::Relaxed) {
                        return Err("source closed".to_string());
                    }
                    pending = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err("source closed".to_string());
                }
            }
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        tracing::debug!(source = %self.locator, "解码线程退出");
    }
}

/// BT.601 定点转换
#[allow(clippy::too_many_arguments)]
#[inline]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;
        for x in 0..width {
            let luma = *y_plane.add(y_row + x) as i32;
            let u = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out] = (luma + ((v * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out + 1] = (luma - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out + 2] = (luma + ((u * 227) >> 7)).clamp(0, 255) as u8;
            out += 3;
        }
    }
}
