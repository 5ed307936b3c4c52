//! 图片目录回放 - 按文件名排序逐张读取

use super::FrameSource;
use crate::error::{Error, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    interval: Duration,
    last: Option<Instant>,
}

impl ImageDirSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let entries =
            std::fs::read_dir(&dir).map_err(|e| Error::source_open(dir.display(), e))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(Error::source_open(dir.display(), "目录中没有图片"));
        }

        tracing::info!(dir = %dir.display(), frames = files.len(), "图片序列已打开");
        Ok(Self {
            dir,
            files,
            cursor: 0,
            interval: Duration::ZERO,
            last: None,
        })
    }

    /// 模拟设备帧率
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageDirSource {
    fn read(&mut self) -> Result<RgbImage> {
        let Some(path) = self.files.get(self.cursor) else {
            return Err(Error::FrameRead(format!("{} 已播放完毕", self.dir.display())));
        };

        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());

        let image = image::open(path)
            .map_err(|e| Error::FrameRead(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        self.cursor += 1;
        Ok(image)
    }

    fn describe(&self) -> String {
        format!("images:{}", self.dir.display())
    }
}
