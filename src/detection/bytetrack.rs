//! ByteTrack 算法实现
//!
//! 1. 高低分检测框分开处理
//! 2. 高分框优先与全部轨迹做 IOU 匹配
//! 3. 低分框救援未匹配的轨迹
//! 4. 纯运动模型, 无需外观特征

use super::tracker::{compute_iou, KalmanBoxFilter, TrackedBox, Tracker};
use super::types::BBox;
use crate::config::TrackerConfig;

/// 单条轨迹
#[derive(Clone)]
struct Track {
    id: u64,
    bbox: BBox,
    kalman: KalmanBoxFilter,
    frames_lost: u32,
}

impl Track {
    fn new(id: u64, bbox: &BBox, config: &TrackerConfig) -> Self {
        let kalman =
            KalmanBoxFilter::new(bbox, config.kalman_process_noise, config.kalman_obs_noise);
        Self {
            id,
            bbox: kalman.state_bbox(),
            kalman,
            frames_lost: 0,
        }
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.bbox = self.kalman.state_bbox();
    }

    fn update(&mut self, bbox: &BBox) {
        self.kalman.update(bbox);
        self.bbox = self.kalman.state_bbox();
        self.frames_lost = 0;
    }
}

/// ByteTrack 追踪器
pub struct ByteTracker {
    tracks: Vec<Track>,
    next_id: u64,
    config: TrackerConfig,
}

impl ByteTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            config,
        }
    }

    /// IOU 贪心匹配, 返回 (检测索引, 轨迹索引)
    fn associate(
        &self,
        detections: &[(usize, &BBox)],
        track_indices: &[usize],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        if detections.is_empty() || track_indices.is_empty() {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for &(det_idx, det) in detections {
            for &track_idx in track_indices {
                let iou = compute_iou(det, &self.tracks[track_idx].kalman.predicted_bbox());
                if iou >= iou_threshold {
                    candidates.push((1.0 - iou, det_idx, track_idx));
                }
            }
        }

        // 按代价升序
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_det = Vec::new();
        let mut used_track = Vec::new();
        let mut assignments = Vec::new();
        for (_, det_idx, track_idx) in candidates {
            if !used_det.contains(&det_idx) && !used_track.contains(&track_idx) {
                used_det.push(det_idx);
                used_track.push(track_idx);
                assignments.push((det_idx, track_idx));
            }
        }
        assignments
    }
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Tracker for ByteTracker {
    fn update(&mut self, detections: &[BBox]) -> Vec<TrackedBox> {
        for track in &mut self.tracks {
            track.predict();
        }

        let mut high = Vec::new();
        let mut low = Vec::new();
        for (idx, det) in detections.iter().enumerate() {
            if det.confidence >= self.config.high_score_threshold {
                high.push((idx, det));
            } else if det.confidence >= self.config.low_score_threshold {
                low.push((idx, det));
            }
        }

        let mut matched_det = vec![false; detections.len()];
        let mut matched_track = vec![false; self.tracks.len()];

        // 第一轮: 高分检测 + 所有轨迹
        let all: Vec<usize> = (0..self.tracks.len()).collect();
        for (det_idx, track_idx) in self.associate(&high, &all, self.config.high_iou_threshold) {
            matched_det[det_idx] = true;
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx]);
        }

        // 第二轮: 低分检测 + 未匹配轨迹 (救援)
        let unmatched: Vec<usize> = (0..self.tracks.len())
            .filter(|&idx| !matched_track[idx])
            .collect();
        for (det_idx, track_idx) in self.associate(&low, &unmatched, self.config.low_iou_threshold) {
            matched_det[det_idx] = true;
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx]);
        }

        for (track, matched) in self.tracks.iter_mut().zip(&matched_track) {
            if !matched {
                track.frames_lost += 1;
            }
        }

        // 未匹配的高分检测 → 新建轨迹
        for (det_idx, det) in detections.iter().enumerate() {
            if !matched_det[det_idx] && det.confidence >= self.config.high_score_threshold {
                self.tracks.push(Track::new(self.next_id, det, &self.config));
                self.next_id += 1;
            }
        }

        let max_lost = self.config.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        self.tracks
            .iter()
            .filter(|t| t.frames_lost == 0)
            .map(|t| TrackedBox {
                id: t.id,
                bbox: t.bbox.clone(),
            })
            .collect()
    }

    /// 只清空轨迹; ID 在进程内保持递增, 事件表按 ID 去重
    fn reset(&mut self) {
        self.tracks.clear();
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }
}
