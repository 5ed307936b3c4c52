//! 推理线程: 接收帧 → 检测引擎 → 发布结果 → 写入事件

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::cell::LatestResult;
use super::PipelineStats;
use crate::config::TaskKind;
use crate::detection::{DetectionEngine, DetectionEvent, Frame, InferenceResult};
use crate::store::{EventStore, InsertOutcome};

const POLL: Duration = Duration::from_millis(50);

pub(crate) struct InferenceLoop {
    pub camera: String,
    pub task: TaskKind,
    pub engine: DetectionEngine,
    pub handoff: Receiver<Frame>,
    pub latest: Arc<LatestResult>,
    pub store: Arc<EventStore>,
    pub events: Sender<()>,
    pub max_consecutive_failures: u32,
    pub stats: Arc<PipelineStats>,
    pub stop: Arc<AtomicBool>,
}

impl InferenceLoop {
    /// 返回引擎, 供下次连接复用
    pub fn run(mut self) -> DetectionEngine {
        tracing::info!(
            camera = %self.camera,
            detector = self.engine.detector_name(),
            "🔍 推理线程启动"
        );

        let mut seen_tracks: HashSet<u64> = HashSet::new();
        let mut failures = 0u32;
        let mut count = 0u32;
        let mut last = Instant::now();

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let frame = match self.handoff.recv_timeout(POLL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let start = Instant::now();
            let result = match self.engine.process(&frame) {
                Ok(result) => {
                    failures = 0;
                    result
                }
                Err(e) => {
                    failures += 1;
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(camera = %self.camera, seq = frame.seq, error = %e, failures, "推理失败, 跳过该帧");
                    if failures >= self.max_consecutive_failures {
                        tracing::error!(camera = %self.camera, failures, "❌ 连续推理失败, 停止推理");
                        self.latest.clear();
                        break;
                    }
                    continue;
                }
            };
            let inference_ms = start.elapsed().as_secs_f64() * 1000.0;
            self.stats.inferred.fetch_add(1, Ordering::Relaxed);

            let events = collect_events(self.task, &result, &mut seen_tracks);

            // 先发布再落库: 观察到记录时结果一定已可见
            self.latest.publish(result);
            self.persist(events);

            count += 1;
            if last.elapsed().as_secs_f64() >= 1.0 {
                tracing::debug!(
                    camera = %self.camera,
                    fps = format!("{:.1}", count as f64 / last.elapsed().as_secs_f64()),
                    ms = format!("{:.1}", inference_ms),
                    "📊 推理统计"
                );
                count = 0;
                last = Instant::now();
            }
        }

        tracing::info!(camera = %self.camera, "推理线程退出");
        self.engine
    }

    fn persist(&self, events: Vec<DetectionEvent>) {
        let mut inserted = 0;
        for event in &events {
            match self.store.insert(&self.camera, event) {
                Ok(InsertOutcome::Inserted) => inserted += 1,
                Ok(InsertOutcome::Duplicate) => {}
                Err(e) => tracing::warn!(camera = %self.camera, error = %e, "事件写入失败, 已丢弃"),
            }
        }
        if inserted > 0 {
            let _ = self.events.try_send(());
        }
    }
}

/// 由推理结果生成待写入事件
///
/// - Anpr: 每个得到有效车牌的目标一条
/// - Detect: 每个跟踪ID首次出现时一条
/// - Segment: 不产生事件
pub(crate) fn collect_events(
    task: TaskKind,
    result: &InferenceResult,
    seen_tracks: &mut HashSet<u64>,
) -> Vec<DetectionEvent> {
    match task {
        TaskKind::Anpr => result
            .objects
            .iter()
            .flat_map(|object| {
                object
                    .plates
                    .iter()
                    .filter(|plate| !plate.formatted.is_empty())
                    .map(|plate| {
                        DetectionEvent::new(object.track_id, object.label.clone(), plate.formatted.clone())
                    })
            })
            .collect(),
        TaskKind::Detect => result
            .objects
            .iter()
            .filter_map(|object| {
                let id = object.track_id?;
                seen_tracks
                    .insert(id)
                    .then(|| DetectionEvent::new(Some(id), object.label.clone(), ""))
            })
            .collect(),
        TaskKind::Segment => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capability;
    use crate::detection::{
        BBox, ByteTracker, DetectedObject, Detection, ObjectDetector, PlateDetection,
    };
    use crate::error::{Error, Result};
    use crate::pipeline::{PipelineStats, StatsSnapshot};
    use crossbeam_channel::bounded;
    use image::{Rgb, RgbImage};

    /// 帧序号写在左上角像素, 按规则决定成败
    struct Scripted {
        fails: fn(u64) -> bool,
    }

    impl ObjectDetector for Scripted {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
            let seq = image.get_pixel(0, 0)[0] as u64;
            if (self.fails)(seq) {
                return Err(Error::Inference(format!("frame {} broken", seq)));
            }
            Ok(vec![Detection {
                bbox: BBox {
                    confidence: 0.9,
                    ..BBox::new(1.0, 1.0, 6.0, 6.0)
                },
                label: "person".into(),
            }])
        }
    }

    struct Outcome {
        latest: Arc<LatestResult>,
        stats: StatsSnapshot,
        signalled: bool,
    }

    fn run_frames(
        fails: fn(u64) -> bool,
        store: EventStore,
        seqs: impl IntoIterator<Item = u64>,
        primed: Option<u64>,
    ) -> Outcome {
        let (tx, rx) = bounded(64);
        for seq in seqs {
            let image = RgbImage::from_pixel(8, 8, Rgb([seq as u8, 0, 0]));
            tx.send(Frame::new(seq, image)).unwrap();
        }
        drop(tx);

        let latest = Arc::new(LatestResult::new());
        if let Some(seq) = primed {
            latest.publish(InferenceResult { seq, objects: Vec::new() });
        }
        let stats = Arc::new(PipelineStats::default());
        let (events_tx, events_rx) = bounded(1);
        let engine = DetectionEngine::new(Capability::Detector, Box::new(Scripted { fails }))
            .with_tracker(Box::new(ByteTracker::default()));

        InferenceLoop {
            camera: "lobby".into(),
            task: TaskKind::Detect,
            engine,
            handoff: rx,
            latest: latest.clone(),
            store: Arc::new(store),
            events: events_tx,
            max_consecutive_failures: 3,
            stats: stats.clone(),
            stop: Arc::new(AtomicBool::new(false)),
        }
        .run();

        Outcome {
            latest,
            stats: stats.snapshot(),
            signalled: events_rx.try_recv().is_ok(),
        }
    }

    fn ready_store() -> EventStore {
        let store = EventStore::open_in_memory().unwrap();
        store.ensure_schema("lobby", TaskKind::Detect).unwrap();
        store
    }

    #[test]
    fn isolated_failures_are_skipped() {
        let out = run_frames(|seq| seq % 2 == 1, ready_store(), 1..=8, None);
        assert_eq!(out.stats.failed, 4);
        assert_eq!(out.stats.inferred, 4);
        assert_eq!(out.latest.latest_seq(), Some(8));
        assert!(out.signalled);
    }

    #[test]
    fn consecutive_failures_stop_inference_and_clear_result() {
        let out = run_frames(|_| true, ready_store(), 1..=10, Some(0));
        assert_eq!(out.stats.failed, 3);
        assert_eq!(out.stats.inferred, 0);
        assert!(out.latest.snapshot().is_none());
        assert!(!out.signalled);
    }

    #[test]
    fn failure_count_resets_after_success() {
        // 失败 1,2 / 成功 3 / 失败 4,5 / 成功 6: 从未连续3次
        let out = run_frames(|seq| seq % 3 != 0, ready_store(), 1..=6, None);
        assert_eq!(out.stats.failed, 4);
        assert_eq!(out.stats.inferred, 2);
        assert_eq!(out.latest.latest_seq(), Some(6));
    }

    #[test]
    fn store_errors_drop_events_and_keep_running() {
        // 事件表未初始化, 每次写入都失败
        let store = EventStore::open_in_memory().unwrap();
        let out = run_frames(|_| false, store, 1..=5, None);
        assert_eq!(out.stats.failed, 0);
        assert_eq!(out.stats.inferred, 5);
        assert_eq!(out.latest.latest_seq(), Some(5));
        assert!(!out.signalled);
    }

    fn object(label: &str, track_id: Option<u64>, plates: &[&str]) -> DetectedObject {
        DetectedObject {
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            label: label.into(),
            confidence: 0.8,
            track_id,
            plates: plates
                .iter()
                .map(|p| PlateDetection {
                    bbox: BBox::new(0.0, 0.0, 5.0, 2.0),
                    raw_text: p.replace('-', ""),
                    formatted: p.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn anpr_events_need_a_formatted_plate() {
        let result = InferenceResult {
            seq: 2,
            objects: vec![
                object("car", Some(1), &["MH-12-AB-1234"]),
                object("truck", Some(2), &[""]),
                object("person", Some(3), &[]),
            ],
        };
        let events = collect_events(TaskKind::Anpr, &result, &mut HashSet::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].plate, "MH-12-AB-1234");
        assert_eq!(events[0].track_id, Some(1));
    }

    #[test]
    fn detect_events_fire_on_first_sighting() {
        let mut seen = HashSet::new();
        let first = InferenceResult {
            seq: 2,
            objects: vec![object("person", Some(1), &[]), object("dog", None, &[])],
        };
        let second = InferenceResult {
            seq: 4,
            objects: vec![object("person", Some(1), &[]), object("car", Some(2), &[])],
        };
        assert_eq!(collect_events(TaskKind::Detect, &first, &mut seen).len(), 1);
        let again = collect_events(TaskKind::Detect, &second, &mut seen);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].object_type, "car");
    }

    #[test]
    fn segmentation_is_display_only() {
        let result = InferenceResult {
            seq: 2,
            objects: vec![object("car", Some(1), &["MH-12-AB-1234"])],
        };
        assert!(collect_events(TaskKind::Segment, &result, &mut HashSet::new()).is_empty());
    }
}
