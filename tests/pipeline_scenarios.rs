// 端到端场景: 假视频源 + 假模型, 走完整的 连接 → 采集 → 推理 → 入库 → 断开
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use image::{Rgb, RgbImage};
use sentinel_anpr::config::{PipelineConfig, PtzConfig};
use sentinel_anpr::detection::{
    BBox, ByteTracker, Detection, ObjectDetector, PlateDetector, TextRecognizer,
};
use sentinel_anpr::ptz::{ControlChannel, ControlConnector};
use sentinel_anpr::{
    CameraKind, CameraSpec, Capability, ConnectionManager, ConnectionState, DetectionEngine,
    Error, EventStore, FrameSource, Overlay, Result, Services, SourceLocator, SourceOpener,
    TaskKind,
};

const MARKED: std::ops::RangeInclusive<u64> = 40..=60;
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// 第 40~60 帧左上角像素为白色, 表示画面中有车
struct MarkedSource {
    seq: u64,
    pace: Duration,
}

impl FrameSource for MarkedSource {
    fn read(&mut self) -> Result<RgbImage> {
        thread::sleep(self.pace);
        self.seq += 1;
        let mut image = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        if MARKED.contains(&self.seq) {
            image.put_pixel(0, 0, WHITE);
        }
        Ok(image)
    }

    fn describe(&self) -> String {
        "marked".into()
    }
}

/// 看到标记时返回一辆静止的车
struct MarkerDetector {
    label: &'static str,
}

impl ObjectDetector for MarkerDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        if *image.get_pixel(0, 0) != WHITE {
            return Ok(Vec::new());
        }
        Ok(vec![Detection {
            bbox: BBox {
                confidence: 0.9,
                class_id: 2,
                ..BBox::new(10.0, 10.0, 50.0, 50.0)
            },
            label: self.label.to_string(),
        }])
    }
}

struct OnePlate;

impl PlateDetector for OnePlate {
    fn detect_plates(&mut self, _crop: &RgbImage) -> Result<Vec<BBox>> {
        Ok(vec![BBox::new(5.0, 5.0, 30.0, 15.0)])
    }
}

/// 车牌分两行识别
struct TwoLines;

impl TextRecognizer for TwoLines {
    fn recognize(&mut self, _crop: &RgbImage) -> Result<Vec<String>> {
        Ok(vec!["MH12".into(), "AB1234".into()])
    }
}

/// 识别结果由测试切换, 模拟换了一辆车
struct SwitchablePlate {
    plates: [&'static str; 2],
    current: Arc<AtomicUsize>,
}

impl TextRecognizer for SwitchablePlate {
    fn recognize(&mut self, _crop: &RgbImage) -> Result<Vec<String>> {
        let index = self.current.load(Ordering::SeqCst).min(1);
        Ok(vec![self.plates[index].to_string()])
    }
}

struct Broken;

impl ObjectDetector for Broken {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
        Err(Error::Inference("model crashed".into()))
    }
}

/// 每次推理等待放行
struct GatedDetector {
    gate: Receiver<()>,
}

impl ObjectDetector for GatedDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
        let _ = self.gate.recv_timeout(Duration::from_secs(5));
        Ok(Vec::new())
    }
}

struct Refused;

impl ControlConnector for Refused {
    fn connect(
        &self,
        _endpoint: &sentinel_anpr::config::PtzEndpoint,
        _timeout: Duration,
    ) -> Result<Box<dyn ControlChannel>> {
        Err(Error::ControlChannel("refused".into()))
    }
}

fn camera(name: &str, task: TaskKind) -> CameraSpec {
    CameraSpec {
        name: name.into(),
        task,
        source: SourceLocator::Device(0),
        kind: CameraKind::Fixed,
        capability: Capability::resolve(None, task).unwrap(),
        ptz: None,
    }
}

fn services(
    store: Arc<EventStore>,
    opener: Arc<dyn SourceOpener>,
    build: impl Fn(&CameraSpec) -> Result<DetectionEngine> + Send + Sync + 'static,
) -> Services {
    Services {
        store,
        opener,
        engines: Arc::new(build),
        connector: Arc::new(Refused),
        overlay: Arc::new(Overlay::new(70)),
        pipeline: PipelineConfig::default(),
        ptz: PtzConfig::default(),
    }
}

fn marked_opener(pace: Duration) -> Arc<dyn SourceOpener> {
    Arc::new(move |_: &SourceLocator| -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(MarkedSource { seq: 0, pace }))
    })
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn anpr_records_a_plate_once_per_vehicle() {
    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let services = services(store.clone(), marked_opener(Duration::from_millis(3)), |spec| {
        Ok(DetectionEngine::new(
            spec.capability,
            Box::new(MarkerDetector { label: "car" }),
        )
        .with_tracker(Box::new(ByteTracker::default()))
        .with_plate_reader(Box::new(OnePlate), Box::new(TwoLines)))
    });
    let manager = ConnectionManager::new(camera("gate", TaskKind::Anpr), &services).unwrap();
    manager.connect().unwrap();

    let reached = wait_until(Duration::from_secs(20), || {
        // 先读记录数再读序号: 有记录时可见结果必然不早于标记帧
        let count = store.count("gate").unwrap();
        let seq = manager.latest_result().map(|r| r.seq).unwrap_or(0);
        if seq < *MARKED.start() {
            assert_eq!(count, 0, "seq {} 之前不应有记录", seq);
        }
        seq >= 100
    });
    assert!(reached, "推理未推进到第100帧");
    manager.disconnect();

    let rows = manager.fetch_latest(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].object_type, "car");
    assert_eq!(rows[0].license_number.as_deref(), Some("MH-12-AB-1234"));
    assert_eq!(rows[0].id, "1");
}

#[test]
fn detect_task_records_first_sighting_of_each_track() {
    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let services = services(store.clone(), marked_opener(Duration::from_millis(2)), |spec| {
        Ok(DetectionEngine::new(
            spec.capability,
            Box::new(MarkerDetector { label: "person" }),
        )
        .with_tracker(Box::new(ByteTracker::default())))
    });
    let manager = ConnectionManager::new(camera("lobby", TaskKind::Detect), &services).unwrap();
    manager.connect().unwrap();

    assert!(wait_until(Duration::from_secs(20), || {
        manager.latest_result().map(|r| r.seq).unwrap_or(0) >= 80
    }));
    manager.disconnect();

    let rows = manager.fetch_latest(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].object_type, "person");
    assert!(rows[0].license_number.is_none());
}

#[test]
fn stalled_inference_does_not_block_display() {
    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let (release, gate): (Sender<()>, Receiver<()>) = bounded(0);
    let services = services(store, marked_opener(Duration::from_millis(1)), move |spec| {
        Ok(DetectionEngine::new(
            spec.capability,
            Box::new(GatedDetector { gate: gate.clone() }),
        ))
    });
    let manager = ConnectionManager::new(camera("yard", TaskKind::Segment), &services).unwrap();
    let frames = manager.frames();
    manager.connect().unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        manager.stats().map(|s| s.rendered).unwrap_or(0) >= 60
    }));
    let stats = manager.stats().unwrap();
    assert_eq!(stats.inferred, 0);
    assert!(stats.dropped > 0, "{:?}", stats);
    assert!(frames.recv_timeout(Duration::from_secs(1)).is_some());

    // 放行后才能正常停止
    drop(release);
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn second_toggle_while_connecting_is_ignored() {
    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let slow: Arc<dyn SourceOpener> =
        Arc::new(move |_: &SourceLocator| -> Result<Box<dyn FrameSource>> {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            Ok(Box::new(MarkedSource {
                seq: 0,
                pace: Duration::from_millis(5),
            }))
        });
    let services = services(store, slow, |spec| {
        Ok(DetectionEngine::new(
            spec.capability,
            Box::new(MarkerDetector { label: "person" }),
        ))
    });
    let manager = Arc::new(ConnectionManager::new(camera("dock", TaskKind::Detect), &services).unwrap());

    let first = {
        let manager = manager.clone();
        thread::spawn(move || manager.toggle())
    };
    assert!(wait_until(Duration::from_secs(2), || {
        manager.state() == ConnectionState::Connecting
    }));
    assert_eq!(manager.toggle(), ConnectionState::Connecting);

    assert_eq!(first.join().unwrap(), ConnectionState::Connected);
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    assert_eq!(manager.toggle(), ConnectionState::Disconnected);
}

#[test]
fn reconnect_starts_a_fresh_sequence() {
    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let services = services(store, marked_opener(Duration::from_millis(2)), |spec| {
        Ok(DetectionEngine::new(
            spec.capability,
            Box::new(MarkerDetector { label: "person" }),
        ))
    });
    let manager = ConnectionManager::new(camera("porch", TaskKind::Detect), &services).unwrap();

    manager.connect().unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        manager.latest_result().map(|r| r.seq).unwrap_or(0) >= 20
    }));
    manager.disconnect();
    assert!(manager.latest_result().is_none());

    manager.connect().unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        manager.latest_result().is_some()
    }));
    let seq = manager.latest_result().map(|r| r.seq).unwrap_or(0);
    assert!(seq <= 30, "新连接的序号应从头开始, 实际 {}", seq);
    manager.disconnect();
}

#[test]
fn vehicles_seen_after_reconnect_are_recorded() {
    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let current = Arc::new(AtomicUsize::new(0));
    let plate = current.clone();
    let services = services(store, marked_opener(Duration::from_millis(2)), move |spec| {
        Ok(DetectionEngine::new(
            spec.capability,
            Box::new(MarkerDetector { label: "car" }),
        )
        .with_tracker(Box::new(ByteTracker::default()))
        .with_plate_reader(
            Box::new(OnePlate),
            Box::new(SwitchablePlate {
                plates: ["MH12AB1234", "KA05MN7777"],
                current: plate.clone(),
            }),
        ))
    });
    let manager = ConnectionManager::new(camera("gate", TaskKind::Anpr), &services).unwrap();

    for round in 0..2 {
        current.store(round, Ordering::SeqCst);
        manager.connect().unwrap();
        assert!(wait_until(Duration::from_secs(20), || {
            manager.latest_result().map(|r| r.seq).unwrap_or(0) >= 80
        }));
        manager.disconnect();
    }

    let rows = manager.fetch_latest(10).unwrap();
    let plates: Vec<_> = rows
        .iter()
        .map(|r| r.license_number.as_deref().unwrap_or(""))
        .collect();
    assert_eq!(plates, ["KA-05-MN-7777", "MH-12-AB-1234"]);
    assert_ne!(rows[0].id, rows[1].id);
}

#[test]
fn failing_model_stops_inference_but_keeps_video() {
    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let services = services(store, marked_opener(Duration::from_millis(1)), |spec| {
        Ok(DetectionEngine::new(spec.capability, Box::new(Broken)))
    });
    let manager = ConnectionManager::new(camera("yard", TaskKind::Detect), &services).unwrap();
    manager.connect().unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        manager.stats().map(|s| s.rendered).unwrap_or(0) >= 100
    }));
    let stats = manager.stats().unwrap();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.inferred, 0);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.latest_result().is_none());

    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
