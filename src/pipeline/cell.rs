//! 最新推理结果 (单槽覆盖)

use std::sync::{Arc, Mutex, MutexGuard};

use crate::detection::InferenceResult;

/// 推理线程写, 渲染读。只接受序号不小于当前值的结果。
#[derive(Default)]
pub struct LatestResult {
    slot: Mutex<Option<Arc<InferenceResult>>>,
}

impl LatestResult {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<InferenceResult>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 发布结果, 旧结果不会覆盖新结果; 返回是否生效
    pub fn publish(&self, result: InferenceResult) -> bool {
        let mut slot = self.lock();
        if let Some(current) = slot.as_ref() {
            if result.seq < current.seq {
                return false;
            }
        }
        *slot = Some(Arc::new(result));
        true
    }

    /// 读取快照, 不阻塞写入方
    pub fn snapshot(&self) -> Option<Arc<InferenceResult>> {
        self.lock().clone()
    }

    pub fn latest_seq(&self) -> Option<u64> {
        self.lock().as_ref().map(|r| r.seq)
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, DetectedObject};
    use std::thread;

    fn result(seq: u64, n: usize) -> InferenceResult {
        InferenceResult {
            seq,
            objects: (0..n)
                .map(|i| DetectedObject {
                    bbox: BBox::new(i as f32, 0.0, i as f32 + 1.0, 1.0),
                    label: "car".into(),
                    confidence: 0.9,
                    track_id: Some(i as u64),
                    plates: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn older_results_never_replace_newer() {
        let cell = LatestResult::new();
        assert!(cell.snapshot().is_none());
        assert!(cell.publish(result(10, 1)));
        assert!(!cell.publish(result(8, 2)));
        assert_eq!(cell.latest_seq(), Some(10));
        assert!(cell.publish(result(10, 3)));
        assert_eq!(cell.snapshot().unwrap().objects.len(), 3);
        cell.clear();
        assert_eq!(cell.latest_seq(), None);
    }

    #[test]
    fn concurrent_reads_are_never_torn() {
        let cell = Arc::new(LatestResult::new());
        let writer = {
            let cell = cell.clone();
            thread::spawn(move || {
                for seq in 1..=2000u64 {
                    cell.publish(result(seq, (seq % 7) as usize));
                }
            })
        };

        let mut last_seen = 0;
        while !writer.is_finished() {
            if let Some(snapshot) = cell.snapshot() {
                assert_eq!(snapshot.objects.len() as u64, snapshot.seq % 7);
                assert!(snapshot.seq >= last_seen);
                last_seen = snapshot.seq;
            }
        }
        writer.join().unwrap();
        assert_eq!(cell.latest_seq(), Some(2000));
    }
}
