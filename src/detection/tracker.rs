//! 多目标跟踪公共组件
//! Common components for multi-object tracking

use super::types::BBox;

// ========== 跟踪器统一接口 ==========

/// 跟踪输出: 持久ID + 当前帧的平滑框
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedBox {
    pub id: u64,
    pub bbox: BBox,
}

/// 多目标跟踪器 Trait
///
/// 跟踪状态属于单路摄像头, 每次连接前 `reset`
pub trait Tracker: Send {
    /// 输入当前帧检测框(含置信度), 返回本帧被更新的轨迹, 顺序即匹配优先级
    fn update(&mut self, detections: &[BBox]) -> Vec<TrackedBox>;

    /// 清除所有轨迹; 已分配的ID不再复用
    fn reset(&mut self);

    /// 当前轨迹数量 (含暂时丢失的)
    fn track_count(&self) -> usize;
}

// ========== 卡尔曼滤波器 ==========

/// 简化卡尔曼滤波器 (对角协方差)
/// 状态向量: [cx, cy, w, h, vx, vy, vw, vh]
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    state: [f32; 8],
    p: [f32; 8],
    /// 过程噪声
    q: f32,
    /// 观测噪声
    r: f32,
    velocity_decay: f32,
}

impl KalmanBoxFilter {
    /// - `q`: 过程噪声 (越小越平滑)
    /// - `r`: 观测噪声 (越大越信任预测)
    pub fn new(bbox: &BBox, q: f32, r: f32) -> Self {
        let [cx, cy, w, h] = to_cxcywh(bbox);
        Self {
            state: [cx, cy, w, h, 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q,
            r,
            velocity_decay: 0.95,
        }
    }

    /// 匀速模型预测一步
    pub fn predict(&mut self) {
        for i in 4..8 {
            self.state[i] *= self.velocity_decay;
        }
        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }
        for p in self.p.iter_mut() {
            *p += self.q;
        }
    }

    /// 融合观测
    pub fn update(&mut self, bbox: &BBox) {
        let obs = to_cxcywh(bbox);
        let residual: [f32; 4] = std::array::from_fn(|i| obs[i] - self.state[i]);

        for i in 0..4 {
            let k = self.p[i] / (self.p[i] + self.r);
            self.state[i] += k * residual[i];
            self.p[i] *= 1.0 - k;

            // 速度分量只取残差的一部分
            let kv = self.p[i + 4] / (self.p[i + 4] + self.r * 10.0);
            self.state[i + 4] += kv * residual[i];
            self.p[i + 4] *= 1.0 - kv;
        }
    }

    /// 当前状态框
    pub fn state_bbox(&self) -> BBox {
        from_cxcywh(self.state[0], self.state[1], self.state[2], self.state[3])
    }

    /// 下一帧预测框 (用于匹配)
    pub fn predicted_bbox(&self) -> BBox {
        from_cxcywh(
            self.state[0] + self.state[4],
            self.state[1] + self.state[5],
            self.state[2] + self.state[6],
            self.state[3] + self.state[7],
        )
    }
}

fn to_cxcywh(b: &BBox) -> [f32; 4] {
    [
        (b.x1 + b.x2) / 2.0,
        (b.y1 + b.y2) / 2.0,
        b.x2 - b.x1,
        b.y2 - b.y1,
    ]
}

fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> BBox {
    let w = w.max(1.0);
    let h = h.max(1.0);
    BBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
}

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    let x1 = bbox1.x1.max(bbox2.x1);
    let y1 = bbox1.y1.max(bbox2.y1);
    let x2 = bbox1.x2.min(bbox2.x2);
    let y2 = bbox1.y2.min(bbox2.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.width() * bbox1.height() + bbox2.width() * bbox2.height() - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// 近似匹配: 四个坐标的绝对差都不超过阈值
pub fn boxes_match(a: &BBox, b: &BBox, threshold: f32) -> bool {
    a.coords()
        .iter()
        .zip(b.coords().iter())
        .all(|(x, y)| (x - y).abs() <= threshold)
}

/// 按跟踪器输出顺序取第一个匹配的轨迹 (贪心, 非全局最优)
pub fn match_track(bbox: &BBox, tracks: &[TrackedBox], threshold: f32) -> Option<u64> {
    tracks
        .iter()
        .find(|t| boxes_match(bbox, &t.bbox, threshold))
        .map(|t| t.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox::new(x1, y1, x2, y2)
    }

    #[test]
    fn boxes_match_is_reflexive() {
        let samples = [
            b(0.0, 0.0, 0.0, 0.0),
            b(10.5, 20.25, 300.0, 400.0),
            b(-3.0, -7.0, 1e6, 2e6),
        ];
        for bbox in &samples {
            for threshold in [0.0, 0.5, 5.0, 100.0] {
                assert!(boxes_match(bbox, bbox, threshold));
            }
        }
    }

    #[test]
    fn boxes_match_rejects_any_coordinate_over_threshold() {
        let base = b(100.0, 100.0, 200.0, 200.0);
        assert!(boxes_match(&base, &b(105.0, 95.0, 205.0, 195.0), 5.0));
        assert!(!boxes_match(&base, &b(105.1, 100.0, 200.0, 200.0), 5.0));
        assert!(!boxes_match(&base, &b(100.0, 100.0, 200.0, 206.0), 5.0));
    }

    #[test]
    fn match_track_takes_first_in_tracker_order() {
        let tracks = vec![
            TrackedBox { id: 7, bbox: b(101.0, 101.0, 201.0, 201.0) },
            TrackedBox { id: 3, bbox: b(100.0, 100.0, 200.0, 200.0) },
        ];
        let det = b(100.0, 100.0, 200.0, 200.0);
        assert_eq!(match_track(&det, &tracks, 5.0), Some(7));
        assert_eq!(match_track(&det, &tracks, 0.5), Some(3));
        assert_eq!(match_track(&b(0.0, 0.0, 10.0, 10.0), &tracks, 5.0), None);
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = b(0.0, 0.0, 10.0, 10.0);
        assert_eq!(compute_iou(&a, &b(20.0, 20.0, 30.0, 30.0)), 0.0);
        assert!((compute_iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn kalman_stays_on_static_box() {
        let bbox = b(50.0, 60.0, 150.0, 160.0);
        let mut kf = KalmanBoxFilter::new(&bbox, 0.1, 0.5);
        for _ in 0..20 {
            kf.predict();
            kf.update(&bbox);
        }
        assert!(boxes_match(&kf.state_bbox(), &bbox, 0.5));
    }
}
