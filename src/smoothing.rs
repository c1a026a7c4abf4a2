// src/smoothing.rs
use crate::pose::{Keypoint, LandmarkId};
use nalgebra::Point2;
use std::collections::HashMap;

/// Per-landmark exponential smoothing of keypoint positions.
///
/// Each landmark keeps one running estimate, blended toward every new sample
/// by `alpha`. The first sample of a landmark is taken as-is. Frames with no
/// detection simply don't call `update`, so the estimate holds.
#[derive(Debug, Clone)]
pub struct KeypointSmoother {
    alpha: f64,
    positions: HashMap<LandmarkId, Point2<f64>>,
}

impl KeypointSmoother {
    /// `alpha` is clamped into (0, 1]; out-of-range configs are rejected
    /// earlier by `MeasureConfig::validate`.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        Self {
            alpha,
            positions: HashMap::new(),
        }
    }

    pub fn update(&mut self, id: LandmarkId, raw: Keypoint) -> Keypoint {
        let raw = Point2::from(raw);
        let alpha = self.alpha;
        let smoothed = self
            .positions
            .entry(id)
            .and_modify(|prev| *prev += (raw - *prev) * alpha)
            .or_insert(raw);
        Keypoint::from(*smoothed)
    }

    /// Last smoothed position, if the landmark has been seen this session.
    pub fn get(&self, id: LandmarkId) -> Option<Keypoint> {
        self.positions.get(&id).copied().map(Keypoint::from)
    }

    pub fn reset(&mut self) {
        self.positions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
