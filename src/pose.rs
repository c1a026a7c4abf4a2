// src/pose.rs - Landmark types and the pose-estimation collaborator
use crate::camera::VideoFrame;
use crate::error::PoseError;
use async_trait::async_trait;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Body-model indices in the standard 33-point pose layout.
const LEFT_SHOULDER: usize = 11;
const RIGHT_SHOULDER: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkId {
    LeftShoulder,
    RightShoulder,
}

/// A landmark position normalized to [0, 1] of the frame width and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
}

impl Keypoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Scale into pixel space for a frame of the given size.
    pub fn to_pixels(self, width: u32, height: u32) -> Point2<f64> {
        Point2::new(self.x * width as f64, self.y * height as f64)
    }
}

impl From<Point2<f64>> for Keypoint {
    fn from(p: Point2<f64>) -> Self {
        Self { x: p.x, y: p.y }
    }
}

impl From<Keypoint> for Point2<f64> {
    fn from(k: Keypoint) -> Self {
        Point2::new(k.x, k.y)
    }
}

/// One detection: tracked landmarks for a single video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkFrame {
    pub timestamp_ms: u64,
    landmarks: BTreeMap<LandmarkId, Keypoint>,
}

impl LandmarkFrame {
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            landmarks: BTreeMap::new(),
        }
    }

    pub fn with_shoulders(timestamp_ms: u64, left: Keypoint, right: Keypoint) -> Self {
        let mut frame = Self::new(timestamp_ms);
        frame.insert(LandmarkId::LeftShoulder, left);
        frame.insert(LandmarkId::RightShoulder, right);
        frame
    }

    /// Pick the tracked landmarks out of a full-body model output
    /// (`[x, y, z]` per landmark). Returns `None` if the body is incomplete.
    pub fn from_pose_landmarks(landmarks: &[[f64; 3]], timestamp_ms: u64) -> Option<Self> {
        if landmarks.len() <= RIGHT_SHOULDER {
            return None;
        }
        let left = landmarks[LEFT_SHOULDER];
        let right = landmarks[RIGHT_SHOULDER];
        Some(Self::with_shoulders(
            timestamp_ms,
            Keypoint::new(left[0], left[1]),
            Keypoint::new(right[0], right[1]),
        ))
    }

    pub fn insert(&mut self, id: LandmarkId, point: Keypoint) {
        self.landmarks.insert(id, point);
    }

    pub fn get(&self, id: LandmarkId) -> Option<Keypoint> {
        self.landmarks.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LandmarkId, Keypoint)> + '_ {
        self.landmarks.iter().map(|(id, kp)| (*id, *kp))
    }

    pub fn shoulders(&self) -> Option<(Keypoint, Keypoint)> {
        Some((
            self.get(LandmarkId::LeftShoulder)?,
            self.get(LandmarkId::RightShoulder)?,
        ))
    }
}

/// The pose-estimation model. Given a frame and a monotonic timestamp it
/// returns the landmarks it found, or `None` when no body was detected.
#[async_trait]
pub trait PoseDetector: Send + Sync {
    /// Load model assets. Awaited on every start before the camera is
    /// requested; must be cheap once the model is loaded.
    async fn initialize(&self) -> Result<(), PoseError> {
        Ok(())
    }

    async fn detect(
        &self,
        frame: &VideoFrame,
        timestamp_ms: u64,
    ) -> Result<Option<LandmarkFrame>, PoseError>;
}

/// Stand-in model producing slightly jittery shoulders with periodic
/// dropouts, for running the pipeline without real inference.
pub struct SimulatedPoseDetector {
    dropout_every: u64,
    warmup: Duration,
    ready: AtomicBool,
    calls: AtomicU64,
}

impl SimulatedPoseDetector {
    /// `dropout_every` of 0 disables dropouts.
    pub fn new(dropout_every: u64) -> Self {
        Self {
            dropout_every,
            warmup: Duration::ZERO,
            ready: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Pretend loading the model takes `warmup`.
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedPoseDetector {
    fn default() -> Self {
        Self::new(15)
    }
}

#[async_trait]
impl PoseDetector for SimulatedPoseDetector {
    async fn initialize(&self) -> Result<(), PoseError> {
        if self.is_ready() {
            return Ok(());
        }
        info!("Initializing simulated pose model");
        tokio::time::sleep(self.warmup).await;
        self.ready.store(true, Ordering::SeqCst);
        info!("Pose model ready");
        Ok(())
    }

    async fn detect(
        &self,
        _frame: &VideoFrame,
        timestamp_ms: u64,
    ) -> Result<Option<LandmarkFrame>, PoseError> {
        if !self.is_ready() {
            return Err(PoseError::NotReady);
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.dropout_every > 0 && n % self.dropout_every == 0 {
            return Ok(None);
        }

        let t = timestamp_ms as f64 / 1000.0;
        let left = Keypoint::new(0.44 + 0.004 * (t * 7.3).sin(), 0.35 + 0.003 * (t * 5.1).cos());
        let right = Keypoint::new(0.56 + 0.004 * (t * 6.7).cos(), 0.35 + 0.003 * (t * 4.9).sin());
        Ok(Some(LandmarkFrame::with_shoulders(timestamp_ms, left, right)))
    }
}

/// Replays a fixed sequence of detections (`None` = no body in that frame).
pub struct ScriptedPoseDetector {
    script: Vec<Option<LandmarkFrame>>,
    looping: bool,
    cursor: AtomicUsize,
}

impl ScriptedPoseDetector {
    /// Plays the script once, then reports no detection.
    pub fn once(script: impl IntoIterator<Item = Option<LandmarkFrame>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            looping: false,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Plays the script over and over.
    pub fn looping(script: impl IntoIterator<Item = Option<LandmarkFrame>>) -> Self {
        Self {
            looping: true,
            ..Self::once(script)
        }
    }

    /// Number of detection requests served so far.
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoseDetector for ScriptedPoseDetector {
    async fn detect(
        &self,
        _frame: &VideoFrame,
        timestamp_ms: u64,
    ) -> Result<Option<LandmarkFrame>, PoseError> {
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        let step = if self.looping && !self.script.is_empty() {
            self.script.get(idx % self.script.len())
        } else {
            self.script.get(idx)
        };

        Ok(step.cloned().flatten().map(|mut frame| {
            frame.timestamp_ms = timestamp_ms;
            frame
        }))
    }
}
