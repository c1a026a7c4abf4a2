// src/lifecycle.rs - Capture/render lifecycle and the per-frame loop
//
// Idle -> Acquiring -> Running -> Stopped, with Errored reachable from
// Acquiring (grant refused) or Running (device lost).
use crate::camera::{CameraDevice, CaptureRequest, FrameSize, VideoFrame, VideoStream};
use crate::config::MeasureConfig;
use crate::error::{DeviceError, StartError};
use crate::measurement::{HeightCm, MeasurementEstimator, MeasurementResult};
use crate::pose::{LandmarkFrame, LandmarkId, PoseDetector};
use crate::render::{Overlay, SharedSurface};
use crate::smoothing::KeypointSmoother;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Acquiring,
    Running,
    Stopped,
    Errored(DeviceError),
}

/// Loop-continuation flag. Checked at the top of every frame iteration and
/// the only thing that decides whether the loop keeps going.
#[derive(Debug, Clone)]
pub struct LoopToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    running: AtomicBool,
    notify: Notify,
}

impl LoopToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                running: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Completes once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a cancel in between is not missed
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for LoopToken {
    fn default() -> Self {
        Self::new()
    }
}

type MeasurementTx = Arc<watch::Sender<Option<MeasurementResult>>>;

/// Owns the camera session and the frame loop driving
/// detect -> smooth -> estimate -> draw.
pub struct CaptureLifecycle {
    camera: Arc<dyn CameraDevice>,
    detector: Arc<dyn PoseDetector>,
    surface: SharedSurface,
    config: MeasureConfig,
    state: LifecycleState,
    active: Option<ActiveLoop>,
    latest: MeasurementTx,
}

struct ActiveLoop {
    token: LoopToken,
    handle: JoinHandle<Box<dyn VideoStream>>,
    fault: watch::Receiver<Option<DeviceError>>,
}

impl CaptureLifecycle {
    pub fn new(
        camera: Arc<dyn CameraDevice>,
        detector: Arc<dyn PoseDetector>,
        surface: SharedSurface,
        config: MeasureConfig,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            camera,
            detector,
            surface,
            config,
            state: LifecycleState::Idle,
            active: None,
            latest: Arc::new(latest),
        }
    }

    /// Current state. A loop that lost its camera reports `Errored` until
    /// the error is acknowledged or the session is stopped.
    pub fn state(&self) -> LifecycleState {
        if let (LifecycleState::Running, Some(active)) = (&self.state, &self.active) {
            if let Some(err) = active.fault.borrow().clone() {
                return LifecycleState::Errored(err);
            }
        }
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn current(&self) -> Option<MeasurementResult> {
        *self.latest.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MeasurementResult>> {
        self.latest.subscribe()
    }

    /// Bring the model up, acquire the camera and spawn the frame loop. A
    /// model that fails to load leaves the lifecycle `Idle` without touching
    /// the camera.
    pub async fn start(&mut self, height: HeightCm) -> Result<(), StartError> {
        if self.active.is_some() {
            warn!("Start requested while capture is active; stopping the previous session first");
            self.stop().await;
        }
        if let LifecycleState::Errored(_) = self.state {
            self.acknowledge().await;
        }

        self.state = LifecycleState::Acquiring;
        debug!("Waiting for pose model");
        if let Err(err) = self.detector.initialize().await {
            warn!("Pose model failed to initialize: {}", err);
            self.state = LifecycleState::Idle;
            return Err(err.into());
        }

        let request = CaptureRequest::from(&self.config.capture);
        info!(
            "Requesting camera {} at {}x{}",
            request.camera_index, request.width, request.height
        );

        let mut stream = match self.camera.acquire(&request).await {
            Ok(stream) => stream,
            Err(err) => return Err(self.fail(err).into()),
        };
        let size = match stream.open().await {
            Ok(size) => size,
            Err(err) => {
                stream.close();
                return Err(self.fail(err).into());
            }
        };

        let token = LoopToken::new();
        let (fault_tx, fault_rx) = watch::channel(None);
        self.latest.send_replace(None);

        let frame_loop = FrameLoop {
            stream,
            detector: self.detector.clone(),
            smoother: KeypointSmoother::new(self.config.smoothing.alpha),
            estimator: MeasurementEstimator::new(self.config.estimator.clone()),
            height,
            surface: self.surface.clone(),
            mirror: self.config.capture.mirror,
            period: Duration::from_secs_f64(1.0 / self.config.capture.refresh_hz.max(1) as f64),
            token: token.clone(),
            latest: self.latest.clone(),
            fault: fault_tx,
            frames: 0,
        };
        let handle = tokio::spawn(frame_loop.run());

        self.active = Some(ActiveLoop {
            token,
            handle,
            fault: fault_rx,
        });
        self.state = LifecycleState::Running;
        info!("Capture running at {}x{} for height {}", size.width, size.height, height);
        Ok(())
    }

    /// Stop capturing. Once this returns no further frame is processed and
    /// the camera has been released.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        // flag first, so a frame already in flight cannot schedule another
        active.token.cancel();

        match active.handle.await {
            Ok(mut stream) => stream.close(),
            Err(err) => error!("Frame loop ended abnormally: {}", err),
        }

        self.latest.send_replace(None);
        self.state = LifecycleState::Stopped;
        info!("Capture stopped");
    }

    /// Clear an error so a new start can be attempted.
    pub async fn acknowledge(&mut self) {
        if let LifecycleState::Errored(err) = self.state() {
            debug!("Acknowledged camera error: {}", err);
            self.stop().await;
            self.state = LifecycleState::Idle;
        }
    }

    fn fail(&mut self, err: DeviceError) -> DeviceError {
        warn!("Camera acquisition failed: {}", err);
        self.state = LifecycleState::Errored(err.clone());
        err
    }
}

impl Drop for CaptureLifecycle {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.token.cancel();
            // dropping the task drops its stream, which releases the camera
            active.handle.abort();
        }
    }
}

struct FrameLoop {
    stream: Box<dyn VideoStream>,
    detector: Arc<dyn PoseDetector>,
    smoother: KeypointSmoother,
    estimator: MeasurementEstimator,
    height: HeightCm,
    surface: SharedSurface,
    mirror: bool,
    period: Duration,
    token: LoopToken,
    latest: MeasurementTx,
    fault: watch::Sender<Option<DeviceError>>,
    frames: u64,
}

impl FrameLoop {
    async fn run(mut self) -> Box<dyn VideoStream> {
        let token = self.token.clone();
        let started = Instant::now();
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if !token.is_running() {
                break;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.fit_surface(self.stream.frame_size());

            let captured = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                captured = capture(&mut self.stream, self.detector.as_ref(), started) => captured,
            };

            match captured {
                Ok((frame, landmarks)) => self.process(frame.size(), landmarks),
                Err(err) => {
                    error!("Camera stream failed: {}", err);
                    // a dead session keeps neither its result nor the device
                    self.stream.close();
                    self.latest.send_replace(None);
                    self.fault.send_replace(Some(err));
                    break;
                }
            }
        }

        debug!("Frame loop exited after {} frames", self.frames);
        self.stream
    }

    fn fit_surface(&self, size: FrameSize) {
        let mut surface = self.surface.lock().unwrap_or_else(PoisonError::into_inner);
        if surface.size() != size {
            debug!("Resizing render surface to {}x{}", size.width, size.height);
            surface.resize(size);
        }
    }

    fn process(&mut self, size: FrameSize, landmarks: Option<LandmarkFrame>) {
        self.frames += 1;

        let detected = match &landmarks {
            Some(frame) => {
                for (id, raw) in frame.iter() {
                    self.smoother.update(id, raw);
                }
                frame.shoulders().is_some()
            }
            None => {
                trace!("No pose on frame {}; holding last position", self.frames);
                false
            }
        };

        let shoulders = if detected {
            let to_px = |id| self.smoother.get(id).map(|k| k.to_pixels(size.width, size.height));
            to_px(LandmarkId::LeftShoulder).zip(to_px(LandmarkId::RightShoulder))
        } else {
            None
        };

        if let Some((left, right)) = shoulders {
            if let Some(result) = self.estimator.estimate_frame(Some(left), Some(right), self.height) {
                if self.token.is_running() {
                    self.latest.send_replace(Some(result));
                }
            }
        }

        let current = *self.latest.borrow();
        let overlay = Overlay::compose(shoulders, current.as_ref(), size, self.mirror);

        self.fit_surface(size);
        self.surface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .present(&overlay);
    }
}

async fn capture(
    stream: &mut Box<dyn VideoStream>,
    detector: &dyn PoseDetector,
    started: Instant,
) -> Result<(VideoFrame, Option<LandmarkFrame>), DeviceError> {
    let frame = stream.next_frame().await?;
    let timestamp_ms = started.elapsed().as_millis() as u64;
    let landmarks = match detector.detect(&frame, timestamp_ms).await {
        Ok(landmarks) => landmarks,
        Err(err) => {
            warn!("Pose detection failed on frame {}: {}", frame.sequence, err);
            None
        }
    };
    Ok((frame, landmarks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;
    use crate::config::OverlayConfig;
    use crate::error::PoseError;
    use crate::pose::{Keypoint, ScriptedPoseDetector, SimulatedPoseDetector};
    use crate::render::{ImageSurface, RenderSurface};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn shoulders(left_x: f64, right_x: f64) -> LandmarkFrame {
        LandmarkFrame::with_shoulders(0, Keypoint::new(left_x, 0.5), Keypoint::new(right_x, 0.5))
    }

    fn height() -> HeightCm {
        HeightCm::try_from(175i64).unwrap()
    }

    fn config(alpha: f64) -> MeasureConfig {
        let mut config = MeasureConfig::default();
        config.smoothing.alpha = alpha;
        config.capture.mirror = false;
        config
    }

    struct Rig {
        camera: Arc<SyntheticCamera>,
        surface: Arc<Mutex<ImageSurface>>,
        lifecycle: CaptureLifecycle,
    }

    fn rig(camera: SyntheticCamera, detector: Arc<dyn PoseDetector>, config: MeasureConfig) -> Rig {
        let camera = Arc::new(camera);
        let surface = ImageSurface::new(OverlayConfig::default()).into_shared();
        let lifecycle = CaptureLifecycle::new(camera.clone(), detector, surface.clone(), config);
        Rig {
            camera,
            surface,
            lifecycle,
        }
    }

    fn presented(surface: &Arc<Mutex<ImageSurface>>) -> u64 {
        surface.lock().unwrap().presented_frames()
    }

    /// Detector whose shoulder positions the test can move between sessions.
    struct MovableDetector {
        frame: Mutex<LandmarkFrame>,
    }

    #[async_trait]
    impl PoseDetector for MovableDetector {
        async fn detect(&self, _: &VideoFrame, ts: u64) -> Result<Option<LandmarkFrame>, PoseError> {
            let mut frame = self.frame.lock().unwrap().clone();
            frame.timestamp_ms = ts;
            Ok(Some(frame))
        }
    }

    /// Model whose assets never load.
    struct BrokenModel;

    #[async_trait]
    impl PoseDetector for BrokenModel {
        async fn initialize(&self) -> Result<(), PoseError> {
            Err(PoseError::NotReady)
        }

        async fn detect(&self, _: &VideoFrame, _: u64) -> Result<Option<LandmarkFrame>, PoseError> {
            Err(PoseError::NotReady)
        }
    }

    /// Detector that never finishes until the gate opens.
    struct GatedDetector {
        calls: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl PoseDetector for GatedDetector {
        async fn detect(&self, _: &VideoFrame, ts: u64) -> Result<Option<LandmarkFrame>, PoseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(Some(LandmarkFrame::with_shoulders(
                ts,
                Keypoint::new(0.4, 0.5),
                Keypoint::new(0.6, 0.5),
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_and_publishes_measurements() {
        let detector = Arc::new(ScriptedPoseDetector::looping([Some(shoulders(0.45, 0.55))]));
        let mut rig = rig(SyntheticCamera::new(640, 480), detector.clone(), config(0.4));
        assert_eq!(rig.lifecycle.state(), LifecycleState::Idle);

        rig.lifecycle.start(height()).await.unwrap();
        assert_eq!(rig.lifecycle.state(), LifecycleState::Running);

        time::sleep(Duration::from_millis(250)).await;
        assert!(detector.calls() > 5);

        let current = rig.lifecycle.current().unwrap();
        assert!((current.pixel_distance - 64.0).abs() < 1e-9);
        assert!(presented(&rig.surface) > 5);

        // surface follows the stream's native size, not the requested one
        assert_eq!(rig.surface.lock().unwrap().size(), FrameSize::new(640, 480));
        assert!(rig.surface.lock().unwrap().caption().is_some());

        rig.lifecycle.stop().await;
        assert_eq!(rig.lifecycle.state(), LifecycleState::Stopped);
        assert_eq!(rig.lifecycle.current(), None);
        assert_eq!(rig.camera.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_camera_errors_then_recovers() {
        let detector = Arc::new(ScriptedPoseDetector::looping([Some(shoulders(0.4, 0.6))]));
        let mut rig = rig(SyntheticCamera::new(320, 240), detector, config(0.4));

        rig.camera.fail_next(DeviceError::PermissionDenied);
        let err = rig.lifecycle.start(height()).await.unwrap_err();
        assert_eq!(err, StartError::Device(DeviceError::PermissionDenied));
        assert_eq!(
            rig.lifecycle.state(),
            LifecycleState::Errored(DeviceError::PermissionDenied)
        );
        assert_eq!(rig.camera.grants(), 0);

        rig.lifecycle.acknowledge().await;
        assert_eq!(rig.lifecycle.state(), LifecycleState::Idle);

        rig.lifecycle.start(height()).await.unwrap();
        assert!(rig.lifecycle.is_running());
        rig.lifecycle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_replaces_first_capture() {
        let detector = Arc::new(ScriptedPoseDetector::looping([Some(shoulders(0.4, 0.6))]));
        let mut rig = rig(SyntheticCamera::new(320, 240), detector, config(0.4));

        rig.lifecycle.start(height()).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        rig.lifecycle.start(height()).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;

        assert!(rig.lifecycle.is_running());
        assert_eq!(rig.camera.grants(), 2);
        assert_eq!(rig.camera.active(), 1);
        // the running capture still holds the device exclusively
        let request = CaptureRequest::from(&MeasureConfig::default().capture);
        assert!(matches!(rig.camera.acquire(&request).await, Err(DeviceError::Busy)));

        rig.lifecycle.stop().await;
        assert_eq!(rig.camera.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_inflight_frame_emits_nothing_more() {
        let detector = Arc::new(GatedDetector {
            calls: AtomicUsize::new(0),
            gate: Notify::new(),
        });
        let mut rig = rig(SyntheticCamera::new(320, 240), detector.clone(), config(0.4));

        rig.lifecycle.start(height()).await.unwrap();
        while detector.calls.load(Ordering::SeqCst) == 0 {
            time::sleep(Duration::from_millis(1)).await;
        }
        let drawn_before = presented(&rig.surface);

        rig.lifecycle.stop().await;
        detector.gate.notify_waiters();
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(presented(&rig.surface), drawn_before);
        assert_eq!(rig.lifecycle.current(), None);
        assert_eq!(rig.lifecycle.state(), LifecycleState::Stopped);
        assert_eq!(rig.camera.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_carry_smoothing_over() {
        let detector = Arc::new(MovableDetector {
            frame: Mutex::new(shoulders(0.1, 0.9)),
        });
        let mut rig = rig(SyntheticCamera::new(640, 480), detector.clone(), config(0.2));

        rig.lifecycle.start(height()).await.unwrap();
        time::sleep(Duration::from_millis(200)).await;
        rig.lifecycle.stop().await;

        *detector.frame.lock().unwrap() = shoulders(0.45, 0.55);
        rig.lifecycle.start(height()).await.unwrap();
        let mut rx = rig.lifecycle.subscribe();
        rx.changed().await.unwrap();

        let first = rx.borrow().unwrap();
        assert!((first.pixel_distance - 64.0).abs() < 1e-9);
        rig.lifecycle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gap_holds_pre_gap_baseline() {
        let detector = Arc::new(ScriptedPoseDetector::once([
            Some(shoulders(0.4, 0.6)),
            None,
            Some(shoulders(0.3, 0.7)),
        ]));
        let mut rig = rig(SyntheticCamera::new(1000, 500), detector.clone(), config(0.5));

        rig.lifecycle.start(height()).await.unwrap();
        let mut rx = rig.lifecycle.subscribe();

        rx.changed().await.unwrap();
        let before = rx.borrow_and_update().unwrap();
        assert!((before.pixel_distance - 200.0).abs() < 1e-9);

        rx.changed().await.unwrap();
        let after = rx.borrow_and_update().unwrap();
        // 0.4 + 0.5 * (0.3 - 0.4) = 0.35 and 0.65, so the span is 0.3 of the width
        assert!((after.pixel_distance - 300.0).abs() < 1e-9);
        assert!(detector.calls() >= 3);

        rig.lifecycle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_device_moves_to_errored() {
        let detector = Arc::new(ScriptedPoseDetector::looping([Some(shoulders(0.4, 0.6))]));
        let camera = SyntheticCamera::new(320, 240).with_stream_failure_after(3);
        let mut rig = rig(camera, detector, config(0.4));

        rig.lifecycle.start(height()).await.unwrap();
        time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            rig.lifecycle.state(),
            LifecycleState::Errored(DeviceError::Stream(_))
        ));
        assert_eq!(presented(&rig.surface), 3);
        assert_eq!(rig.lifecycle.current(), None);
        assert_eq!(rig.camera.active(), 0);

        rig.lifecycle.acknowledge().await;
        assert_eq!(rig.lifecycle.state(), LifecycleState::Idle);
        assert_eq!(rig.camera.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn model_failure_keeps_lifecycle_idle() {
        let detector = Arc::new(BrokenModel);
        let mut rig = rig(SyntheticCamera::new(320, 240), detector, config(0.4));

        let err = rig.lifecycle.start(height()).await.unwrap_err();
        assert_eq!(err, StartError::Model(PoseError::NotReady));
        assert_eq!(rig.lifecycle.state(), LifecycleState::Idle);
        assert_eq!(rig.camera.grants(), 0);
        assert_eq!(presented(&rig.surface), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_waits_for_model_before_running() {
        let detector = Arc::new(SimulatedPoseDetector::new(0).with_warmup(Duration::from_millis(300)));
        let mut rig = rig(SyntheticCamera::new(640, 480), detector.clone(), config(0.4));
        assert!(!detector.is_ready());

        let started = Instant::now();
        rig.lifecycle.start(height()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(detector.is_ready());
        assert_eq!(rig.lifecycle.state(), LifecycleState::Running);

        time::sleep(Duration::from_millis(100)).await;
        assert!(rig.lifecycle.current().is_some());
        rig.lifecycle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_lifecycle_releases_camera() {
        let detector = Arc::new(ScriptedPoseDetector::looping([Some(shoulders(0.4, 0.6))]));
        let rig = rig(SyntheticCamera::new(320, 240), detector, config(0.4));
        let camera = rig.camera.clone();
        let mut lifecycle = rig.lifecycle;

        lifecycle.start(height()).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        drop(lifecycle);
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(camera.active(), 0);
    }

    #[tokio::test]
    async fn token_cancel_wakes_waiters() {
        let token = LoopToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(token.is_running());
        token.cancel();
        waiter.await.unwrap();
        assert!(!token.is_running());

        // already cancelled: completes immediately
        token.cancelled().await;
    }
}
