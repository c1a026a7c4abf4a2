// src/camera.rs - Camera device collaborator and video streams
use crate::config::CaptureConfig;
use crate::error::DeviceError;
use async_trait::async_trait;
use image::DynamicImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// One captured video frame, shared cheaply between the detector and renderer.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Arc<DynamicImage>,
    pub sequence: u64,
}

impl VideoFrame {
    pub fn new(image: Arc<DynamicImage>, sequence: u64) -> Self {
        Self { image, sequence }
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.image.width(), self.image.height())
    }
}

/// What we ask the host for when acquiring a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
}

impl From<&CaptureConfig> for CaptureRequest {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            camera_index: config.camera_index,
            width: config.width,
            height: config.height,
        }
    }
}

/// Grants exclusive access to a camera.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn acquire(&self, request: &CaptureRequest) -> Result<Box<dyn VideoStream>, DeviceError>;
}

/// A live video source. Dropping it releases the device.
#[async_trait]
pub trait VideoStream: Send {
    /// Resolves once the first frame is available, returning the native size.
    async fn open(&mut self) -> Result<FrameSize, DeviceError>;

    /// Native size of the frames currently being delivered.
    fn frame_size(&self) -> FrameSize;

    async fn next_frame(&mut self) -> Result<VideoFrame, DeviceError>;

    /// Stop streaming and hand the device back. Idempotent.
    fn close(&mut self);
}

#[derive(Debug, Default)]
struct DeviceCounters {
    grants: AtomicUsize,
    active: AtomicUsize,
}

/// In-process camera delivering blank frames at a fixed size.
///
/// Only one stream may be open at a time; a second `acquire` while one is
/// live fails with `DeviceError::Busy`, like a real exclusive device.
pub struct SyntheticCamera {
    size: FrameSize,
    next_failure: Mutex<Option<DeviceError>>,
    always_fail: Option<DeviceError>,
    fail_after_frames: Option<u64>,
    counters: Arc<DeviceCounters>,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: FrameSize::new(width, height),
            next_failure: Mutex::new(None),
            always_fail: None,
            fail_after_frames: None,
            counters: Arc::new(DeviceCounters::default()),
        }
    }

    /// Every acquisition fails with `error`.
    pub fn failing(error: DeviceError) -> Self {
        Self {
            always_fail: Some(error),
            ..Self::new(1280, 720)
        }
    }

    /// Streams die with a stream error after delivering `frames` frames.
    pub fn with_stream_failure_after(mut self, frames: u64) -> Self {
        self.fail_after_frames = Some(frames);
        self
    }

    /// Make only the next acquisition fail.
    pub fn fail_next(&self, error: DeviceError) {
        *self.next_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Total successful grants so far.
    pub fn grants(&self) -> usize {
        self.counters.grants.load(Ordering::SeqCst)
    }

    /// Streams currently holding the device.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraDevice for SyntheticCamera {
    async fn acquire(&self, request: &CaptureRequest) -> Result<Box<dyn VideoStream>, DeviceError> {
        if let Some(err) = self.always_fail.clone() {
            return Err(err);
        }
        if let Some(err) = self
            .next_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(err);
        }

        let counters = &self.counters;
        if counters
            .active
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::Busy);
        }
        counters.grants.fetch_add(1, Ordering::SeqCst);

        debug!(
            "Synthetic camera {} granted ({}x{} requested, {}x{} native)",
            request.camera_index, request.width, request.height, self.size.width, self.size.height
        );

        Ok(Box::new(SyntheticStream {
            size: self.size,
            image: Arc::new(DynamicImage::new_rgba8(self.size.width, self.size.height)),
            sequence: 0,
            fail_after_frames: self.fail_after_frames,
            counters: Some(self.counters.clone()),
        }))
    }
}

struct SyntheticStream {
    size: FrameSize,
    image: Arc<DynamicImage>,
    sequence: u64,
    fail_after_frames: Option<u64>,
    counters: Option<Arc<DeviceCounters>>,
}

#[async_trait]
impl VideoStream for SyntheticStream {
    async fn open(&mut self) -> Result<FrameSize, DeviceError> {
        if self.counters.is_none() {
            return Err(DeviceError::Stream("stream already closed".into()));
        }
        Ok(self.size)
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    async fn next_frame(&mut self) -> Result<VideoFrame, DeviceError> {
        if self.counters.is_none() {
            return Err(DeviceError::Stream("stream already closed".into()));
        }
        if let Some(limit) = self.fail_after_frames {
            if self.sequence >= limit {
                return Err(DeviceError::Stream("device disconnected".into()));
            }
        }
        self.sequence += 1;
        Ok(VideoFrame::new(self.image.clone(), self.sequence))
    }

    fn close(&mut self) {
        if let Some(counters) = self.counters.take() {
            counters.active.fetch_sub(1, Ordering::SeqCst);
            info!("Synthetic camera released after {} frames", self.sequence);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "camera")]
pub use native::NativeCamera;

/// Join a finished-or-finishing capture thread without blocking the async
/// scheduler. Inside a runtime the join moves to the blocking pool.
#[cfg_attr(not(feature = "camera"), allow(dead_code))]
fn reap_capture_thread(
    worker: std::thread::JoinHandle<()>,
    frames: u64,
) -> Option<tokio::task::JoinHandle<()>> {
    let reap = move || {
        if worker.join().is_err() {
            warn!("Camera capture thread panicked");
        }
        info!("Camera released after {} frames", frames);
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn_blocking(reap)),
        Err(_) => {
            reap();
            None
        }
    }
}

#[cfg(feature = "camera")]
mod native {
    use super::*;
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{
        ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
        Resolution,
    };
    use nokhwa::{Camera, NokhwaError};
    use std::sync::atomic::AtomicBool;
    use std::thread::JoinHandle;
    use tokio::sync::{mpsc, oneshot};

    type FrameResult = Result<DynamicImage, DeviceError>;

    /// A physical camera opened through nokhwa.
    ///
    /// The camera handle lives on its own capture thread; frames are handed
    /// to the async side over a small channel.
    #[derive(Debug, Default)]
    pub struct NativeCamera;

    impl NativeCamera {
        pub fn new() -> Self {
            Self
        }

        /// Human-readable names of the cameras the host can see.
        pub fn list_devices() -> Result<Vec<String>, DeviceError> {
            let cameras = nokhwa::query(ApiBackend::Auto).map_err(classify)?;
            Ok(cameras.iter().map(|c| c.human_name()).collect())
        }
    }

    #[async_trait]
    impl CameraDevice for NativeCamera {
        async fn acquire(
            &self,
            request: &CaptureRequest,
        ) -> Result<Box<dyn VideoStream>, DeviceError> {
            let devices = tokio::task::spawn_blocking(|| nokhwa::query(ApiBackend::Auto))
                .await
                .map_err(|e| DeviceError::Unsupported(e.to_string()))?
                .map_err(classify)?;
            if devices.is_empty() {
                return Err(DeviceError::NoDevice);
            }

            let (ready_tx, ready_rx) = oneshot::channel();
            let (frame_tx, frame_rx) = mpsc::channel(2);
            let running = Arc::new(AtomicBool::new(true));

            let worker = {
                let request = request.clone();
                let running = running.clone();
                std::thread::Builder::new()
                    .name("camera-capture".into())
                    .spawn(move || capture_loop(request, running, ready_tx, frame_tx))
                    .map_err(|e| DeviceError::Unsupported(e.to_string()))?
            };

            ready_rx
                .await
                .map_err(|_| DeviceError::Stream("capture thread exited".into()))??;

            info!("Camera {} granted", request.camera_index);
            Ok(Box::new(NativeStream {
                size: FrameSize::new(request.width, request.height),
                frames: frame_rx,
                pending: None,
                running,
                worker: Some(worker),
                sequence: 0,
            }))
        }
    }

    fn capture_loop(
        request: CaptureRequest,
        running: Arc<AtomicBool>,
        ready: oneshot::Sender<Result<(), DeviceError>>,
        frames: mpsc::Sender<FrameResult>,
    ) {
        let format = CameraFormat::new(
            Resolution::new(request.width, request.height),
            FrameFormat::MJPEG,
            30,
        );
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(format));

        let mut camera = match Camera::new(CameraIndex::Index(request.camera_index), requested) {
            Ok(camera) => camera,
            Err(e) => {
                let _ = ready.send(Err(classify(e)));
                return;
            }
        };
        if let Err(e) = camera.open_stream() {
            let _ = ready.send(Err(classify(e)));
            return;
        }
        let _ = ready.send(Ok(()));

        while running.load(Ordering::SeqCst) {
            let frame = camera
                .frame()
                .and_then(|buffer| buffer.decode_image::<RgbFormat>())
                .map(DynamicImage::ImageRgb8)
                .map_err(classify);
            let failed = frame.is_err();
            if frames.blocking_send(frame).is_err() || failed {
                break;
            }
        }

        if let Err(e) = camera.stop_stream() {
            warn!("Failed to stop camera stream: {}", e);
        }
        debug!("Capture thread finished");
    }

    fn classify(err: NokhwaError) -> DeviceError {
        let message = err.to_string();
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
            DeviceError::PermissionDenied
        } else if matches!(
            err,
            NokhwaError::UnsupportedOperationError(_) | NokhwaError::NotImplementedError(_)
        ) {
            DeviceError::Unsupported(message)
        } else if lower.contains("no device") || lower.contains("not found") {
            DeviceError::NoDevice
        } else {
            DeviceError::Stream(message)
        }
    }

    struct NativeStream {
        size: FrameSize,
        frames: mpsc::Receiver<FrameResult>,
        pending: Option<DynamicImage>,
        running: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
        sequence: u64,
    }

    impl NativeStream {
        async fn recv(&mut self) -> Result<DynamicImage, DeviceError> {
            match self.frames.recv().await {
                Some(frame) => frame,
                None => Err(DeviceError::Stream("camera stream ended".into())),
            }
        }
    }

    #[async_trait]
    impl VideoStream for NativeStream {
        async fn open(&mut self) -> Result<FrameSize, DeviceError> {
            let first = self.recv().await?;
            self.size = FrameSize::new(first.width(), first.height());
            self.pending = Some(first);
            Ok(self.size)
        }

        fn frame_size(&self) -> FrameSize {
            self.size
        }

        async fn next_frame(&mut self) -> Result<VideoFrame, DeviceError> {
            let image = match self.pending.take() {
                Some(image) => image,
                None => self.recv().await?,
            };
            self.size = FrameSize::new(image.width(), image.height());
            self.sequence += 1;
            Ok(VideoFrame::new(Arc::new(image), self.sequence))
        }

        fn close(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            self.frames.close();
            // the thread exits after its current frame
            if let Some(worker) = self.worker.take() {
                reap_capture_thread(worker, self.sequence);
            }
        }
    }

    impl Drop for NativeStream {
        fn drop(&mut self) {
            self.close();
        }
    }
}
