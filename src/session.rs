// src/session.rs - Measurement session facade
use crate::camera::CameraDevice;
use crate::config::MeasureConfig;
use crate::error::{SaveError, SessionError, ValidationError};
use crate::lifecycle::{CaptureLifecycle, LifecycleState};
use crate::measurement::{HeightCm, MeasurementResult};
use crate::pose::PoseDetector;
use crate::profile::{AuthProvider, ProfileStore, UserProfile};
use crate::render::SharedSurface;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// What the UI talks to: start/stop a measurement, read the latest result,
/// and save it to the signed-in user's profile.
pub struct MeasurementSession {
    lifecycle: CaptureLifecycle,
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn ProfileStore>,
    height: Option<HeightCm>,
}

impl MeasurementSession {
    pub fn new(
        camera: Arc<dyn CameraDevice>,
        detector: Arc<dyn PoseDetector>,
        surface: SharedSurface,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn ProfileStore>,
        config: MeasureConfig,
    ) -> Self {
        Self {
            lifecycle: CaptureLifecycle::new(camera, detector, surface, config),
            auth,
            store,
            height: None,
        }
    }

    /// Validate the height and start capturing. An invalid height is rejected
    /// before the camera is touched.
    pub async fn start<H>(&mut self, height: H) -> Result<(), SessionError>
    where
        H: TryInto<HeightCm>,
        H::Error: Into<ValidationError>,
    {
        let height = match height.try_into() {
            Ok(height) => height,
            Err(err) => {
                let err: ValidationError = err.into();
                warn!("Rejected start: {}", err);
                return Err(err.into());
            }
        };

        self.lifecycle.start(height).await?;
        self.height = Some(height);
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.lifecycle.stop().await;
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub async fn acknowledge_error(&mut self) {
        self.lifecycle.acknowledge().await;
    }

    pub fn current_measurement(&self) -> Option<MeasurementResult> {
        self.lifecycle.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MeasurementResult>> {
        self.lifecycle.subscribe()
    }

    pub fn height(&self) -> Option<HeightCm> {
        self.height
    }

    /// Persist the latest measurement for the signed-in user. Failures are
    /// reported to the caller and leave the running capture alone.
    pub async fn save(&self) -> Result<UserProfile, SaveError> {
        let user = self.auth.current_user().await.ok_or(SaveError::NotAuthenticated)?;
        let measurement = self.current_measurement().ok_or(SaveError::NoMeasurement)?;
        let height = self.height.ok_or(SaveError::NoHeight)?;

        let profile = UserProfile {
            user_id: user,
            height_cm: height.get(),
            shoulder_width_cm: measurement.estimated_width_cm.round().max(0.0) as u32,
            size_class: measurement.size_class,
            updated_at: Utc::now(),
        };

        if let Err(err) = self.store.upsert(profile.clone()).await {
            warn!("Failed to save profile for {}: {}", profile.user_id, err);
            return Err(err.into());
        }

        info!(
            "Saved {} cm ({}) for {}",
            profile.shoulder_width_cm, profile.size_class, profile.user_id
        );
        Ok(profile)
    }
}
