// src/config.rs
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Everything tunable about a measurement session.
///
/// The calibration constants are coarse heuristics picked by eye, so they
/// live here rather than in the estimator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureConfig {
    pub smoothing: SmoothingConfig,
    pub estimator: EstimatorConfig,
    pub capture: CaptureConfig,
    pub overlay: OverlayConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Weight of the newest sample, in (0, 1]
    pub alpha: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self { alpha: 0.4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// k1: shoulder width per centimetre of body height
    pub height_coefficient: f64,
    /// k2: centimetres per pixel of shoulder span
    pub pixel_coefficient: f64,
    /// Widths at or above this are at least M
    pub medium_min_cm: f64,
    /// Widths strictly above this are L
    pub large_above_cm: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            height_coefficient: 0.23,
            pixel_coefficient: 0.02,
            medium_min_cm: 40.0,
            large_above_cm: 45.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    /// Display refresh rate driving the frame loop
    pub refresh_hz: u32,
    /// Show the video (and overlay) mirrored, selfie style
    pub mirror: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 1280,
            height: 720,
            refresh_hz: 60,
            mirror: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub point_radius: u32,
    pub line_width: u32,
    pub point_color: [u8; 4],
    pub line_color: [u8; 4],
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            point_radius: 10,
            line_width: 3,
            point_color: [0, 255, 0, 255],
            line_color: [70, 130, 240, 255],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub profile_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let base = directories::ProjectDirs::from("com", "ShoulderMeasure", "shoulder_measure")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./output"));
        Self {
            profile_path: base.join("profiles.json"),
        }
    }
}

impl MeasureConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: MeasureConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let alpha = self.smoothing.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "smoothing.alpha must be in (0, 1], got {alpha}"
            )));
        }

        let est = &self.estimator;
        if !est.height_coefficient.is_finite() || !est.pixel_coefficient.is_finite() {
            return Err(ConfigError::Invalid("estimator coefficients must be finite".into()));
        }
        if est.medium_min_cm > est.large_above_cm {
            return Err(ConfigError::Invalid(format!(
                "estimator.medium_min_cm ({}) must not exceed large_above_cm ({})",
                est.medium_min_cm, est.large_above_cm
            )));
        }

        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Invalid("capture resolution must be non-zero".into()));
        }
        if self.capture.refresh_hz == 0 || self.capture.refresh_hz > 240 {
            return Err(ConfigError::Invalid(format!(
                "capture.refresh_hz must be in 1..=240, got {}",
                self.capture.refresh_hz
            )));
        }

        Ok(())
    }
}
