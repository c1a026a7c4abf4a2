// src/measurement.rs - Shoulder width estimation and size classes
use crate::config::EstimatorConfig;
use crate::error::{EstimateError, ValidationError};
use nalgebra::{distance, Point2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A validated, positive body height in whole centimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct HeightCm(u32);

impl HeightCm {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for HeightCm {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value <= 0 {
            return Err(ValidationError::NonPositiveHeight(value));
        }
        u32::try_from(value)
            .map(HeightCm)
            .map_err(|_| ValidationError::NonNumericHeight(value.to_string()))
    }
}

impl TryFrom<u32> for HeightCm {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        HeightCm::try_from(i64::from(value))
    }
}

impl FromStr for HeightCm {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::MissingHeight);
        }
        let value: i64 = trimmed
            .parse()
            .map_err(|_| ValidationError::NonNumericHeight(trimmed.to_string()))?;
        HeightCm::try_from(value)
    }
}

impl TryFrom<&str> for HeightCm {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HeightCm> for u32 {
    fn from(h: HeightCm) -> Self {
        h.0
    }
}

impl fmt::Display for HeightCm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cm", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeClass {
    S,
    M,
    L,
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SizeClass::S => "S",
            SizeClass::M => "M",
            SizeClass::L => "L",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    /// Shoulder span in frame pixels
    pub pixel_distance: f64,
    pub estimated_width_cm: f64,
    pub size_class: SizeClass,
}

/// Two-term linear model: `width = height * k1 + pixels * k2`.
///
/// Not a camera projection; the constants only have to give a plausible
/// demo-grade number, so both come from config.
#[derive(Debug, Clone)]
pub struct MeasurementEstimator {
    config: EstimatorConfig,
}

impl MeasurementEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    /// Shoulder points must already be in pixel space.
    pub fn estimate(
        &self,
        left: Point2<f64>,
        right: Point2<f64>,
        height_cm: u32,
    ) -> Result<MeasurementResult, EstimateError> {
        if height_cm == 0 {
            return Err(EstimateError::InvalidHeight(height_cm));
        }

        let pixel_distance = distance(&left, &right);
        let estimated_width_cm = height_cm as f64 * self.config.height_coefficient
            + pixel_distance * self.config.pixel_coefficient;

        Ok(MeasurementResult {
            pixel_distance,
            estimated_width_cm,
            size_class: self.classify(estimated_width_cm),
        })
    }

    /// Same as `estimate` but tolerates a missing shoulder, in which case no
    /// new result is produced for the frame.
    pub fn estimate_frame(
        &self,
        left: Option<Point2<f64>>,
        right: Option<Point2<f64>>,
        height: HeightCm,
    ) -> Option<MeasurementResult> {
        let (left, right) = (left?, right?);
        self.estimate(left, right, height.get()).ok()
    }

    pub fn classify(&self, width_cm: f64) -> SizeClass {
        if width_cm > self.config.large_above_cm {
            SizeClass::L
        } else if width_cm >= self.config.medium_min_cm {
            SizeClass::M
        } else {
            SizeClass::S
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Keypoint;

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn estimator(k1: f64, k2: f64) -> MeasurementEstimator {
        MeasurementEstimator::new(EstimatorConfig {
            height_coefficient: k1,
            pixel_coefficient: k2,
            ..EstimatorConfig::default()
        })
    }

    #[test]
    fn size_class_boundaries() {
        let e = MeasurementEstimator::new(EstimatorConfig::default());
        assert_eq!(e.classify(39.9), SizeClass::S);
        assert_eq!(e.classify(40.0), SizeClass::M);
        assert_eq!(e.classify(40.1), SizeClass::M);
        assert_eq!(e.classify(45.0), SizeClass::M);
        assert_eq!(e.classify(45.1), SizeClass::L);
    }

    #[test]
    fn thresholds_come_from_config() {
        let e = MeasurementEstimator::new(EstimatorConfig {
            medium_min_cm: 30.0,
            large_above_cm: 35.0,
            ..EstimatorConfig::default()
        });
        assert_eq!(e.classify(30.0), SizeClass::M);
        assert_eq!(e.classify(36.0), SizeClass::L);
    }

    #[test]
    fn height_parsing() {
        assert_eq!("".parse::<HeightCm>(), Err(ValidationError::MissingHeight));
        assert_eq!("   ".parse::<HeightCm>(), Err(ValidationError::MissingHeight));
        assert_eq!("0".parse::<HeightCm>(), Err(ValidationError::NonPositiveHeight(0)));
        assert_eq!("-170".parse::<HeightCm>(), Err(ValidationError::NonPositiveHeight(-170)));
        assert!(matches!("tall".parse::<HeightCm>(), Err(ValidationError::NonNumericHeight(_))));
        assert!(matches!("175.5".parse::<HeightCm>(), Err(ValidationError::NonNumericHeight(_))));
        assert_eq!(" 175 ".parse::<HeightCm>().map(HeightCm::get), Ok(175));
        assert_eq!(HeightCm::try_from(0i64), Err(ValidationError::NonPositiveHeight(0)));
    }

    #[test]
    fn pixel_distance_is_resolution_scaled() {
        let left = Keypoint::new(0.44, 0.4).to_pixels(1280, 720);
        let right = Keypoint::new(0.56, 0.4).to_pixels(1280, 720);
        let result = estimator(0.23, 5.0).estimate(left, right, 175).unwrap();

        assert!(approx_eq(result.pixel_distance, 153.6, 1e-9));
        let expected = 175.0 * 0.23 + 153.6 * 5.0;
        assert!(approx_eq(result.estimated_width_cm, expected, 1e-9));
        assert_eq!(result.size_class, SizeClass::L);
    }

    #[test]
    fn diagonal_span_uses_both_axes() {
        let left = Keypoint::new(0.4, 0.4).to_pixels(1000, 500);
        let right = Keypoint::new(0.7, 0.8).to_pixels(1000, 500);
        let result = estimator(0.0, 1.0).estimate(left, right, 1).unwrap();
        // dx = 300, dy = 200
        assert!(approx_eq(result.pixel_distance, (300.0f64.powi(2) + 200.0f64.powi(2)).sqrt(), 1e-9));
    }

    #[test]
    fn zero_height_is_unavailable() {
        let p = Point2::new(0.0, 0.0);
        assert_eq!(
            estimator(0.23, 0.02).estimate(p, p, 0),
            Err(EstimateError::InvalidHeight(0))
        );
    }

    #[test]
    fn missing_shoulder_yields_nothing() {
        let e = estimator(0.23, 0.02);
        let h = HeightCm::try_from(175i64).unwrap();
        assert!(e.estimate_frame(Some(Point2::new(1.0, 1.0)), None, h).is_none());
        assert!(e.estimate_frame(None, None, h).is_none());
        assert!(e
            .estimate_frame(Some(Point2::new(0.0, 0.0)), Some(Point2::new(100.0, 0.0)), h)
            .is_some());
    }
}
