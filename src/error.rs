// src/error.rs
use std::convert::Infallible;
use thiserror::Error;

/// Problems with the height the user typed in before starting a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("height is required before starting a measurement")]
    MissingHeight,
    #[error("height must be a whole number of centimetres, got {0:?}")]
    NonNumericHeight(String),
    #[error("height must be greater than zero, got {0}")]
    NonPositiveHeight(i64),
}

impl From<Infallible> for ValidationError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// Reasons the camera could not be acquired or stopped delivering frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("no camera device found")]
    NoDevice,
    #[error("camera capture is not supported here: {0}")]
    Unsupported(String),
    #[error("camera is already in use by another session")]
    Busy,
    #[error("camera stream failed: {0}")]
    Stream(String),
}

/// Failures from the pose model, either while loading it or on one frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoseError {
    #[error("pose model is not ready")]
    NotReady,
    #[error("pose inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EstimateError {
    #[error("measurement unavailable: height must be positive, got {0}")]
    InvalidHeight(u32),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("profile store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("profile store data is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("profile store rejected the write: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("no signed-in user; log in before saving")]
    NotAuthenticated,
    #[error("no measurement available yet")]
    NoMeasurement,
    #[error("no height recorded for this session")]
    NoHeight,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why the capture lifecycle could not reach `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Model(#[from] PoseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Model(#[from] PoseError),
}

impl From<StartError> for SessionError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::Device(err) => SessionError::Device(err),
            StartError::Model(err) => SessionError::Model(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
