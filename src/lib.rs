// src/lib.rs
pub mod camera;
pub mod config;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod measurement;
pub mod pose;
pub mod profile;
pub mod render;
pub mod session;
pub mod smoothing;

pub use config::MeasureConfig;
pub use error::{DeviceError, PoseError, SaveError, SessionError, StartError, ValidationError};
pub use lifecycle::LifecycleState;
pub use measurement::{HeightCm, MeasurementResult, SizeClass};
pub use session::MeasurementSession;
