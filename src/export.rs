// src/export.rs
use crate::measurement::MeasurementResult;
use anyhow::{Context, Result};
use chrono::Local;
use csv::Writer;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize)]
struct MeasurementRecord {
    sample: usize,
    elapsed_ms: u64,
    measured: bool,
    pixel_distance: Option<f64>,
    estimated_width_cm: Option<f64>,
    size_class: Option<String>,
}

/// Measurements sampled over one session, written out as CSV.
pub struct MeasurementLog {
    session_name: String,
    samples: Vec<(u64, Option<MeasurementResult>)>,
}

impl MeasurementLog {
    pub fn new(session_name: Option<String>) -> Self {
        let session_name = session_name.unwrap_or_else(|| {
            format!("session_{}", Local::now().format("%Y%m%d_%H%M%S"))
        });

        Self {
            session_name,
            samples: Vec::new(),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Record the measurement current at `elapsed_ms`; `None` means nothing
    /// had been measured yet.
    pub fn record(&mut self, elapsed_ms: u64, measurement: Option<&MeasurementResult>) {
        self.samples.push((elapsed_ms, measurement.copied()));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The most recent sample that carried a measurement.
    pub fn last_measured(&self) -> Option<&MeasurementResult> {
        self.samples.iter().rev().find_map(|(_, m)| m.as_ref())
    }

    /// Writes `<output_dir>/<session>/measurements.csv` and returns its path.
    pub fn export_csv(&self, output_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let csv_path = output_dir
            .as_ref()
            .join(&self.session_name)
            .join("measurements.csv");

        if let Some(parent) = csv_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let file = File::create(&csv_path)
            .with_context(|| format!("creating {}", csv_path.display()))?;
        let mut writer = Writer::from_writer(file);

        for (i, (elapsed_ms, measurement)) in self.samples.iter().enumerate() {
            writer.serialize(Self::create_record(i, *elapsed_ms, measurement.as_ref()))?;
        }

        writer.flush()?;
        info!("Exported {} samples to {}", self.samples.len(), csv_path.display());
        Ok(csv_path)
    }

    fn create_record(
        sample: usize,
        elapsed_ms: u64,
        measurement: Option<&MeasurementResult>,
    ) -> MeasurementRecord {
        MeasurementRecord {
            sample,
            elapsed_ms,
            measured: measurement.is_some(),
            pixel_distance: measurement.map(|m| m.pixel_distance),
            estimated_width_cm: measurement.map(|m| m.estimated_width_cm),
            size_class: measurement.map(|m| m.size_class.to_string()),
        }
    }
}
