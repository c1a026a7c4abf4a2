// src/main.rs
use anyhow::{Context, Result};
use clap::Parser;
use shoulder_measure::camera::{CameraDevice, SyntheticCamera};
use shoulder_measure::export::MeasurementLog;
use shoulder_measure::pose::SimulatedPoseDetector;
use shoulder_measure::profile::{JsonProfileStore, StaticIdentity, UserId};
use shoulder_measure::render::ImageSurface;
use shoulder_measure::{LifecycleState, MeasureConfig, MeasurementSession};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{info, warn};

/// Run a shoulder-width measurement session and save the result
#[derive(Parser, Debug)]
#[command(name = "shoulder_measure")]
#[command(about = "Estimate shoulder width and garment size from a live pose feed", long_about = None)]
struct Args {
    /// Height in whole centimetres
    #[arg(long)]
    height: String,

    /// JSON config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to measure before saving
    #[arg(short, long, default_value = "5")]
    seconds: u64,

    /// Signed-in user id; without it the result is not saved
    #[arg(short, long)]
    user: Option<String>,

    /// Profile store file, overriding the config
    #[arg(long)]
    store: Option<PathBuf>,

    /// Directory to export the per-second measurement log to
    #[arg(short, long)]
    export: Option<PathBuf>,

    /// Capture from the real camera instead of synthetic frames
    #[cfg(feature = "camera")]
    #[arg(long)]
    camera: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MeasureConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MeasureConfig::default(),
    };
    if let Some(store) = &args.store {
        config.store.profile_path = store.clone();
    }

    let auth = match &args.user {
        Some(user) => StaticIdentity::signed_in(UserId::new(user.as_str())),
        None => StaticIdentity::anonymous(),
    };
    let store = JsonProfileStore::new(&config.store.profile_path);
    let surface = ImageSurface::new(config.overlay.clone()).into_shared();

    let mut session = MeasurementSession::new(
        camera_for(&args, &config),
        Arc::new(SimulatedPoseDetector::default().with_warmup(Duration::from_millis(500))),
        surface.clone(),
        Arc::new(auth),
        Arc::new(store),
        config,
    );

    println!("Initializing pose model...");
    session
        .start(args.height.as_str())
        .await
        .context("could not start measuring")?;

    println!("Measuring for {}s, stand facing the camera...", args.seconds);
    let mut log = MeasurementLog::new(None);
    let started = Instant::now();
    let mut ticker = time::interval(Duration::from_secs(1));
    ticker.tick().await;

    for _ in 0..args.seconds {
        ticker.tick().await;
        if let LifecycleState::Errored(err) = session.state() {
            warn!("Capture failed: {}", err);
            break;
        }

        let current = session.current_measurement();
        log.record(started.elapsed().as_millis() as u64, current.as_ref());
        match current {
            Some(m) => println!(
                "  {:>6.1} px  ->  {:.1} cm ({})",
                m.pixel_distance, m.estimated_width_cm, m.size_class
            ),
            None => println!("  no shoulders detected yet"),
        }
    }

    match log.last_measured() {
        Some(m) => println!(
            "Last of {} readings: {:.1} cm ({})",
            log.len(),
            m.estimated_width_cm,
            m.size_class
        ),
        None => println!("No measurement in {} readings", log.len()),
    }

    if args.user.is_some() {
        match session.save().await {
            Ok(profile) => println!(
                "Saved {} cm ({}) for {}",
                profile.shoulder_width_cm, profile.size_class, profile.user_id
            ),
            Err(e) => println!("Not saved: {}", e),
        }
    }

    let frames = surface
        .lock()
        .map(|s| s.presented_frames())
        .unwrap_or_default();
    session.stop().await;
    info!("Session finished after {} frames", frames);

    if let Some(dir) = &args.export {
        let path = log.export_csv(dir)?;
        println!("Measurement log written to {}", path.display());
    }

    Ok(())
}

#[cfg(feature = "camera")]
fn camera_for(args: &Args, config: &MeasureConfig) -> Arc<dyn CameraDevice> {
    if args.camera {
        Arc::new(shoulder_measure::camera::NativeCamera::new())
    } else {
        synthetic(config)
    }
}

#[cfg(not(feature = "camera"))]
fn camera_for(_args: &Args, config: &MeasureConfig) -> Arc<dyn CameraDevice> {
    synthetic(config)
}

fn synthetic(config: &MeasureConfig) -> Arc<dyn CameraDevice> {
    Arc::new(SyntheticCamera::new(config.capture.width, config.capture.height))
}
