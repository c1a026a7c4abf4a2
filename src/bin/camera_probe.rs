// src/bin/camera_probe.rs
use shoulder_measure::camera::{CameraDevice, CaptureRequest, NativeCamera};
use shoulder_measure::config::CaptureConfig;
use shoulder_measure::DeviceError;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();
    println!("Testing camera access...\n");

    match NativeCamera::list_devices() {
        Ok(names) => {
            println!("Found {} camera(s):", names.len());
            for (i, name) in names.iter().enumerate() {
                println!("  [{}] {}", i, name);
            }
        }
        Err(e) => println!("✗ Failed to query cameras: {}", e),
    }

    let request = CaptureRequest::from(&CaptureConfig::default());
    let mut stream = match NativeCamera::new().acquire(&request).await {
        Ok(stream) => {
            println!("✓ Camera {} opened", request.camera_index);
            stream
        }
        Err(e) => {
            println!("✗ Failed to open camera: {}", e);
            explain(&e);
            return;
        }
    };

    match stream.open().await {
        Ok(size) => println!("✓ Stream opened at {}x{}", size.width, size.height),
        Err(e) => {
            println!("✗ Failed to open stream: {}", e);
            explain(&e);
            return;
        }
    }

    match stream.next_frame().await {
        Ok(frame) => println!("✓ Frame {} captured successfully", frame.sequence),
        Err(e) => println!("✗ Failed to capture frame: {}", e),
    }
    stream.close();
}

fn explain(err: &DeviceError) {
    let hint = match err {
        DeviceError::PermissionDenied => "Camera permissions not granted",
        DeviceError::NoDevice => "No camera connected",
        DeviceError::Busy => "Camera is being used by another app",
        DeviceError::Unsupported(_) => "This platform backend cannot capture video",
        DeviceError::Stream(_) => "The camera stopped delivering frames",
    };
    println!("\nLikely cause: {}", hint);
}
