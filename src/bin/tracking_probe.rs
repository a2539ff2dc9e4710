//! Smoke-test binary: runs a connection over the simulated backend for a
//! couple of seconds and reports what came through.

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use handlink::{Controller, ImageKind, SdkEvent, SimulatedBackend};

#[derive(Default, Serialize)]
struct ProbeSummary {
    frames: u64,
    images: u64,
    devices: Vec<String>,
    last_frame_id: i64,
    last_hand_count: usize,
    framerate: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("Probing the tracking pipeline over the simulated backend...\n");

    let controller = Controller::new(Box::new(SimulatedBackend::new()))?;
    let events = controller.event_channel();

    let mut summary = ProbeSummary::default();
    let mut image_requested = false;
    let deadline = Instant::now() + Duration::from_secs(2);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let event = match events.recv_timeout(remaining) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match event {
            SdkEvent::Connected => println!("✓ Connected"),
            SdkEvent::DeviceAttached(device) => {
                println!("✓ Device attached: {}", device.serial);
                summary.devices.push(device.serial);
            }
            SdkEvent::FrameReady(frame) => {
                summary.frames += 1;
                summary.last_frame_id = frame.id;
                summary.last_hand_count = frame.hands.len();
                summary.framerate = frame.current_fps;
                if !image_requested {
                    image_requested = true;
                    controller.request_images(frame.id, ImageKind::Default)?;
                }
            }
            SdkEvent::ImageReady(image) => {
                println!("✓ Image ready: {}x{}", image.width(), image.height());
                summary.images += 1;
            }
            SdkEvent::ImageRequestFailed(failure) => {
                println!("✗ Image request failed: {}", failure.message);
            }
            _ => {}
        }
    }

    controller.connection().stop();

    if summary.frames == 0 {
        println!("✗ No frames arrived");
    } else {
        println!("✓ {} frames, {} images", summary.frames, summary.images);
    }
    println!("\n{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
