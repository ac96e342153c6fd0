// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 yuvsnap contributors
//
// Capture tests against a real V4L2 camera.
//
// They expect a YUYV capable camera on /dev/video0 (override with
// YUVSNAP_DEVICE) and are ignored by default:
//   cargo test --test hardware -- --ignored --nocapture

use std::time::{Duration, Instant};

use serial_test::serial;
use yuvsnap::{
    config::DeviceConfig,
    pool::BufferState,
    sink::{yuyv_to_rgb, FrameView},
    stream::{StreamController, StreamState},
    Error,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn device() -> String {
    std::env::var("YUVSNAP_DEVICE").unwrap_or_else(|_| "/dev/video0".to_owned())
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[ignore = "test requires a V4L2 camera (run with --include-ignored to enable)"]
#[test]
#[serial]
fn test_capabilities() -> Result<(), Error> {
    init_logging();
    let mut camera = StreamController::new();
    camera.configure(&DeviceConfig::default().with_device(&device()))?;

    let caps = camera.capabilities().expect("configured controller has capabilities");
    println!(
        "{} ({}) on {} version {}",
        caps.card,
        caps.driver,
        caps.bus_info,
        caps.version_string()
    );
    assert!(caps.supports_streaming());
    assert!(caps.supports_capture());

    camera.teardown()?;
    Ok(())
}

#[ignore = "test requires a V4L2 camera (run with --include-ignored to enable)"]
#[test]
#[serial]
fn test_capture_frames() -> Result<(), Error> {
    init_logging();
    let config = DeviceConfig::default()
        .with_device(&device())
        .with_resolution(640, 480)
        .with_buffers(4);

    let mut camera = StreamController::new();
    let format = camera.configure(&config)?;
    println!("negotiated {} with {} buffers", format, camera.pool_size());
    camera.stream_on()?;

    let mut last_sequence = None;
    for _ in 0..30 {
        let now = Instant::now();
        let frame = camera.acquire_frame(TIMEOUT)?;
        let data = camera.frame_data(&frame)?;
        assert!(data.len() >= format.min_frame_len());

        let rgb = yuyv_to_rgb(&FrameView::new(data, frame.format()))?;
        assert_eq!(rgb.len(), (format.width * format.height * 3) as usize);
        println!("{} [elapsed: {:.2?}]", frame, now.elapsed());

        if let Some(last) = last_sequence {
            assert!(frame.sequence() > last);
        }
        last_sequence = Some(frame.sequence());
        camera.release_frame(frame)?;
    }

    camera.stream_off()?;
    assert_eq!(camera.state(), StreamState::Configured);
    assert_eq!(
        camera.pool().map(|p| p.count(BufferState::Free)),
        Some(camera.pool_size())
    );
    camera.teardown()?;
    Ok(())
}

#[ignore = "test requires a V4L2 camera (run with --include-ignored to enable)"]
#[test]
#[serial]
fn test_restart_stream() -> Result<(), Error> {
    init_logging();
    let mut camera = StreamController::new();
    camera.configure(&DeviceConfig::default().with_device(&device()))?;

    for _ in 0..3 {
        camera.stream_on()?;
        let frame = camera.acquire_frame(TIMEOUT)?;
        camera.release_frame(frame)?;
        camera.stream_off()?;
    }

    camera.teardown()?;
    Ok(())
}
