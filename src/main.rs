//! VIO Pipeline - Demo Entry Point
//!
//! Runs the pipeline with the reference stage algorithms on a synthetic
//! stationary sequence and prints the keyframe-rate trajectory.
//!
//! Usage: `vio-pipeline [params.toml|params.json] [frames]`

use anyhow::Context;
use nalgebra::Vector3;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vio_pipeline::{
    pipeline::stages::Widget, FrameId, ImuSample, PipelineBuilder, PipelineParams, StereoImages,
    SyncPacket, VisualizerOutput,
};

const FRAME_PERIOD_NS: i64 = 50_000_000;
const IMU_PER_FRAME: i64 = 10;
const DEFAULT_FRAMES: u64 = 100;

/// A camera sitting still: gravity on the accelerometer, nothing on the gyro.
fn stationary_packet(id: u64) -> SyncPacket {
    let t0 = id as i64 * FRAME_PERIOD_NS;
    let step = FRAME_PERIOD_NS / IMU_PER_FRAME;
    let imu = (0..IMU_PER_FRAME)
        .map(|i| ImuSample::new(t0 + i * step, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()))
        .collect();
    SyncPacket::new(FrameId(id), t0, StereoImages::default(), imu)
}

fn main() -> anyhow::Result<()> {
    let (writer, _log_guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vio_pipeline=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .init();

    let mut args = std::env::args().skip(1);
    let params = match args.next() {
        Some(path) => PipelineParams::load(&path)
            .with_context(|| format!("failed to load parameters from {}", path))?,
        None => PipelineParams::default(),
    };
    let frames = match args.next() {
        Some(n) => n.parse().context("frame count must be a positive integer")?,
        None => DEFAULT_FRAMES,
    };

    tracing::info!(
        "Starting VIO pipeline ({:?} mode, {} frames)",
        params.run_mode,
        frames
    );

    let mut pipeline = PipelineBuilder::new(params)
        .with_mock_stages()
        .build()
        .context("failed to build pipeline")?;

    let keyframes = Arc::new(AtomicUsize::new(0));
    let counter = keyframes.clone();
    pipeline.register_keyframe_rate_output_callback(move |output| {
        counter.fetch_add(1, Ordering::Relaxed);
        let p = output.state().position();
        println!(
            "kf {:>5}  t={:.3}s  p=[{:+.4}, {:+.4}, {:+.4}]",
            output.frame_id,
            output.state().timestamp as f64 * 1e-9,
            p.x,
            p.y,
            p.z
        );
    });
    if pipeline.params().use_loop_closure {
        pipeline.register_lcd_pgo_output_callback(|output| {
            let closure = &output.update.closure;
            tracing::info!("Loop closure {} -> {}", closure.query, closure.matched);
        })?;
    }

    let display = pipeline.params().use_visualizer.then(|| {
        let handle = pipeline.display_handle();
        std::thread::spawn(move || {
            handle.spin(&mut |output: &VisualizerOutput| {
                for widget in &output.frame.widgets {
                    if let Widget::Text(text) = widget {
                        tracing::debug!("viz {}: {}", output.frame.frame_id, text);
                    }
                }
            })
        })
    });

    for id in 0..frames {
        pipeline.spin(stationary_packet(id))?;
    }
    pipeline.shutdown_when_finished()?;

    if let Some(display) = display {
        let shown = display
            .join()
            .map_err(|_| anyhow::anyhow!("display thread panicked"))?;
        tracing::info!("Displayed {} visualizer frames", shown);
    }
    for (name, stats) in pipeline.module_stats() {
        tracing::info!("{}: {}", name, stats);
    }
    tracing::info!(
        "Done: {} keyframes, final state {:?}",
        keyframes.load(Ordering::Relaxed),
        pipeline.initialization_record().state
    );
    Ok(())
}
