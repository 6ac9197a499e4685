//! # vio-pipeline: Visual-Inertial Odometry Orchestration
//!
//! Runs a stereo visual-inertial odometry system as a set of cooperating
//! stages: frontend feature tracking, backend state estimation, and the
//! optional mesher, loop-closure and visualizer modules. The crate owns the
//! plumbing (queues, workers, initialization, epochs, shutdown); the actual
//! algorithms are supplied as trait objects.
//!
//! ## Architecture
//!
//! - **Initialization**: packets are buffered until a seed state is known,
//!   from ground truth, from a static IMU window, or from online alignment
//! - **Stages**: each algorithm is wrapped in a stage module that pulls from
//!   a bounded queue and pushes to its registered sinks
//! - **Run modes**: one thread per module (parallel) or everything on the
//!   caller's thread (sequential, deterministic)
//! - **Epochs**: re-initialization advances an epoch counter and every item
//!   from an older epoch is discarded
//!
//! ## Configuration
//!
//! A [`PipelineParams`] bundle is loaded from TOML or JSON; see [`config`].
//!
//! ## Example
//!
//! ```ignore
//! use vio_pipeline::{PipelineBuilder, PipelineParams};
//!
//! fn main() -> anyhow::Result<()> {
//!     let params = PipelineParams::load("params.toml")?;
//!     let mut pipeline = PipelineBuilder::new(params)
//!         .with_mock_stages()
//!         .build()?;
//!
//!     pipeline.register_keyframe_rate_output_callback(|out| {
//!         println!("{}: {}", out.frame_id, out.state().position());
//!     });
//!
//!     for packet in dataset() {
//!         pipeline.spin(packet)?;
//!     }
//!     pipeline.shutdown_when_finished()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ground_truth;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use config::{PipelineParams, RunMode};
pub use error::{Result, ResultExt, VioError};
pub use ground_truth::{GroundTruthSource, GroundTruthTable};
pub use pipeline::stages::{BackendOutput, LcdOutput, VisualizerOutput};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineError, PipelineResult};
pub use types::{FrameId, ImuBias, ImuSample, NavState, Pose, StereoImages, SyncPacket, Timestamp};
