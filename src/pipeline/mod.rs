//! Multi-stage visual-inertial odometry pipeline.
//!
//! Stages communicate through bounded [`ThreadsafeQueue`]s and run either on
//! dedicated worker threads (parallel mode) or on the caller's thread
//! (sequential mode, for deterministic replay and debugging).
//!
//! # Architecture
//!
//! ```text
//!              ┌───────────────┐
//! SyncPacket ─►│  Initializer  │── seed ──► InitializationCell
//!              └──────┬────────┘                   │
//!                     ▼                            ▼
//!               [frontend] ──► [backend] ──┬──► [mesher] ──► [visualizer] ──► display
//!                                          ├──► [loop closure] ──► PGO callbacks
//!                                          └──► keyframe-rate callbacks
//! ```
//!
//! # Design
//!
//! - **Epochs**: every item carries the epoch it was produced in; a
//!   re-initialization advances the epoch and stale items are dropped
//!   before processing and again before delivery.
//! - **In-flight accounting**: each queued item is counted until a module
//!   has finished with it, so "drained" has a precise meaning.
//! - **Pluggable algorithms**: the actual tracking, estimation, meshing,
//!   loop closure and visualization are trait objects injected through
//!   [`PipelineBuilder`].

pub mod error;
pub mod executor;
pub mod initialization;
pub mod module;
pub mod queue;
pub mod signals;
pub mod sink;
pub mod stages;
pub mod worker;

pub use error::{PipelineError, PipelineResult};
pub use executor::{Lifecycle, Pipeline, PipelineBuilder};
pub use initialization::{
    ImuGravityAligner, ImuOnlyEstimator, InitializationError, InitializationRecord,
    InitializationState, OnlineAligner, SeedMode,
};
pub use module::{
    EpochTagged, FailurePolicy, ModuleStatsSnapshot, SpinOutcome, StageAlgorithm, StageError,
    StageModule, StageOutput,
};
pub use queue::{QueueClosed, StopHandle, ThreadsafeQueue, TryPopError};
pub use signals::{FatalReport, PipelineSignals};
pub use sink::SinkList;
pub use worker::{Worker, WorkerSlot};
