//! Mock construction helpers

use parking_lot::Mutex;
use std::sync::Arc;
#[cfg(feature = "mock-stages")]
use vio_pipeline::pipeline::stages::mock::MockFrontend;
use vio_pipeline::pipeline::stages::{FrontendMeasurements, TrackingStatus, VioFrontend};
use vio_pipeline::pipeline::{StageError, StageOutput};
use vio_pipeline::{BackendOutput, FrameId, LcdOutput, Pipeline, SyncPacket};

/// Shared log filled from a pipeline callback.
pub type OutputLog<T> = Arc<Mutex<Vec<T>>>;

/// Record every keyframe-rate output of `pipeline`.
pub fn record_keyframes(pipeline: &Pipeline) -> OutputLog<BackendOutput> {
    let log: OutputLog<BackendOutput> = Arc::default();
    let sink = log.clone();
    pipeline.register_keyframe_rate_output_callback(move |output| sink.lock().push(output.clone()));
    log
}

/// Record every pose-graph update of `pipeline`.
pub fn record_pgo(pipeline: &Pipeline) -> OutputLog<LcdOutput> {
    let log: OutputLog<LcdOutput> = Arc::default();
    let sink = log.clone();
    pipeline
        .register_lcd_pgo_output_callback(move |output| sink.lock().push(output.clone()))
        .expect("pipeline has a loop-closure module");
    log
}

pub fn frame_ids(outputs: &[BackendOutput]) -> Vec<FrameId> {
    outputs.iter().map(|o| o.frame_id).collect()
}

#[cfg(feature = "mock-stages")]
/// Frontend that behaves like the reference one until `fail_at`, then
/// reports the given error for that frame.
pub struct FailingFrontend {
    inner: MockFrontend,
    fail_at: FrameId,
    error: StageError,
}

#[cfg(feature = "mock-stages")]
impl FailingFrontend {
    pub fn new(inner: MockFrontend, fail_at: FrameId, error: StageError) -> Self {
        Self {
            inner,
            fail_at,
            error,
        }
    }
}

#[cfg(feature = "mock-stages")]
impl VioFrontend for FailingFrontend {
    fn process(&mut self, packet: SyncPacket) -> Result<StageOutput<FrontendMeasurements>, StageError> {
        if packet.frame_id == self.fail_at {
            return Err(self.error.clone());
        }
        self.inner.process(packet)
    }

    fn tracking_status(&self) -> TrackingStatus {
        self.inner.tracking_status()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn seed(&mut self, seed: u64) {
        self.inner.seed(seed);
    }
}

#[cfg(feature = "mock-stages")]
/// Frontend that panics when it reaches `panic_at`.
pub struct PanickingFrontend {
    inner: MockFrontend,
    panic_at: FrameId,
}

#[cfg(feature = "mock-stages")]
impl PanickingFrontend {
    pub fn new(inner: MockFrontend, panic_at: FrameId) -> Self {
        Self { inner, panic_at }
    }
}

#[cfg(feature = "mock-stages")]
impl VioFrontend for PanickingFrontend {
    fn process(&mut self, packet: SyncPacket) -> Result<StageOutput<FrontendMeasurements>, StageError> {
        if packet.frame_id == self.panic_at {
            panic!("tracker state corrupted at {}", packet.frame_id);
        }
        self.inner.process(packet)
    }

    fn tracking_status(&self) -> TrackingStatus {
        self.inner.tracking_status()
    }
}
