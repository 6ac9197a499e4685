//! Stage adapters.
//!
//! Each stage wraps an external collaborator trait (the actual tracking,
//! estimation, meshing, loop-closure or visualization algorithm) and adapts
//! it to [`StageAlgorithm`](crate::pipeline::module::StageAlgorithm):
//!
//! ```text
//! SyncPacket ──► [frontend] ──► [backend] ──┬──► [mesher] ──► [visualizer] ──► display
//!                                            ├──► [loop closure] ──► PGO callbacks
//!                                            └──► keyframe-rate callbacks
//! ```

pub mod backend;
pub mod frontend;
pub mod loop_closure;
pub mod mesher;
#[cfg(feature = "mock-stages")]
pub mod mock;
pub mod visualizer;

pub use backend::{BackendEstimate, BackendOutput, BackendStage, VioBackend};
pub use frontend::{
    CovarianceFeatureSelector, Feature, FeatureSelector, FrontendInput, FrontendMeasurements,
    FrontendOutput, FrontendStage, TrackingStatus, VioFrontend,
};
pub use loop_closure::{LcdOutput, LoopClosure, LoopClosureDetector, LoopClosureStage, PoseGraphUpdate};
pub use mesher::{Mesh, MesherOutput, MesherStage, VioMesher};
pub use visualizer::{
    Display, DisplayHandle, VioVisualizer, VisualizerFrame, VisualizerInput, VisualizerOutput,
    VisualizerStage, Widget,
};

use crate::pipeline::signals::PipelineSignals;
use nalgebra::Matrix6;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct PublishedEstimate {
    epoch: u64,
    keyframe_index: u64,
    covariance: Option<Matrix6<f64>>,
}

/// Backend covariance per keyframe, written by the backend stage and read by
/// the frontend's inline feature selection.
///
/// Keyframe `i` of an epoch is selected against the covariance the backend
/// produced for keyframe `i - 1` of the same epoch, whichever thread runs
/// which stage.
#[derive(Clone, Default)]
pub struct SharedBackendState {
    latest: Arc<Mutex<Option<PublishedEstimate>>>,
    updated: Arc<Condvar>,
}

impl SharedBackendState {
    /// Record that the backend has handled `keyframe_index`. `None` when it
    /// produced no estimate for it.
    pub fn publish(&self, epoch: u64, keyframe_index: u64, covariance: Option<Matrix6<f64>>) {
        *self.latest.lock() = Some(PublishedEstimate {
            epoch,
            keyframe_index,
            covariance,
        });
        self.updated.notify_all();
    }

    /// Covariance for `keyframe_index` of `epoch`, if the backend has
    /// already handled it.
    pub fn covariance(&self, epoch: u64, keyframe_index: u64) -> Option<Matrix6<f64>> {
        match *self.latest.lock() {
            Some(p) if p.epoch == epoch && p.keyframe_index >= keyframe_index => p.covariance,
            _ => None,
        }
    }

    /// Block until the backend has handled `keyframe_index` of `epoch`.
    ///
    /// Gives up with `None` once the epoch is superseded or the pipeline
    /// stops running.
    pub fn wait_covariance(
        &self,
        epoch: u64,
        keyframe_index: u64,
        signals: &PipelineSignals,
    ) -> Option<Matrix6<f64>> {
        let mut latest = self.latest.lock();
        loop {
            if let Some(p) = *latest {
                if p.epoch == epoch && p.keyframe_index >= keyframe_index {
                    return p.covariance;
                }
            }
            if !signals.is_running() || signals.is_stale(epoch) {
                return None;
            }
            self.updated.wait_for(&mut latest, Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_covariance_keyed_by_epoch_and_keyframe() {
        let state = SharedBackendState::default();
        assert_eq!(state.covariance(0, 0), None);

        state.publish(0, 0, Some(Matrix6::identity()));
        assert_eq!(state.covariance(0, 0), Some(Matrix6::identity()));
        assert_eq!(state.covariance(0, 1), None);
        assert_eq!(state.covariance(1, 0), None);

        state.publish(0, 1, None);
        assert_eq!(state.covariance(0, 1), None);
    }

    #[test]
    fn test_wait_covariance_blocks_until_published() {
        let state = SharedBackendState::default();
        let signals = PipelineSignals::new();
        let publisher = {
            let state = state.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                state.publish(0, 0, None);
                thread::sleep(Duration::from_millis(30));
                state.publish(0, 1, Some(Matrix6::identity() * 2.0));
            })
        };
        assert_eq!(
            state.wait_covariance(0, 1, &signals),
            Some(Matrix6::identity() * 2.0)
        );
        publisher.join().unwrap();
    }

    #[test]
    fn test_wait_covariance_gives_up_on_new_epoch() {
        let state = SharedBackendState::default();
        let signals = PipelineSignals::new();
        let advancer = {
            let signals = signals.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                signals.advance_epoch();
            })
        };
        assert_eq!(state.wait_covariance(0, 3, &signals), None);
        advancer.join().unwrap();
    }
}
