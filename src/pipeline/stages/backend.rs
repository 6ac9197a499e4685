//! Backend stage: state estimation at keyframe rate.
//!
//! The estimator is a [`VioBackend`] collaborator. Before it accepts any
//! keyframe of an epoch the adapter seeds it from the published
//! [`InitializationRecord`]; keyframes arriving without a matching record are
//! skipped. Every keyframe handled, estimated or not, is reported to
//! [`SharedBackendState`] so the frontend's feature selection can proceed.

use crate::config::BackendType;
use crate::pipeline::initialization::{InitializationCell, InitializationRecord};
use crate::pipeline::module::{EpochTagged, StageAlgorithm, StageError, StageOutput};
use crate::pipeline::stages::frontend::{FrontendMeasurements, FrontendOutput};
use crate::pipeline::stages::SharedBackendState;
use crate::types::{FrameId, NavState};
use nalgebra::Matrix6;
use std::sync::Arc;

/// Estimate produced for one keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendEstimate {
    pub state: NavState,
    /// Pose covariance, ordered [rotation, translation].
    pub covariance: Matrix6<f64>,
    pub landmark_count: usize,
}

/// State estimation collaborator.
pub trait VioBackend: Send {
    fn variant(&self) -> BackendType;

    /// Seed the estimator for a new epoch.
    fn initialize(&mut self, seed: &NavState) -> Result<(), StageError>;

    fn process(
        &mut self,
        measurements: &FrontendMeasurements,
        record: &InitializationRecord,
    ) -> Result<StageOutput<BackendEstimate>, StageError>;

    fn reset(&mut self) {}

    fn seed(&mut self, _seed: u64) {}
}

/// Keyframe-rate output delivered to downstream stages and callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub epoch: u64,
    pub frame_id: FrameId,
    pub estimate: BackendEstimate,
}

impl BackendOutput {
    pub fn state(&self) -> &NavState {
        &self.estimate.state
    }
}

impl EpochTagged for BackendOutput {
    fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub struct BackendStage {
    backend: Box<dyn VioBackend>,
    record: Arc<InitializationCell>,
    shared: SharedBackendState,
    seeded_epoch: Option<u64>,
}

impl BackendStage {
    pub fn new(
        backend: Box<dyn VioBackend>,
        record: Arc<InitializationCell>,
        shared: SharedBackendState,
    ) -> Self {
        Self {
            backend,
            record,
            shared,
            seeded_epoch: None,
        }
    }
}

impl StageAlgorithm for BackendStage {
    type Input = Arc<FrontendOutput>;
    type Output = Arc<BackendOutput>;

    fn name(&self) -> &str {
        "backend"
    }

    fn process(&mut self, input: Arc<FrontendOutput>) -> Result<StageOutput<Self::Output>, StageError> {
        let result = self.estimate(&input);
        let covariance = match &result {
            Ok(StageOutput::Payload(output)) => Some(output.estimate.covariance),
            _ => None,
        };
        self.shared
            .publish(input.epoch, input.keyframe_index, covariance);
        result
    }

    fn reset(&mut self) {
        self.seeded_epoch = None;
        self.backend.reset();
    }

    fn seed(&mut self, seed: u64) {
        self.backend.seed(seed);
    }
}

impl BackendStage {
    fn estimate(&mut self, input: &FrontendOutput) -> Result<StageOutput<Arc<BackendOutput>>, StageError> {
        let record = self.record.snapshot();
        if record.epoch != input.epoch {
            return Ok(StageOutput::Skip("keyframe from another epoch"));
        }
        let Some(seed) = record.seed.as_ref() else {
            return Ok(StageOutput::Skip("estimator not initialized"));
        };

        if self.seeded_epoch != Some(record.epoch) {
            self.backend.initialize(seed)?;
            self.seeded_epoch = Some(record.epoch);
            tracing::info!(
                "Backend seeded for epoch {} via {:?}",
                record.epoch,
                record.mode
            );
        }

        let output = self
            .backend
            .process(&input.measurements, &record)?
            .map(|estimate| {
                Arc::new(BackendOutput {
                    epoch: input.epoch,
                    frame_id: input.measurements.frame_id,
                    estimate,
                })
            });
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::initialization::SeedMode;
    use crate::pipeline::stages::frontend::TrackingStatus;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        pub Estimator {}
        impl VioBackend for Estimator {
            fn variant(&self) -> BackendType;
            fn initialize(&mut self, seed: &NavState) -> Result<(), StageError>;
            fn process(
                &mut self,
                measurements: &FrontendMeasurements,
                record: &InitializationRecord,
            ) -> Result<StageOutput<BackendEstimate>, StageError>;
            fn reset(&mut self);
            fn seed(&mut self, seed: u64);
        }
    }

    fn keyframe(epoch: u64, id: u64) -> Arc<FrontendOutput> {
        Arc::new(FrontendOutput {
            epoch,
            keyframe_index: id,
            measurements: FrontendMeasurements {
                frame_id: FrameId(id),
                timestamp: id as i64,
                tracking: TrackingStatus::Valid,
                features: Vec::new(),
                imu: Vec::new(),
            },
        })
    }

    fn estimate(state: NavState) -> BackendEstimate {
        BackendEstimate {
            state,
            covariance: Matrix6::identity(),
            landmark_count: 0,
        }
    }

    #[test]
    fn test_skips_until_record_published() {
        let mut backend = MockEstimator::new();
        backend.expect_initialize().never();
        backend.expect_process().never();
        let cell = InitializationCell::new(InitializationRecord::uninitialized(0));
        let mut stage = BackendStage::new(Box::new(backend), cell, SharedBackendState::default());
        assert!(stage.process(keyframe(0, 0)).unwrap().is_skip());
    }

    #[test]
    fn test_seeds_once_per_epoch() {
        let seed = NavState::identity(5);
        let mut backend = MockEstimator::new();
        backend
            .expect_initialize()
            .with(eq(seed))
            .times(1)
            .returning(|_| Ok(()));
        backend
            .expect_process()
            .times(2)
            .returning(|m, r| {
                let state = r.seed.unwrap().at(m.timestamp);
                Ok(StageOutput::Payload(estimate(state)))
            });

        let cell = InitializationCell::new(InitializationRecord::seeded(
            0,
            SeedMode::GroundTruth,
            FrameId(0),
            seed,
        ));
        let shared = SharedBackendState::default();
        let mut stage = BackendStage::new(Box::new(backend), cell, shared.clone());

        for id in 0..2 {
            match stage.process(keyframe(0, id)).unwrap() {
                StageOutput::Payload(out) => {
                    assert_eq!(out.frame_id, FrameId(id));
                    assert_eq!(out.state().pose, seed.pose);
                }
                other => panic!("expected payload, got {:?}", other),
            }
        }
        assert_eq!(shared.covariance(0, 1), Some(Matrix6::identity()));
    }

    #[test]
    fn test_skipped_keyframe_still_reported() {
        let mut backend = MockEstimator::new();
        backend.expect_process().never();
        let cell = InitializationCell::new(InitializationRecord::uninitialized(0));
        let shared = SharedBackendState::default();
        let mut stage = BackendStage::new(Box::new(backend), cell, shared.clone());

        assert!(stage.process(keyframe(0, 3)).unwrap().is_skip());
        let signals = crate::pipeline::signals::PipelineSignals::new();
        assert_eq!(shared.wait_covariance(0, 3, &signals), None);
    }

    #[test]
    fn test_initialize_failure_propagates() {
        let mut backend = MockEstimator::new();
        backend
            .expect_initialize()
            .returning(|_| Err(StageError::fatal("singular seed")));
        let cell = InitializationCell::new(InitializationRecord::seeded(
            0,
            SeedMode::ImuOnly,
            FrameId(0),
            NavState::identity(0),
        ));
        let mut stage = BackendStage::new(Box::new(backend), cell, SharedBackendState::default());
        assert_eq!(
            stage.process(keyframe(0, 0)).unwrap_err(),
            StageError::fatal("singular seed")
        );
    }
}
