//! Frontend stage: feature tracking on synchronized packets.
//!
//! The tracking algorithm itself is a [`VioFrontend`] collaborator. This
//! adapter records tracking quality for the re-initialization check and, when
//! enabled, runs feature selection inline before the measurements leave the
//! stage. Keyframe `i` is selected against the backend covariance of
//! keyframe `i - 1` in the same epoch; the first keyframe of an epoch keeps
//! every feature.

use crate::pipeline::module::{EpochTagged, StageAlgorithm, StageError, StageOutput};
use crate::pipeline::signals::PipelineSignals;
use crate::pipeline::stages::SharedBackendState;
use crate::types::{FrameId, ImuSample, SyncPacket, Timestamp};
use nalgebra::{Matrix6, Vector2};
use std::sync::Arc;

/// Quality of the last tracked frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    Valid,
    FewMatches,
    Invalid,
}

impl TrackingStatus {
    pub fn is_valid(self) -> bool {
        self == TrackingStatus::Valid
    }
}

/// A tracked feature in the left image.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: u64,
    pub pixel: Vector2<f64>,
    /// Stereo depth in meters.
    pub depth: f64,
    /// Detector response, higher is better.
    pub response: f64,
}

/// Measurements emitted for a keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendMeasurements {
    pub frame_id: FrameId,
    pub timestamp: Timestamp,
    pub tracking: TrackingStatus,
    pub features: Vec<Feature>,
    /// IMU samples since the previous keyframe.
    pub imu: Vec<ImuSample>,
}

/// Feature tracking collaborator.
pub trait VioFrontend: Send {
    /// Track one packet. Non-keyframes return [`StageOutput::Skip`].
    fn process(&mut self, packet: SyncPacket) -> Result<StageOutput<FrontendMeasurements>, StageError>;

    /// Status of the most recently processed packet.
    fn tracking_status(&self) -> TrackingStatus;

    fn reset(&mut self) {}

    fn seed(&mut self, _seed: u64) {}
}

/// Scores candidate features against the current state covariance.
pub trait FeatureSelector: Send {
    fn select(&mut self, features: Vec<Feature>, covariance: &Matrix6<f64>, budget: usize) -> Vec<Feature>;
}

/// Ranks features by detector response discounted by how much the current
/// translational uncertainty, scaled by depth, blurs them.
#[derive(Debug, Clone, Default)]
pub struct CovarianceFeatureSelector;

impl CovarianceFeatureSelector {
    fn score(feature: &Feature, translational_variance: f64) -> f64 {
        feature.response / (1.0 + translational_variance * feature.depth * feature.depth)
    }
}

impl FeatureSelector for CovarianceFeatureSelector {
    fn select(&mut self, mut features: Vec<Feature>, covariance: &Matrix6<f64>, budget: usize) -> Vec<Feature> {
        if features.len() <= budget {
            return features;
        }
        // Pose covariance is ordered [rotation, translation].
        let variance = covariance.fixed_view::<3, 3>(3, 3).trace();
        features.sort_by(|a, b| {
            Self::score(b, variance)
                .total_cmp(&Self::score(a, variance))
                .then(a.id.cmp(&b.id))
        });
        features.truncate(budget);
        features
    }
}

/// A packet tagged with the epoch it was accepted in.
#[derive(Debug, Clone)]
pub struct FrontendInput {
    pub epoch: u64,
    pub packet: SyncPacket,
}

impl EpochTagged for FrontendInput {
    fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Debug, Clone)]
pub struct FrontendOutput {
    pub epoch: u64,
    /// Position of this keyframe within its epoch, from 0.
    pub keyframe_index: u64,
    pub measurements: FrontendMeasurements,
}

impl EpochTagged for FrontendOutput {
    fn epoch(&self) -> u64 {
        self.epoch
    }
}

struct Selection {
    selector: Box<dyn FeatureSelector>,
    budget: usize,
    backend_state: SharedBackendState,
    /// Wait for the backend thread to catch up (parallel mode). In
    /// sequential mode the previous keyframe is always handled already.
    wait_for_backend: bool,
}

impl Selection {
    fn covariance(&self, epoch: u64, keyframe_index: u64, signals: &PipelineSignals) -> Option<Matrix6<f64>> {
        let previous = keyframe_index.checked_sub(1)?;
        if self.wait_for_backend {
            self.backend_state.wait_covariance(epoch, previous, signals)
        } else {
            self.backend_state.covariance(epoch, previous)
        }
    }
}

pub struct FrontendStage {
    frontend: Box<dyn VioFrontend>,
    selection: Option<Selection>,
    signals: Arc<PipelineSignals>,
    /// Keyframes emitted in the current epoch.
    keyframes: u64,
}

impl FrontendStage {
    pub fn new(frontend: Box<dyn VioFrontend>, signals: Arc<PipelineSignals>) -> Self {
        Self {
            frontend,
            selection: None,
            signals,
            keyframes: 0,
        }
    }

    pub fn with_feature_selection(
        mut self,
        selector: Box<dyn FeatureSelector>,
        budget: usize,
        backend_state: SharedBackendState,
        wait_for_backend: bool,
    ) -> Self {
        self.selection = Some(Selection {
            selector,
            budget,
            backend_state,
            wait_for_backend,
        });
        self
    }
}

impl StageAlgorithm for FrontendStage {
    type Input = FrontendInput;
    type Output = Arc<FrontendOutput>;

    fn name(&self) -> &str {
        "frontend"
    }

    fn process(&mut self, input: FrontendInput) -> Result<StageOutput<Self::Output>, StageError> {
        let epoch = input.epoch;
        let result = self.frontend.process(input.packet);
        let valid = result.is_ok() && self.frontend.tracking_status().is_valid();
        self.signals.record_tracking(valid);

        let mut measurements = match result? {
            StageOutput::Payload(m) => m,
            StageOutput::Skip(reason) => return Ok(StageOutput::Skip(reason)),
        };

        let keyframe_index = self.keyframes;
        self.keyframes += 1;

        if let Some(selection) = self.selection.as_mut() {
            if let Some(covariance) = selection.covariance(epoch, keyframe_index, &self.signals) {
                let before = measurements.features.len();
                measurements.features = selection.selector.select(
                    measurements.features,
                    &covariance,
                    selection.budget,
                );
                tracing::trace!(
                    "Selected {}/{} features for {}",
                    measurements.features.len(),
                    before,
                    measurements.frame_id
                );
            }
        }

        Ok(StageOutput::Payload(Arc::new(FrontendOutput {
            epoch,
            keyframe_index,
            measurements,
        })))
    }

    fn reset(&mut self) {
        self.keyframes = 0;
        self.frontend.reset();
    }

    fn seed(&mut self, seed: u64) {
        self.frontend.seed(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoImages;
    use mockall::mock;
    use mockall::predicate::always;

    mock! {
        pub Tracker {}
        impl VioFrontend for Tracker {
            fn process(&mut self, packet: SyncPacket) -> Result<StageOutput<FrontendMeasurements>, StageError>;
            fn tracking_status(&self) -> TrackingStatus;
            fn reset(&mut self);
            fn seed(&mut self, seed: u64);
        }
    }

    fn feature(id: u64, depth: f64, response: f64) -> Feature {
        Feature {
            id,
            pixel: Vector2::new(10.0, 10.0),
            depth,
            response,
        }
    }

    fn input(id: u64) -> FrontendInput {
        FrontendInput {
            epoch: 0,
            packet: SyncPacket::new(FrameId(id), id as i64, StereoImages::default(), Vec::new()),
        }
    }

    fn keyframe(features: Vec<Feature>) -> FrontendMeasurements {
        FrontendMeasurements {
            frame_id: FrameId(0),
            timestamp: 0,
            tracking: TrackingStatus::Valid,
            features,
            imu: Vec::new(),
        }
    }

    #[test]
    fn test_selector_prefers_near_features_under_uncertainty() {
        let features = vec![
            feature(1, 20.0, 1.0),
            feature(2, 1.0, 0.8),
            feature(3, 5.0, 0.9),
        ];
        let covariance = Matrix6::identity() * 0.1;
        let selected = CovarianceFeatureSelector.select(features, &covariance, 2);
        let ids: Vec<_> = selected.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_selector_keeps_all_within_budget() {
        let features = vec![feature(1, 1.0, 1.0)];
        let selected = CovarianceFeatureSelector.select(features, &Matrix6::identity(), 5);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_skip_records_tracking_and_passes_through() {
        let mut tracker = MockTracker::new();
        tracker
            .expect_process()
            .with(always())
            .returning(|_| Ok(StageOutput::Skip("not a keyframe")));
        tracker
            .expect_tracking_status()
            .return_const(TrackingStatus::Invalid);

        let signals = PipelineSignals::new();
        let mut stage = FrontendStage::new(Box::new(tracker), signals.clone());
        let out = stage.process(input(1)).unwrap();
        assert!(out.is_skip());
        assert_eq!(signals.consecutive_tracking_failures(), 1);
    }

    #[test]
    fn test_selection_runs_inline_with_backend_covariance() {
        let mut tracker = MockTracker::new();
        tracker.expect_process().returning(|_| {
            Ok(StageOutput::Payload(keyframe(vec![
                feature(1, 1.0, 0.5),
                feature(2, 1.0, 0.9),
                feature(3, 1.0, 0.7),
            ])))
        });
        tracker
            .expect_tracking_status()
            .return_const(TrackingStatus::Valid);

        let backend_state = SharedBackendState::default();
        let signals = PipelineSignals::new();
        let mut stage = FrontendStage::new(Box::new(tracker), signals.clone()).with_feature_selection(
            Box::new(CovarianceFeatureSelector),
            1,
            backend_state.clone(),
            false,
        );

        // First keyframe of the epoch: nothing is dropped.
        match stage.process(input(1)).unwrap() {
            StageOutput::Payload(out) => {
                assert_eq!(out.keyframe_index, 0);
                assert_eq!(out.measurements.features.len(), 3);
            }
            other => panic!("expected payload, got {:?}", other),
        }

        backend_state.publish(0, 0, Some(Matrix6::identity()));
        match stage.process(input(2)).unwrap() {
            StageOutput::Payload(out) => {
                assert_eq!(out.keyframe_index, 1);
                assert_eq!(out.measurements.features.len(), 1);
                assert_eq!(out.measurements.features[0].id, 2);
            }
            other => panic!("expected payload, got {:?}", other),
        }
        assert_eq!(signals.consecutive_tracking_failures(), 0);
    }

    #[test]
    fn test_selection_ignores_covariance_of_other_keyframes() {
        let mut tracker = MockTracker::new();
        tracker.expect_process().returning(|_| {
            Ok(StageOutput::Payload(keyframe(vec![
                feature(1, 1.0, 0.5),
                feature(2, 1.0, 0.9),
            ])))
        });
        tracker
            .expect_tracking_status()
            .return_const(TrackingStatus::Valid);

        let backend_state = SharedBackendState::default();
        // A covariance from a previous epoch must not leak into this one.
        backend_state.publish(0, 4, Some(Matrix6::identity()));
        let signals = PipelineSignals::new();
        signals.advance_epoch();
        let mut stage = FrontendStage::new(Box::new(tracker), signals).with_feature_selection(
            Box::new(CovarianceFeatureSelector),
            1,
            backend_state.clone(),
            false,
        );

        let epoch_one = |id: u64| FrontendInput {
            epoch: 1,
            ..input(id)
        };
        for id in 0..2 {
            match stage.process(epoch_one(id)).unwrap() {
                StageOutput::Payload(out) => assert_eq!(out.measurements.features.len(), 2),
                other => panic!("expected payload, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_failure_counts_as_tracking_loss() {
        let mut tracker = MockTracker::new();
        tracker
            .expect_process()
            .returning(|_| Err(StageError::transient("no features")));
        tracker
            .expect_tracking_status()
            .return_const(TrackingStatus::Valid);

        let signals = PipelineSignals::new();
        let mut stage = FrontendStage::new(Box::new(tracker), signals.clone());
        assert!(stage.process(input(1)).is_err());
        assert_eq!(signals.consecutive_tracking_failures(), 1);
    }
}
