//! Loop-closure stage: place recognition and pose-graph optimization.
//!
//! Outputs are only produced when the detector has something to report;
//! keyframes with no loop candidate are skipped.

use crate::pipeline::module::{EpochTagged, StageAlgorithm, StageError, StageOutput};
use crate::pipeline::stages::backend::BackendOutput;
use crate::types::{FrameId, Pose, Timestamp};
use std::sync::Arc;

/// A detected revisit of a previously mapped place.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopClosure {
    pub query: FrameId,
    pub matched: FrameId,
    /// Pose of the query keyframe relative to the matched one.
    pub relative_pose: Pose,
}

/// Result of one pose-graph optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseGraphUpdate {
    pub frame_id: FrameId,
    pub timestamp: Timestamp,
    pub closure: LoopClosure,
    /// Correction from the odometry world frame to the optimized map frame.
    pub world_correction: Pose,
    pub optimized_trajectory: Vec<(FrameId, Pose)>,
}

/// Loop-closure collaborator.
pub trait LoopClosureDetector: Send {
    fn process(&mut self, input: &BackendOutput) -> Result<StageOutput<PoseGraphUpdate>, StageError>;

    fn reset(&mut self) {}

    fn seed(&mut self, _seed: u64) {}
}

#[derive(Debug, Clone)]
pub struct LcdOutput {
    pub epoch: u64,
    pub update: PoseGraphUpdate,
}

impl EpochTagged for LcdOutput {
    fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub struct LoopClosureStage {
    detector: Box<dyn LoopClosureDetector>,
}

impl LoopClosureStage {
    pub fn new(detector: Box<dyn LoopClosureDetector>) -> Self {
        Self { detector }
    }
}

impl StageAlgorithm for LoopClosureStage {
    type Input = Arc<BackendOutput>;
    type Output = Arc<LcdOutput>;

    fn name(&self) -> &str {
        "loop_closure"
    }

    fn process(&mut self, input: Arc<BackendOutput>) -> Result<StageOutput<Self::Output>, StageError> {
        let output = self.detector.process(&input)?.map(|update| {
            tracing::info!(
                "Loop closure {} -> {}",
                update.closure.query,
                update.closure.matched
            );
            Arc::new(LcdOutput {
                epoch: input.epoch,
                update,
            })
        });
        Ok(output)
    }

    fn reset(&mut self) {
        self.detector.reset();
    }

    fn seed(&mut self, seed: u64) {
        self.detector.seed(seed);
    }
}
