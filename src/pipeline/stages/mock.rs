//! Reference stage algorithms for demos and tests.
//!
//! These are not estimators. They produce deterministic, plausible outputs so
//! the orchestration can be exercised end to end without real vision code:
//! the frontend emits a keyframe every N frames with seeded random features,
//! the backend dead-reckons the IMU from its seed, and the rest accumulate
//! keyframe positions.

use crate::config::{BackendType, FrontendParams, PipelineParams, StereoRigParams};
use crate::pipeline::executor::PipelineBuilder;
use crate::pipeline::initialization::InitializationRecord;
use crate::pipeline::module::{StageError, StageOutput};
use crate::pipeline::stages::{
    BackendEstimate, BackendOutput, Feature, FrontendMeasurements, LoopClosure,
    LoopClosureDetector, Mesh, PoseGraphUpdate, TrackingStatus, VioBackend, VioFrontend,
    VioMesher, VioVisualizer, VisualizerFrame, VisualizerInput, Widget,
};
use crate::types::{FrameId, ImuSample, NavState, Pose, SyncPacket};
use nalgebra::{Matrix6, UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

const NANOS: f64 = 1e-9;

pub struct MockFrontend {
    keyframe_interval: u64,
    max_features: usize,
    image_size: (f64, f64),
    rng: StdRng,
    frames: u64,
    pending_imu: Vec<ImuSample>,
    next_feature_id: u64,
    status: TrackingStatus,
    tracking_loss: HashSet<FrameId>,
}

impl MockFrontend {
    pub fn new(params: &FrontendParams, rig: &StereoRigParams) -> Self {
        Self {
            keyframe_interval: params.keyframe_interval.max(1),
            max_features: params.max_features.min(64),
            image_size: (rig.width.max(1) as f64, rig.height.max(1) as f64),
            rng: StdRng::seed_from_u64(0),
            frames: 0,
            pending_imu: Vec::new(),
            next_feature_id: 0,
            status: TrackingStatus::Valid,
            tracking_loss: HashSet::new(),
        }
    }

    /// Report tracking loss on these frames.
    pub fn with_tracking_loss(mut self, frames: impl IntoIterator<Item = FrameId>) -> Self {
        self.tracking_loss.extend(frames);
        self
    }

    fn detect(&mut self) -> Vec<Feature> {
        let (width, height) = self.image_size;
        (0..self.max_features)
            .map(|_| {
                let id = self.next_feature_id;
                self.next_feature_id += 1;
                Feature {
                    id,
                    pixel: Vector2::new(
                        self.rng.gen_range(0.0..width),
                        self.rng.gen_range(0.0..height),
                    ),
                    depth: self.rng.gen_range(0.5..20.0),
                    response: self.rng.gen(),
                }
            })
            .collect()
    }
}

impl VioFrontend for MockFrontend {
    fn process(&mut self, packet: SyncPacket) -> Result<StageOutput<FrontendMeasurements>, StageError> {
        self.pending_imu.extend(packet.imu);

        if self.tracking_loss.contains(&packet.frame_id) {
            self.status = TrackingStatus::Invalid;
            return Ok(StageOutput::Skip("tracking lost"));
        }
        self.status = TrackingStatus::Valid;

        let is_keyframe = self.frames % self.keyframe_interval == 0;
        self.frames += 1;
        if !is_keyframe {
            return Ok(StageOutput::Skip("not a keyframe"));
        }

        let features = self.detect();
        Ok(StageOutput::Payload(FrontendMeasurements {
            frame_id: packet.frame_id,
            timestamp: packet.timestamp,
            tracking: self.status,
            features,
            imu: std::mem::take(&mut self.pending_imu),
        }))
    }

    fn tracking_status(&self) -> TrackingStatus {
        self.status
    }

    fn reset(&mut self) {
        self.frames = 0;
        self.pending_imu.clear();
        self.status = TrackingStatus::Valid;
    }

    fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }
}

/// Dead-reckons bias-corrected IMU samples from the epoch seed.
pub struct MockBackend {
    variant: BackendType,
    gravity: Vector3<f64>,
    state: Option<NavState>,
    keyframes: u64,
}

impl MockBackend {
    pub fn new(gravity: Vector3<f64>) -> Self {
        Self {
            variant: BackendType::Stereo,
            gravity,
            state: None,
            keyframes: 0,
        }
    }

    pub fn with_variant(mut self, variant: BackendType) -> Self {
        self.variant = variant;
        self
    }

    fn integrate(state: &mut NavState, sample: &ImuSample, gravity: &Vector3<f64>) {
        let dt = (sample.timestamp - state.timestamp) as f64 * NANOS;
        let acc = state.rotation() * (sample.acc - state.bias.accelerometer) + gravity;
        let position = state.position() + state.velocity * dt + acc * (0.5 * dt * dt);
        let rotation = state.rotation()
            * UnitQuaternion::from_scaled_axis((sample.gyro - state.bias.gyroscope) * dt);
        state.velocity += acc * dt;
        state.pose = NavState::pose_from(position, rotation);
        state.timestamp = sample.timestamp;
    }
}

impl VioBackend for MockBackend {
    fn variant(&self) -> BackendType {
        self.variant
    }

    fn initialize(&mut self, seed: &NavState) -> Result<(), StageError> {
        self.state = Some(*seed);
        self.keyframes = 0;
        Ok(())
    }

    fn process(
        &mut self,
        measurements: &FrontendMeasurements,
        _record: &InitializationRecord,
    ) -> Result<StageOutput<BackendEstimate>, StageError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| StageError::fatal("keyframe before initialization"))?;

        for sample in &measurements.imu {
            if sample.timestamp > state.timestamp {
                Self::integrate(state, sample, &self.gravity);
            }
        }
        state.timestamp = state.timestamp.max(measurements.timestamp);
        self.keyframes += 1;

        Ok(StageOutput::Payload(BackendEstimate {
            state: *state,
            covariance: Matrix6::identity() * (1e-4 * self.keyframes as f64),
            landmark_count: measurements.features.len(),
        }))
    }

    fn reset(&mut self) {
        self.state = None;
        self.keyframes = 0;
    }
}

/// Strip mesh over consecutive keyframe positions.
#[derive(Default)]
pub struct MockMesher {
    vertices: Vec<Vector3<f64>>,
}

impl VioMesher for MockMesher {
    fn process(&mut self, input: &BackendOutput) -> Result<StageOutput<Mesh>, StageError> {
        self.vertices.push(input.state().position());
        let triangles = (0..self.vertices.len().saturating_sub(2))
            .map(|i| [i, i + 1, i + 2])
            .collect();
        Ok(StageOutput::Payload(Mesh {
            vertices: self.vertices.clone(),
            triangles,
        }))
    }

    fn reset(&mut self) {
        self.vertices.clear();
    }
}

/// Reports a loop when a keyframe comes back within `radius` of one at
/// least `min_separation` keyframes older.
pub struct MockLoopClosure {
    radius: f64,
    min_separation: usize,
    history: Vec<(FrameId, Pose)>,
}

impl MockLoopClosure {
    pub fn new(radius: f64, min_separation: usize) -> Self {
        Self {
            radius,
            min_separation,
            history: Vec::new(),
        }
    }
}

impl Default for MockLoopClosure {
    fn default() -> Self {
        Self::new(0.5, 3)
    }
}

impl LoopClosureDetector for MockLoopClosure {
    fn process(&mut self, input: &BackendOutput) -> Result<StageOutput<PoseGraphUpdate>, StageError> {
        let pose = input.state().pose;
        let candidates = (self.history.len() + 1)
            .saturating_sub(self.min_separation)
            .min(self.history.len());
        let matched = self.history[..candidates]
            .iter()
            .find(|(_, old)| (old.translation.vector - pose.translation.vector).norm() < self.radius)
            .cloned();
        self.history.push((input.frame_id, pose));

        let Some((matched, matched_pose)) = matched else {
            return Ok(StageOutput::Skip("no loop candidate"));
        };
        Ok(StageOutput::Payload(PoseGraphUpdate {
            frame_id: input.frame_id,
            timestamp: input.state().timestamp,
            closure: LoopClosure {
                query: input.frame_id,
                matched,
                relative_pose: matched_pose.inverse() * pose,
            },
            world_correction: Pose::identity(),
            optimized_trajectory: self.history.clone(),
        }))
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}

#[derive(Default)]
pub struct MockVisualizer {
    trajectory: Vec<Vector3<f64>>,
}

impl VioVisualizer for MockVisualizer {
    fn process(&mut self, input: &VisualizerInput) -> Result<StageOutput<VisualizerFrame>, StageError> {
        let state = input.backend.state();
        self.trajectory.push(state.position());

        let mut widgets = vec![
            Widget::Trajectory(self.trajectory.clone()),
            Widget::Frustum(state.pose),
        ];
        if let Some(mesh) = &input.mesh {
            widgets.push(Widget::Mesh {
                vertices: mesh.vertices.len(),
                triangles: mesh.triangles.len(),
            });
        }
        widgets.push(Widget::Text(format!(
            "{} landmarks={}",
            input.backend.frame_id, input.backend.estimate.landmark_count
        )));

        Ok(StageOutput::Payload(VisualizerFrame {
            frame_id: input.backend.frame_id,
            widgets,
        }))
    }

    fn reset(&mut self) {
        self.trajectory.clear();
    }
}

impl PipelineBuilder {
    /// Install the reference algorithms for every stage the parameters enable.
    pub fn with_mock_stages(self) -> Self {
        let params: PipelineParams = self.params().clone();
        let mut builder = self
            .frontend(MockFrontend::new(&params.frontend, &params.stereo_rig))
            .backend(MockBackend::new(params.gravity()).with_variant(params.backend.backend_type));
        if params.use_mesher {
            builder = builder.mesher(MockMesher::default());
        }
        if params.use_loop_closure {
            builder = builder.loop_closure(MockLoopClosure::default());
        }
        if params.use_visualizer {
            builder = builder.visualizer(MockVisualizer::default());
        }
        builder
    }
}
