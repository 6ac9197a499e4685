//! Initialization state machine.
//!
//! Before the first state estimate exists, incoming packets are handed to the
//! [`Initializer`] instead of the frontend. It buffers them until it can seed
//! the estimator by one of three methods:
//!
//! - **Ground truth**: a pose is available for the packet timestamp.
//! - **IMU only**: a fixed number of frames is averaged under a static,
//!   upright start assumption.
//! - **Online aligned**: a window of frames is checked for a consistent
//!   gravity direction before the attitude is released.
//!
//! Under [`InitializationMode::Auto`] the methods are tried in that order.
//! The result is published as an [`InitializationRecord`] that stages read
//! without blocking.

use crate::config::{InitializationMode, InitializationParams};
use crate::ground_truth::GroundTruthSource;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::signals::PipelineSignals;
use crate::types::{FrameId, ImuBias, NavState, SyncPacket};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Where the initialization state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationState {
    Uninitialized,
    GroundTruth,
    ImuOnly,
    OnlineAligned,
    /// Seeded and past the first packet of the epoch.
    Steady,
}

/// Method that produced the seed of the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    GroundTruth,
    ImuOnly,
    OnlineAligned,
}

impl SeedMode {
    pub fn state(self) -> InitializationState {
        match self {
            SeedMode::GroundTruth => InitializationState::GroundTruth,
            SeedMode::ImuOnly => InitializationState::ImuOnly,
            SeedMode::OnlineAligned => InitializationState::OnlineAligned,
        }
    }
}

/// Why an initialization attempt did not produce a seed yet.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InitializationError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("degenerate alignment: {0}")]
    Degenerate(String),
}

/// Published outcome of initialization for one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct InitializationRecord {
    pub state: InitializationState,
    pub mode: Option<SeedMode>,
    pub epoch: u64,
    pub reference_frame_id: Option<FrameId>,
    pub seed: Option<NavState>,
}

impl InitializationRecord {
    pub fn uninitialized(epoch: u64) -> Self {
        Self {
            state: InitializationState::Uninitialized,
            mode: None,
            epoch,
            reference_frame_id: None,
            seed: None,
        }
    }

    pub fn seeded(epoch: u64, mode: SeedMode, reference_frame_id: FrameId, seed: NavState) -> Self {
        Self {
            state: mode.state(),
            mode: Some(mode),
            epoch,
            reference_frame_id: Some(reference_frame_id),
            seed: Some(seed),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state != InitializationState::Uninitialized
    }

    /// Same record, marked steady.
    pub fn steady(&self) -> Self {
        Self {
            state: InitializationState::Steady,
            ..self.clone()
        }
    }
}

/// Snapshot slot for the current [`InitializationRecord`].
///
/// Only the orchestrator writes, and only between epochs; readers clone the
/// `Arc` and never hold the lock across processing.
pub struct InitializationCell {
    current: RwLock<Arc<InitializationRecord>>,
}

impl InitializationCell {
    pub fn new(record: InitializationRecord) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(record)),
        })
    }

    pub fn snapshot(&self) -> Arc<InitializationRecord> {
        self.current.read().clone()
    }

    pub fn publish(&self, record: InitializationRecord) {
        tracing::debug!(
            "Initialization record: {:?} (epoch {})",
            record.state,
            record.epoch
        );
        *self.current.write() = Arc::new(record);
    }
}

/// Gravity alignment over a window of packets.
pub trait OnlineAligner: Send {
    fn align(
        &mut self,
        window: &[SyncPacket],
        gravity: &Vector3<f64>,
    ) -> Result<NavState, InitializationError>;
}

/// Aligns the mean specific force with gravity, rejecting windows that do
/// not look static.
#[derive(Debug, Clone)]
pub struct ImuGravityAligner {
    /// Allowed |‖mean acc‖ - ‖g‖| in m/s².
    pub magnitude_tolerance: f64,
    /// Allowed RMS deviation of accelerometer samples from their mean.
    pub max_spread: f64,
}

impl ImuGravityAligner {
    pub fn new(magnitude_tolerance: f64, max_spread: f64) -> Self {
        Self {
            magnitude_tolerance,
            max_spread,
        }
    }
}

impl Default for ImuGravityAligner {
    fn default() -> Self {
        Self::new(0.3, 0.5)
    }
}

impl OnlineAligner for ImuGravityAligner {
    fn align(
        &mut self,
        window: &[SyncPacket],
        gravity: &Vector3<f64>,
    ) -> Result<NavState, InitializationError> {
        let first = window
            .first()
            .ok_or_else(|| InitializationError::InsufficientData("empty window".into()))?;
        let means = ImuMeans::of(window)?;

        let magnitude_error = (means.acc.norm() - gravity.norm()).abs();
        if magnitude_error > self.magnitude_tolerance {
            return Err(InitializationError::Degenerate(format!(
                "specific force magnitude off by {:.3} m/s²",
                magnitude_error
            )));
        }
        if means.acc_spread > self.max_spread {
            return Err(InitializationError::Degenerate(format!(
                "accelerometer spread {:.3} indicates motion",
                means.acc_spread
            )));
        }

        let attitude = align_with_gravity(&means.acc, gravity)?;
        let bias = ImuBias::new(Vector3::zeros(), means.gyro);
        Ok(NavState::new(
            first.timestamp,
            NavState::pose_from(Vector3::zeros(), attitude),
            Vector3::zeros(),
            bias,
        ))
    }
}

/// Averages over every IMU sample in a set of packets.
struct ImuMeans {
    acc: Vector3<f64>,
    gyro: Vector3<f64>,
    acc_spread: f64,
}

impl ImuMeans {
    fn of(packets: &[SyncPacket]) -> Result<Self, InitializationError> {
        let samples: Vec<_> = packets.iter().flat_map(|p| p.imu.iter()).collect();
        if samples.is_empty() {
            return Err(InitializationError::InsufficientData(
                "no IMU samples in buffered packets".into(),
            ));
        }
        let n = samples.len() as f64;
        let acc = samples.iter().map(|s| s.acc).sum::<Vector3<f64>>() / n;
        let gyro = samples.iter().map(|s| s.gyro).sum::<Vector3<f64>>() / n;
        let acc_spread = (samples
            .iter()
            .map(|s| (s.acc - acc).norm_squared())
            .sum::<f64>()
            / n)
            .sqrt();
        Ok(Self {
            acc,
            gyro,
            acc_spread,
        })
    }
}

/// Body-to-world rotation taking the measured specific force onto `-gravity`.
fn align_with_gravity(
    specific_force: &Vector3<f64>,
    gravity: &Vector3<f64>,
) -> Result<UnitQuaternion<f64>, InitializationError> {
    if specific_force.norm() < 1e-6 || gravity.norm() < 1e-6 {
        return Err(InitializationError::Degenerate(
            "zero specific force or gravity".into(),
        ));
    }
    let up = -gravity;
    Ok(UnitQuaternion::rotation_between(specific_force, &up).unwrap_or_else(|| {
        // Exactly opposite: any half turn about an axis orthogonal to `up`.
        let axis = up.cross(&Vector3::x());
        let axis = if axis.norm() < 1e-6 {
            up.cross(&Vector3::y())
        } else {
            axis
        };
        UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(axis), std::f64::consts::PI)
    }))
}

/// Snap a vector onto the coordinate axis it is closest to.
fn round_to_axis(v: &Vector3<f64>) -> Vector3<f64> {
    let index = v.iamax();
    let mut rounded = Vector3::zeros();
    rounded[index] = v.norm().copysign(v[index]);
    rounded
}

/// Static-start estimator over averaged IMU readings.
pub struct ImuOnlyEstimator {
    gravity: Vector3<f64>,
    round_gravity: bool,
}

impl ImuOnlyEstimator {
    pub fn new(gravity: Vector3<f64>, round_gravity: bool) -> Self {
        Self {
            gravity,
            round_gravity,
        }
    }

    /// Seed stamped at the first packet: zero velocity, gyro bias from the
    /// mean rate, accelerometer bias from the residual after removing gravity.
    pub fn estimate(&self, packets: &[SyncPacket]) -> Result<NavState, InitializationError> {
        let first = packets
            .first()
            .ok_or_else(|| InitializationError::InsufficientData("no packets".into()))?;
        let means = ImuMeans::of(packets)?;

        let measured = if self.round_gravity {
            round_to_axis(&means.acc)
        } else {
            means.acc
        };
        let attitude = align_with_gravity(&measured, &self.gravity)?;
        // Static: f_body = -R^T g, anything else is bias.
        let expected = attitude.inverse_transform_vector(&(-self.gravity));
        let bias = ImuBias::new(means.acc - expected, means.gyro);

        Ok(NavState::new(
            first.timestamp,
            NavState::pose_from(Vector3::zeros(), attitude),
            Vector3::zeros(),
            bias,
        ))
    }
}

/// Outcome of feeding one packet to the [`Initializer`].
#[derive(Debug)]
pub enum InitStep {
    /// Still buffering.
    Pending { buffered: usize },
    /// Seeded; `packets` are the buffered packets to process in the new
    /// epoch, in arrival order.
    Seeded {
        mode: SeedMode,
        seed: NavState,
        reference_frame_id: FrameId,
        packets: Vec<SyncPacket>,
    },
}

/// Buffers packets until the estimator can be seeded.
pub struct Initializer {
    params: InitializationParams,
    ground_truth: Option<Box<dyn GroundTruthSource>>,
    aligner: Box<dyn OnlineAligner>,
    imu_only: ImuOnlyEstimator,
    gravity: Vector3<f64>,
    buffer: Vec<SyncPacket>,
    last_failure: Option<String>,
}

impl Initializer {
    pub fn new(
        params: InitializationParams,
        gravity: Vector3<f64>,
        ground_truth: Option<Box<dyn GroundTruthSource>>,
        aligner: Box<dyn OnlineAligner>,
    ) -> Self {
        let imu_only = ImuOnlyEstimator::new(gravity, params.round_gravity);
        Self {
            params,
            ground_truth,
            aligner,
            imu_only,
            gravity,
            buffer: Vec::new(),
            last_failure: None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_ground_truth(&self) -> bool {
        self.ground_truth.is_some()
    }

    /// Drop buffered packets and start over.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!("Initializer reset, dropping {} buffered packets", self.buffer.len());
        }
        self.buffer.clear();
        self.last_failure = None;
    }

    /// Accept one packet while uninitialized.
    ///
    /// Fails with [`PipelineError::InitializationFailed`] once
    /// `max_initialization_frames` packets have been buffered without a seed.
    pub fn feed(&mut self, packet: SyncPacket) -> PipelineResult<InitStep> {
        if let Some(state) = packet.reinit.state.clone() {
            tracing::info!("Seeding {} from the state carried by the packet", packet.frame_id);
            return Ok(self.seed_from_latest(packet, SeedMode::GroundTruth, state));
        }

        let timestamp = packet.timestamp;
        self.buffer.push(packet);

        let mode = self.params.mode;
        let try_ground_truth = matches!(mode, InitializationMode::GroundTruth)
            || (matches!(mode, InitializationMode::Auto) && self.ground_truth.is_some());
        if try_ground_truth {
            if let Some(state) = self.ground_truth.as_ref().and_then(|gt| gt.state_at(timestamp)) {
                return Ok(self.seed_with_ground_truth(state));
            }
            tracing::debug!("No ground truth at t={}, buffering", timestamp);
        }

        let step = match mode {
            InitializationMode::GroundTruth => None,
            InitializationMode::ImuOnly => self.try_imu_only(),
            InitializationMode::OnlineAligned => self.try_online(),
            InitializationMode::Auto if self.params.assume_static_start => self.try_imu_only(),
            InitializationMode::Auto => self.try_online(),
        };
        if let Some(step) = step {
            return Ok(step);
        }

        if self.buffer.len() >= self.params.max_initialization_frames {
            let reason = self
                .last_failure
                .clone()
                .unwrap_or_else(|| "no seed source became available".to_string());
            tracing::error!(
                "Initialization failed after {} frames: {}",
                self.buffer.len(),
                reason
            );
            return Err(PipelineError::InitializationFailed {
                frames: self.buffer.len(),
                reason,
            });
        }
        Ok(InitStep::Pending {
            buffered: self.buffer.len(),
        })
    }

    /// True when the packet or the tracking history calls for a new epoch.
    pub fn check_reinitialize(&self, packet: &SyncPacket, signals: &PipelineSignals) -> bool {
        if packet.reinit.reinit {
            tracing::info!("Re-initialization requested by {}", packet.frame_id);
            return true;
        }
        let limit = self.params.max_consecutive_tracking_failures;
        let failures = signals.consecutive_tracking_failures();
        if limit > 0 && failures >= limit {
            tracing::warn!(
                "{} consecutive tracking failures, re-initializing",
                failures
            );
            return true;
        }
        false
    }

    fn seed_with_ground_truth(&mut self, state: NavState) -> InitStep {
        let discarded = self.buffer.len().saturating_sub(1);
        if discarded > 0 {
            tracing::warn!(
                "Ground truth became available, discarding {} earlier packets",
                discarded
            );
        }
        let packets = self.buffer.split_off(discarded);
        self.buffer.clear();
        self.seeded(SeedMode::GroundTruth, state, packets)
    }

    fn seed_from_latest(&mut self, packet: SyncPacket, mode: SeedMode, state: NavState) -> InitStep {
        self.buffer.clear();
        let state = state.at(packet.timestamp);
        self.seeded(mode, state, vec![packet])
    }

    fn try_imu_only(&mut self) -> Option<InitStep> {
        if self.buffer.len() < self.params.imu_only_frames {
            return None;
        }
        match self.imu_only.estimate(&self.buffer) {
            Ok(seed) => {
                let packets = std::mem::take(&mut self.buffer);
                Some(self.seeded(SeedMode::ImuOnly, seed, packets))
            }
            Err(e) => {
                tracing::warn!("IMU-only initialization: {}", e);
                self.last_failure = Some(e.to_string());
                None
            }
        }
    }

    fn try_online(&mut self) -> Option<InitStep> {
        let window = self.params.online_window_frames;
        if self.buffer.len() < window {
            return None;
        }
        let start = self.buffer.len() - window;
        match self.aligner.align(&self.buffer[start..], &self.gravity) {
            Ok(seed) => {
                if start > 0 {
                    tracing::warn!(
                        "Online alignment succeeded, discarding {} earlier packets",
                        start
                    );
                }
                let packets = self.buffer.split_off(start);
                self.buffer.clear();
                Some(self.seeded(SeedMode::OnlineAligned, seed, packets))
            }
            Err(e) => {
                tracing::warn!("Online alignment: {}", e);
                self.last_failure = Some(e.to_string());
                None
            }
        }
    }

    fn seeded(&mut self, mode: SeedMode, seed: NavState, packets: Vec<SyncPacket>) -> InitStep {
        let reference_frame_id = packets
            .first()
            .map(|p| p.frame_id)
            .unwrap_or_default();
        tracing::info!(
            "Initialized via {:?} at {} (t={}), flushing {} packets",
            mode,
            reference_frame_id,
            seed.timestamp,
            packets.len()
        );
        self.last_failure = None;
        InitStep::Seeded {
            mode,
            seed,
            reference_frame_id,
            packets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ground_truth::GroundTruthTable;
    use crate::types::{ImuSample, ReinitRequest, StereoImages};

    fn assert_vec_near(a: Vector3<f64>, b: Vector3<f64>, tol: f64) {
        assert!((a - b).norm() < tol, "{:?} != {:?} (tol {})", a, b, tol);
    }

    const GRAVITY: [f64; 3] = [0.0, 0.0, -9.81];

    fn params(mode: InitializationMode) -> InitializationParams {
        InitializationParams {
            mode,
            imu_only_frames: 3,
            online_window_frames: 2,
            max_initialization_frames: 5,
            round_gravity: true,
            ..InitializationParams::default()
        }
    }

    fn packet(id: u64, acc: Vector3<f64>, gyro: Vector3<f64>) -> SyncPacket {
        let t = id as i64 * 100;
        SyncPacket::new(
            FrameId(id),
            t,
            StereoImages::default(),
            vec![
                ImuSample::new(t - 50, acc, gyro),
                ImuSample::new(t, acc, gyro),
            ],
        )
    }

    fn static_packet(id: u64) -> SyncPacket {
        packet(
            id,
            Vector3::new(0.01, -0.02, 9.86),
            Vector3::new(0.001, 0.002, -0.003),
        )
    }

    fn initializer(mode: InitializationMode, gt: Option<GroundTruthTable>) -> Initializer {
        Initializer::new(
            params(mode),
            Vector3::from(GRAVITY),
            gt.map(|t| Box::new(t) as Box<dyn GroundTruthSource>),
            Box::new(ImuGravityAligner::default()),
        )
    }

    #[test]
    fn test_imu_only_waits_for_frames() {
        let mut init = initializer(InitializationMode::ImuOnly, None);
        assert!(matches!(
            init.feed(static_packet(0)).unwrap(),
            InitStep::Pending { buffered: 1 }
        ));
        assert!(matches!(
            init.feed(static_packet(1)).unwrap(),
            InitStep::Pending { buffered: 2 }
        ));
        match init.feed(static_packet(2)).unwrap() {
            InitStep::Seeded {
                mode,
                seed,
                reference_frame_id,
                packets,
            } => {
                assert_eq!(mode, SeedMode::ImuOnly);
                assert_eq!(reference_frame_id, FrameId(0));
                assert_eq!(packets.len(), 3);
                assert_eq!(seed.timestamp, 0);
                assert_vec_near(
                    seed.bias.gyroscope,
                    Vector3::new(0.001, 0.002, -0.003),
                    1e-12
                );
                assert_vec_near(
                    seed.bias.accelerometer,
                    Vector3::new(0.01, -0.02, 0.05),
                    1e-9
                );
                assert!(seed.rotation().angle() < 1e-12);
            }
            other => panic!("expected seed, got {:?}", other),
        }
        assert_eq!(init.buffered(), 0);
    }

    #[test]
    fn test_ground_truth_discards_earlier_packets() {
        let p0 = NavState::identity(200);
        let gt = GroundTruthTable::new(0).with_state(p0.clone());
        let mut init = initializer(InitializationMode::GroundTruth, Some(gt));

        assert!(matches!(
            init.feed(static_packet(1)).unwrap(),
            InitStep::Pending { .. }
        ));
        match init.feed(static_packet(2)).unwrap() {
            InitStep::Seeded { mode, seed, packets, .. } => {
                assert_eq!(mode, SeedMode::GroundTruth);
                assert_eq!(seed, p0);
                assert_eq!(packets.len(), 1);
                assert_eq!(packets[0].frame_id, FrameId(2));
            }
            other => panic!("expected seed, got {:?}", other),
        }
    }

    #[test]
    fn test_auto_prefers_ground_truth() {
        let gt = GroundTruthTable::new(0).with_state(NavState::identity(0));
        let mut init = initializer(InitializationMode::Auto, Some(gt));
        assert!(matches!(
            init.feed(static_packet(0)).unwrap(),
            InitStep::Seeded {
                mode: SeedMode::GroundTruth,
                ..
            }
        ));
    }

    #[test]
    fn test_online_degenerate_keeps_buffering_then_fails() {
        let mut init = initializer(InitializationMode::OnlineAligned, None);
        // Half of gravity: magnitude check fails every window.
        let weak = |id| packet(id, Vector3::new(0.0, 0.0, 4.9), Vector3::zeros());
        for id in 0..4 {
            assert!(matches!(init.feed(weak(id)).unwrap(), InitStep::Pending { .. }));
        }
        match init.feed(weak(4)) {
            Err(PipelineError::InitializationFailed { frames, reason }) => {
                assert_eq!(frames, 5);
                assert!(reason.contains("degenerate"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_online_aligns_tilted_start() {
        let mut init = initializer(InitializationMode::OnlineAligned, None);
        let tilt = UnitQuaternion::from_euler_angles(0.1, -0.05, 0.0);
        let f = tilt.inverse_transform_vector(&Vector3::new(0.0, 0.0, 9.81));
        init.feed(packet(0, f, Vector3::zeros())).unwrap();
        match init.feed(packet(1, f, Vector3::zeros())).unwrap() {
            InitStep::Seeded { mode, seed, .. } => {
                assert_eq!(mode, SeedMode::OnlineAligned);
                let up = seed.rotation() * f;
                assert_vec_near(up, Vector3::new(0.0, 0.0, 9.81), 1e-9);
            }
            other => panic!("expected seed, got {:?}", other),
        }
    }

    #[test]
    fn test_carried_state_seeds_immediately() {
        let mut init = initializer(InitializationMode::ImuOnly, None);
        init.feed(static_packet(0)).unwrap();
        let carried = NavState::identity(0);
        let p = static_packet(1).with_reinit(ReinitRequest::with_state(carried));
        match init.feed(p).unwrap() {
            InitStep::Seeded { seed, packets, .. } => {
                assert_eq!(seed.timestamp, 100);
                assert_eq!(packets.len(), 1);
            }
            other => panic!("expected seed, got {:?}", other),
        }
    }

    #[test]
    fn test_check_reinitialize() {
        let init = Initializer::new(
            InitializationParams {
                max_consecutive_tracking_failures: 2,
                ..InitializationParams::default()
            },
            Vector3::from(GRAVITY),
            None,
            Box::new(ImuGravityAligner::default()),
        );
        let signals = PipelineSignals::new();
        assert!(!init.check_reinitialize(&static_packet(0), &signals));
        assert!(init.check_reinitialize(
            &static_packet(0).with_reinit(ReinitRequest::flagged()),
            &signals
        ));
        signals.record_tracking(false);
        signals.record_tracking(false);
        assert!(init.check_reinitialize(&static_packet(0), &signals));
    }

    #[test]
    fn test_round_to_axis() {
        assert_eq!(
            round_to_axis(&Vector3::new(0.3, -0.1, -4.0)),
            Vector3::new(0.0, 0.0, -Vector3::<f64>::new(0.3, -0.1, -4.0).norm())
        );
    }

    #[test]
    fn test_record_cell_publish() {
        let cell = InitializationCell::new(InitializationRecord::uninitialized(0));
        assert!(!cell.snapshot().is_initialized());
        cell.publish(InitializationRecord::seeded(
            0,
            SeedMode::ImuOnly,
            FrameId(3),
            NavState::identity(0),
        ));
        let snapshot = cell.snapshot();
        assert_eq!(snapshot.state, InitializationState::ImuOnly);
        assert_eq!(snapshot.steady().state, InitializationState::Steady);
    }
}
