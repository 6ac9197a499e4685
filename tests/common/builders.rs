//! Test data builders for creating packets and parameter bundles

use nalgebra::Vector3;
use vio_pipeline::config::{InitializationMode, PipelineParams, RunMode};
use vio_pipeline::types::ReinitRequest;
use vio_pipeline::{FrameId, ImuSample, NavState, StereoImages, SyncPacket, Timestamp};

pub const FRAME_PERIOD_NS: i64 = 50_000_000;
pub const IMU_PER_FRAME: i64 = 10;
pub const STANDARD_GRAVITY: f64 = 9.81;

pub fn frame_timestamp(id: u64) -> Timestamp {
    id as i64 * FRAME_PERIOD_NS
}

/// Builder for creating test packets. Defaults to a camera at rest.
pub struct PacketBuilder {
    id: u64,
    acc: Vector3<f64>,
    gyro: Vector3<f64>,
    reinit: ReinitRequest,
}

impl PacketBuilder {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            acc: Vector3::new(0.0, 0.0, STANDARD_GRAVITY),
            gyro: Vector3::zeros(),
            reinit: ReinitRequest::default(),
        }
    }

    pub fn acc(mut self, acc: Vector3<f64>) -> Self {
        self.acc = acc;
        self
    }

    pub fn gyro(mut self, gyro: Vector3<f64>) -> Self {
        self.gyro = gyro;
        self
    }

    pub fn reinit(mut self) -> Self {
        self.reinit = ReinitRequest::flagged();
        self
    }

    pub fn reinit_with(mut self, state: NavState) -> Self {
        self.reinit = ReinitRequest::with_state(state);
        self
    }

    pub fn build(self) -> SyncPacket {
        let t0 = frame_timestamp(self.id);
        let step = FRAME_PERIOD_NS / IMU_PER_FRAME;
        let imu = (0..IMU_PER_FRAME)
            .map(|i| ImuSample::new(t0 + i * step, self.acc, self.gyro))
            .collect();
        SyncPacket::new(FrameId(self.id), t0, StereoImages::default(), imu).with_reinit(self.reinit)
    }
}

/// Packets for a camera at rest, one per frame id.
pub fn stationary_sequence(ids: std::ops::Range<u64>) -> Vec<SyncPacket> {
    ids.map(|id| PacketBuilder::new(id).build()).collect()
}

/// Ground-truth mode, run on the calling thread.
pub fn sequential_params() -> PipelineParams {
    let mut params = PipelineParams::default();
    params.run_mode = RunMode::Sequential;
    params.initialization.mode = InitializationMode::GroundTruth;
    params
}

/// Ground-truth mode, one thread per module.
pub fn parallel_params() -> PipelineParams {
    let mut params = sequential_params();
    params.run_mode = RunMode::Parallel;
    params
}

/// Every optional module on.
pub fn with_all_modules(mut params: PipelineParams) -> PipelineParams {
    params.use_mesher = true;
    params.use_loop_closure = true;
    params.use_visualizer = true;
    params
}

/// Ground truth that knows every timestamp: identity pose at rest.
pub fn identity_ground_truth(timestamp: Timestamp) -> Option<NavState> {
    Some(NavState::identity(timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_builder() {
        let packet = PacketBuilder::new(3).gyro(Vector3::new(0.1, 0.0, 0.0)).reinit().build();

        assert_eq!(packet.frame_id, FrameId(3));
        assert_eq!(packet.timestamp, 3 * FRAME_PERIOD_NS);
        assert_eq!(packet.imu.len(), IMU_PER_FRAME as usize);
        assert!(packet.reinit.reinit);
        assert_eq!(packet.imu[0].gyro.x, 0.1);
    }
}
