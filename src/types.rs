//! Core data types for the VIO pipeline
//!
//! This module contains the sensor and state types that flow between the
//! pipeline stages.
//!
//! # Main Types
//!
//! - [`SyncPacket`] - One synchronized stereo image pair plus the IMU samples
//!   collected since the previous packet
//! - [`NavState`] - Pose, velocity and IMU bias at a timestamp
//! - [`ImuBias`] - Accelerometer and gyroscope biases
//! - [`ReinitRequest`] - Optional re-initialization flag carried by a packet
//!
//! # Ownership
//!
//! Packets are moved from the caller into the pipeline and from queue to
//! stage; nothing in this module is shared between stages.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in nanoseconds.
pub type Timestamp = i64;

/// Rigid body pose of the body frame in the world frame (`W_Pose_B`).
pub type Pose = Isometry3<f64>;

/// Sequential frame identifier assigned by the data provider.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FrameId(pub u64);

impl FrameId {
    #[inline]
    pub fn next(self) -> Self {
        FrameId(self.0 + 1)
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single inertial measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp: Timestamp,
    /// Specific force in the body frame (m/s^2).
    pub acc: Vector3<f64>,
    /// Angular velocity in the body frame (rad/s).
    pub gyro: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp: Timestamp, acc: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp,
            acc,
            gyro,
        }
    }
}

/// Accelerometer and gyroscope biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuBias {
    pub accelerometer: Vector3<f64>,
    pub gyroscope: Vector3<f64>,
}

impl Default for ImuBias {
    fn default() -> Self {
        Self {
            accelerometer: Vector3::zeros(),
            gyroscope: Vector3::zeros(),
        }
    }
}

impl ImuBias {
    pub fn new(accelerometer: Vector3<f64>, gyroscope: Vector3<f64>) -> Self {
        Self {
            accelerometer,
            gyroscope,
        }
    }
}

/// Estimator state at a timestamp.
///
/// Immutable snapshot: stages produce a new `NavState` rather than mutating
/// one they received.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavState {
    pub timestamp: Timestamp,
    pub pose: Pose,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
}

impl NavState {
    pub fn new(timestamp: Timestamp, pose: Pose, velocity: Vector3<f64>, bias: ImuBias) -> Self {
        Self {
            timestamp,
            pose,
            velocity,
            bias,
        }
    }

    /// Identity pose, zero velocity, zero bias.
    pub fn identity(timestamp: Timestamp) -> Self {
        Self::new(
            timestamp,
            Pose::identity(),
            Vector3::zeros(),
            ImuBias::default(),
        )
    }

    /// Same state with a new timestamp.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn position(&self) -> Vector3<f64> {
        self.pose.translation.vector
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.pose.rotation
    }

    /// Build a pose from a position and an attitude.
    pub fn pose_from(position: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Pose {
        Isometry3::from_parts(Translation3::from(position), rotation)
    }
}

/// A grayscale image as delivered by the camera driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GrayImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// An all-black image of the given size.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0; (width as usize) * (height as usize)])
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Left/right image pair captured at the same instant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StereoImages {
    pub left: GrayImage,
    pub right: GrayImage,
}

impl StereoImages {
    pub fn new(left: GrayImage, right: GrayImage) -> Self {
        Self { left, right }
    }
}

/// Request carried by a packet to restart initialization.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReinitRequest {
    /// Whether re-initialization is requested with this packet.
    pub reinit: bool,
    /// State to seed the new epoch with, if the provider knows it.
    pub state: Option<NavState>,
}

impl ReinitRequest {
    pub fn flagged() -> Self {
        Self {
            reinit: true,
            state: None,
        }
    }

    pub fn with_state(state: NavState) -> Self {
        Self {
            reinit: true,
            state: Some(state),
        }
    }
}

/// One unit of synchronized sensor input.
///
/// Holds the stereo pair at `timestamp` and every IMU sample in
/// `(previous packet timestamp, timestamp]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPacket {
    pub frame_id: FrameId,
    pub timestamp: Timestamp,
    pub images: StereoImages,
    pub imu: Vec<ImuSample>,
    pub reinit: ReinitRequest,
}

impl SyncPacket {
    pub fn new(
        frame_id: FrameId,
        timestamp: Timestamp,
        images: StereoImages,
        imu: Vec<ImuSample>,
    ) -> Self {
        Self {
            frame_id,
            timestamp,
            images,
            imu,
            reinit: ReinitRequest::default(),
        }
    }

    /// Attach a re-initialization request.
    pub fn with_reinit(mut self, reinit: ReinitRequest) -> Self {
        self.reinit = reinit;
        self
    }

    pub fn has_imu(&self) -> bool {
        !self.imu.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nav_state_identity() {
        let state = NavState::identity(42);
        assert_eq!(state.timestamp, 42);
        assert_eq!(state.position(), Vector3::zeros());
        assert_eq!(state.velocity, Vector3::zeros());
        assert_eq!(state.bias, ImuBias::default());
    }

    #[test]
    fn test_nav_state_at_keeps_pose() {
        let pose = NavState::pose_from(Vector3::new(1.0, 2.0, 3.0), UnitQuaternion::identity());
        let state = NavState::new(1, pose, Vector3::zeros(), ImuBias::default()).at(5);
        assert_eq!(state.timestamp, 5);
        assert_eq!(state.position(), Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_sync_packet_reinit() {
        let packet = SyncPacket::new(FrameId(3), 100, StereoImages::default(), Vec::new())
            .with_reinit(ReinitRequest::flagged());
        assert!(packet.reinit.reinit);
        assert!(packet.reinit.state.is_none());
        assert!(!packet.has_imu());
    }

    #[test]
    fn test_blank_image_size() {
        let image = GrayImage::blank(4, 3);
        assert_eq!(image.pixels.len(), 12);
        assert!(!image.is_empty());
    }

    #[test]
    fn test_frame_id_next() {
        assert_eq!(FrameId(7).next(), FrameId(8));
        assert_eq!(format!("{:?}", FrameId(2)), "FrameId(2)");
    }
}
