//! Parameter bundles for each part of the pipeline
//!
//! Every struct here is `#[serde(default)]`, so a configuration file only
//! needs to name the values it changes.

use crate::pipeline::module::FailurePolicy;
use serde::{Deserialize, Serialize};

/// Backend estimator variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// Stereo visual-inertial smart-factor backend
    #[default]
    Stereo,
    /// Stereo backend with structural regularity factors from the mesh
    StructuralRegularities,
}

/// Whether stages run on their own threads or on the caller's thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Parallel,
    Sequential,
}

/// How the first state of an epoch is seeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitializationMode {
    /// Ground truth if available, then IMU-only (static start), then online alignment
    #[default]
    Auto,
    GroundTruth,
    ImuOnly,
    OnlineAligned,
}

/// Backend estimator parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendParams {
    /// Estimator variant; must match the injected backend
    pub backend_type: BackendType,
    /// Reprojection error threshold for smart factors (pixels)
    pub smart_factor_threshold: f64,
    /// Landmarks farther than this are not triangulated (meters)
    pub landmark_distance_threshold: f64,
    /// Keyframes kept in the optimization window
    pub horizon_keyframes: usize,
}

impl Default for BackendParams {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Stereo,
            smart_factor_threshold: 2.5,
            landmark_distance_threshold: 20.0,
            horizon_keyframes: 6,
        }
    }
}

/// Feature tracking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendParams {
    /// Maximum features tracked per frame
    pub max_features: usize,
    /// Features kept after covariance-aware selection
    pub feature_budget: usize,
    /// Run feature selection inline in the frontend
    pub use_feature_selection: bool,
    /// Emit a keyframe every N frames
    pub keyframe_interval: u64,
    /// RANSAC iterations for geometric verification
    pub ransac_iterations: usize,
}

impl Default for FrontendParams {
    fn default() -> Self {
        Self {
            max_features: 300,
            feature_budget: 100,
            use_feature_selection: false,
            keyframe_interval: 5,
            ransac_iterations: 100,
        }
    }
}

/// Inertial sensor parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuParams {
    /// Gravity in the world frame (m/s²)
    pub gravity: [f64; 3],
    /// Gyroscope noise density (rad/s/√Hz)
    pub gyro_noise_density: f64,
    /// Accelerometer noise density (m/s²/√Hz)
    pub acc_noise_density: f64,
    /// Sample rate (Hz)
    pub rate_hz: f64,
}

impl Default for ImuParams {
    fn default() -> Self {
        Self {
            gravity: [0.0, 0.0, -9.81],
            gyro_noise_density: 1.7e-4,
            acc_noise_density: 2.0e-3,
            rate_hz: 200.0,
        }
    }
}

/// Stereo camera rig description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoRigParams {
    /// fx, fy, cx, cy of the (rectified) left camera
    pub intrinsics: [f64; 4],
    /// Distance between the optical centers (meters)
    pub baseline: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for StereoRigParams {
    fn default() -> Self {
        Self {
            intrinsics: [458.654, 457.296, 367.215, 248.375],
            baseline: 0.11,
            width: 752,
            height: 480,
        }
    }
}

/// Initialization state machine parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializationParams {
    pub mode: InitializationMode,
    /// Under `Auto`, assume a static upright start and use IMU-only seeding
    pub assume_static_start: bool,
    /// Frames averaged by the IMU-only estimator
    pub imu_only_frames: usize,
    /// Frames in the online gravity-alignment window
    pub online_window_frames: usize,
    /// Frames buffered without a seed before initialization is fatal
    pub max_initialization_frames: usize,
    /// Snap the IMU-only gravity direction to the nearest body axis
    pub round_gravity: bool,
    /// Re-initialize after this many consecutive tracking failures (0 = never)
    pub max_consecutive_tracking_failures: u32,
    /// Online alignment: allowed specific-force magnitude error (m/s²)
    pub gravity_magnitude_tolerance: f64,
    /// Online alignment: allowed accelerometer RMS spread (m/s²)
    pub max_accelerometer_spread: f64,
}

impl Default for InitializationParams {
    fn default() -> Self {
        Self {
            mode: InitializationMode::Auto,
            assume_static_start: true,
            imu_only_frames: 10,
            online_window_frames: 20,
            max_initialization_frames: 200,
            round_gravity: true,
            max_consecutive_tracking_failures: 0,
            gravity_magnitude_tolerance: 0.3,
            max_accelerometer_spread: 0.5,
        }
    }
}

/// What each module does with a transient failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FailurePolicies {
    pub frontend: FailurePolicy,
    pub backend: FailurePolicy,
    pub mesher: FailurePolicy,
    pub loop_closure: FailurePolicy,
    pub visualizer: FailurePolicy,
}
