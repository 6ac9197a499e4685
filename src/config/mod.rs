//! Configuration for vio-pipeline
//!
//! A [`PipelineParams`] bundle describes one pipeline instance: the backend
//! variant, frontend/IMU/camera-rig parameters, initialization policy, run
//! mode and which optional modules are enabled.
//!
//! # Files
//!
//! Bundles are read from and written to TOML (`.toml`) or JSON (`.json`),
//! chosen by file extension. Missing fields take their defaults.
//!
//! ```toml
//! run_mode = "sequential"
//! use_loop_closure = true
//!
//! [initialization]
//! mode = "imu_only"
//! imu_only_frames = 20
//! ```

pub mod params;

pub use params::*;

use crate::error::{Result, VioError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default random seed for deterministic mode
pub const DEFAULT_RANDOM_SEED: u64 = 0;

/// Capacity of subscriber channels created by the pipeline
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Complete configuration of one pipeline instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub run_mode: RunMode,

    /// Run the mesher stage
    pub use_mesher: bool,
    /// Run the loop-closure stage
    pub use_loop_closure: bool,
    /// Run the visualizer stage
    pub use_visualizer: bool,

    /// Seed for every stochastic sub-algorithm
    pub random_seed: u64,
    /// Bound on every stage queue (`None` = unbounded)
    pub queue_capacity: Option<usize>,

    pub backend: BackendParams,
    pub frontend: FrontendParams,
    pub imu: ImuParams,
    pub stereo_rig: StereoRigParams,
    pub initialization: InitializationParams,
    pub failure_policies: FailurePolicies,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            backend: BackendParams::default(),
            frontend: FrontendParams::default(),
            imu: ImuParams::default(),
            stereo_rig: StereoRigParams::default(),
            initialization: InitializationParams::default(),
            run_mode: RunMode::Parallel,
            use_mesher: false,
            use_loop_closure: false,
            use_visualizer: false,
            random_seed: DEFAULT_RANDOM_SEED,
            queue_capacity: None,
            failure_policies: FailurePolicies::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Format::Toml),
            Some("json") => Ok(Format::Json),
            other => Err(VioError::Config(format!(
                "Unsupported configuration extension {:?} for {:?}",
                other, path
            ))),
        }
    }
}

impl PipelineParams {
    /// Load and validate a bundle from a `.toml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = Format::of(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            VioError::Config(format!("Failed to read parameters {:?}: {}", path, e))
        })?;

        let params: Self = match format {
            Format::Toml => toml::from_str(&content).map_err(|e| {
                VioError::Config(format!("Failed to parse parameters {:?}: {}", path, e))
            })?,
            Format::Json => serde_json::from_str(&content).map_err(|e| {
                VioError::Config(format!("Failed to parse parameters {:?}: {}", path, e))
            })?,
        };
        params.validate()?;
        Ok(params)
    }

    /// Write the bundle, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let format = Format::of(path)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    VioError::Config(format!("Failed to create parameter directory: {}", e))
                })?;
            }
        }

        let content = match format {
            Format::Toml => toml::to_string_pretty(self)
                .map_err(|e| VioError::Serialization(e.to_string()))?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };

        std::fs::write(path, content).map_err(|e| {
            VioError::Config(format!("Failed to write parameters {:?}: {}", path, e))
        })
    }

    /// Reject bundles the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let init = &self.initialization;
        if init.imu_only_frames == 0 {
            return Err(VioError::Config("imu_only_frames must be positive".into()));
        }
        if init.online_window_frames == 0 {
            return Err(VioError::Config(
                "online_window_frames must be positive".into(),
            ));
        }
        let needed = match init.mode {
            InitializationMode::ImuOnly => init.imu_only_frames,
            InitializationMode::OnlineAligned => init.online_window_frames,
            InitializationMode::GroundTruth => 1,
            InitializationMode::Auto if init.assume_static_start => init.imu_only_frames,
            InitializationMode::Auto => init.online_window_frames,
        };
        if init.max_initialization_frames < needed {
            return Err(VioError::Config(format!(
                "max_initialization_frames ({}) is smaller than the {} frames {:?} initialization needs",
                init.max_initialization_frames, needed, init.mode
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(VioError::Config("queue_capacity must be positive".into()));
        }
        if self.frontend.keyframe_interval == 0 {
            return Err(VioError::Config("keyframe_interval must be positive".into()));
        }
        if self.frontend.use_feature_selection && self.frontend.feature_budget == 0 {
            return Err(VioError::Config(
                "feature_budget must be positive when feature selection is enabled".into(),
            ));
        }
        let g = self.imu.gravity;
        if (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt() < 1e-6 {
            return Err(VioError::Config("gravity must be non-zero".into()));
        }
        if self.stereo_rig.baseline <= 0.0 {
            return Err(VioError::Config("stereo baseline must be positive".into()));
        }
        if self.backend.backend_type == BackendType::StructuralRegularities && !self.use_mesher {
            return Err(VioError::Config(
                "structural_regularities backend requires use_mesher".into(),
            ));
        }
        Ok(())
    }

    pub fn gravity(&self) -> nalgebra::Vector3<f64> {
        nalgebra::Vector3::from(self.imu.gravity)
    }
}
