//! Visualizer stage and the display side of it.
//!
//! The visualizer turns keyframe estimates (and meshes, if the mesher runs)
//! into drawable widgets on its own worker. Showing them is left to a
//! [`Display`] driven from the thread that owns the display surface, through
//! a [`DisplayHandle`].

use crate::pipeline::module::{EpochTagged, StageAlgorithm, StageError, StageOutput};
use crate::pipeline::queue::ThreadsafeQueue;
use crate::pipeline::stages::backend::BackendOutput;
use crate::pipeline::stages::mesher::Mesh;
use crate::types::{FrameId, Pose};
use nalgebra::Vector3;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Widget {
    Trajectory(Vec<Vector3<f64>>),
    Frustum(Pose),
    Mesh { vertices: usize, triangles: usize },
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualizerFrame {
    pub frame_id: FrameId,
    pub widgets: Vec<Widget>,
}

#[derive(Debug, Clone)]
pub struct VisualizerInput {
    pub epoch: u64,
    pub backend: Arc<BackendOutput>,
    pub mesh: Option<Arc<Mesh>>,
}

impl VisualizerInput {
    pub fn new(backend: Arc<BackendOutput>, mesh: Option<Arc<Mesh>>) -> Self {
        Self {
            epoch: backend.epoch,
            backend,
            mesh,
        }
    }
}

impl EpochTagged for VisualizerInput {
    fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Rendering-preparation collaborator.
pub trait VioVisualizer: Send {
    fn process(&mut self, input: &VisualizerInput) -> Result<StageOutput<VisualizerFrame>, StageError>;

    fn reset(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct VisualizerOutput {
    pub epoch: u64,
    pub frame: VisualizerFrame,
}

impl EpochTagged for VisualizerOutput {
    fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub struct VisualizerStage {
    visualizer: Box<dyn VioVisualizer>,
}

impl VisualizerStage {
    pub fn new(visualizer: Box<dyn VioVisualizer>) -> Self {
        Self { visualizer }
    }
}

impl StageAlgorithm for VisualizerStage {
    type Input = VisualizerInput;
    type Output = Arc<VisualizerOutput>;

    fn name(&self) -> &str {
        "visualizer"
    }

    fn process(&mut self, input: VisualizerInput) -> Result<StageOutput<Self::Output>, StageError> {
        Ok(self.visualizer.process(&input)?.map(|frame| {
            Arc::new(VisualizerOutput {
                epoch: input.epoch,
                frame,
            })
        }))
    }

    fn reset(&mut self) {
        self.visualizer.reset();
    }
}

/// Shows finished visualizer outputs.
pub trait Display {
    fn show(&mut self, output: &VisualizerOutput);
}

impl<F: FnMut(&VisualizerOutput)> Display for F {
    fn show(&mut self, output: &VisualizerOutput) {
        self(output)
    }
}

/// Consumer end of the display queue, movable to the display thread.
#[derive(Clone)]
pub struct DisplayHandle {
    queue: Arc<ThreadsafeQueue<Arc<VisualizerOutput>>>,
}

impl DisplayHandle {
    pub(crate) fn new(queue: Arc<ThreadsafeQueue<Arc<VisualizerOutput>>>) -> Self {
        Self { queue }
    }

    /// Show outputs as they arrive until the pipeline shuts down and the
    /// queue is drained. Returns how many outputs were shown.
    pub fn spin(&self, display: &mut dyn Display) -> usize {
        let mut shown = 0;
        while let Some(output) = self.queue.pop_blocking() {
            display.show(&output);
            shown += 1;
        }
        tracing::debug!("Display loop finished after {} outputs", shown);
        shown
    }

    /// Show whatever is queued right now without waiting.
    pub fn drain(&self, display: &mut dyn Display) -> usize {
        let mut shown = 0;
        while let Ok(output) = self.queue.pop_non_blocking() {
            display.show(&output);
            shown += 1;
        }
        shown
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
