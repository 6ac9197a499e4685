//! Mesher stage: incremental 3D mesh from keyframe estimates.

use crate::pipeline::module::{EpochTagged, StageAlgorithm, StageError, StageOutput};
use crate::pipeline::stages::backend::BackendOutput;
use nalgebra::Vector3;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mesh {
    pub vertices: Vec<Vector3<f64>>,
    pub triangles: Vec<[usize; 3]>,
}

impl Mesh {
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

/// Mesh reconstruction collaborator.
pub trait VioMesher: Send {
    fn process(&mut self, input: &BackendOutput) -> Result<StageOutput<Mesh>, StageError>;

    fn reset(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct MesherOutput {
    pub epoch: u64,
    /// Keyframe the mesh was built for.
    pub backend: Arc<BackendOutput>,
    pub mesh: Arc<Mesh>,
}

impl EpochTagged for MesherOutput {
    fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub struct MesherStage {
    mesher: Box<dyn VioMesher>,
}

impl MesherStage {
    pub fn new(mesher: Box<dyn VioMesher>) -> Self {
        Self { mesher }
    }
}

impl StageAlgorithm for MesherStage {
    type Input = Arc<BackendOutput>;
    type Output = Arc<MesherOutput>;

    fn name(&self) -> &str {
        "mesher"
    }

    fn process(&mut self, input: Arc<BackendOutput>) -> Result<StageOutput<Self::Output>, StageError> {
        Ok(self.mesher.process(&input)?.map(|mesh| {
            Arc::new(MesherOutput {
                epoch: input.epoch,
                backend: input.clone(),
                mesh: Arc::new(mesh),
            })
        }))
    }

    fn reset(&mut self) {
        self.mesher.reset();
    }
}
