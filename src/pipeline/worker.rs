//! Worker threads owning stage modules.
//!
//! A [`WorkerSlot`] holds a module either idle (owned by the slot) or
//! running on a named thread that hands the module back when it exits.
//! Handing it back is what makes pause/resume possible: the same module,
//! with its accumulated state, is relaunched on a fresh thread.

use crate::pipeline::module::{ModuleStats, SpinOutcome, StageAlgorithm, StageModule};
use crate::pipeline::queue::StopHandle;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Object-safe view of a stage module so heterogeneous modules can share
/// one worker table.
pub trait Worker: Send + 'static {
    fn name(&self) -> &str;
    fn spin(&mut self);
    fn spin_once(&mut self) -> SpinOutcome;
    fn is_working(&self) -> bool;
    fn stats(&self) -> Arc<ModuleStats>;
}

impl<A: StageAlgorithm> Worker for StageModule<A> {
    fn name(&self) -> &str {
        StageModule::name(self)
    }

    fn spin(&mut self) {
        StageModule::spin(self)
    }

    fn spin_once(&mut self) -> SpinOutcome {
        StageModule::spin_once(self)
    }

    fn is_working(&self) -> bool {
        StageModule::is_working(self)
    }

    fn stats(&self) -> Arc<ModuleStats> {
        StageModule::stats(self)
    }
}

enum SlotState {
    Idle(Box<dyn Worker>),
    Running(JoinHandle<Box<dyn Worker>>),
    /// The worker thread panicked; the module is gone.
    Lost,
}

/// One pipeline worker and the input queue that feeds it.
pub struct WorkerSlot {
    thread_name: String,
    input: Arc<dyn StopHandle>,
    stats: Arc<ModuleStats>,
    state: Option<SlotState>,
}

impl WorkerSlot {
    pub fn new(thread_name: impl Into<String>, worker: Box<dyn Worker>, input: Arc<dyn StopHandle>) -> Self {
        Self {
            thread_name: thread_name.into(),
            input,
            stats: worker.stats(),
            state: Some(SlotState::Idle(worker)),
        }
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn stats(&self) -> &Arc<ModuleStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, Some(SlotState::Running(_)))
    }

    /// Move the module onto its own thread. No-op if already running.
    pub fn launch(&mut self) -> std::io::Result<()> {
        match self.state.take() {
            Some(SlotState::Idle(mut worker)) => {
                let spawned = thread::Builder::new()
                    .name(self.thread_name.clone())
                    .spawn(move || {
                        worker.spin();
                        worker
                    });
                match spawned {
                    Ok(handle) => {
                        tracing::info!("Launched worker {}", self.thread_name);
                        self.state = Some(SlotState::Running(handle));
                        Ok(())
                    }
                    Err(e) => {
                        // The closure (and the module in it) is lost with the
                        // failed spawn.
                        self.state = Some(SlotState::Lost);
                        Err(e)
                    }
                }
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    /// Stop this worker's input queue.
    pub fn stop_input(&self) {
        self.input.stop();
    }

    pub fn resume_input(&self) {
        self.input.resume();
    }

    /// Wait for the worker thread to exit and take the module back.
    ///
    /// Returns false if the thread panicked.
    pub fn join(&mut self) -> bool {
        match self.state.take() {
            Some(SlotState::Running(handle)) => match handle.join() {
                Ok(worker) => {
                    tracing::debug!("Joined worker {}", self.thread_name);
                    self.state = Some(SlotState::Idle(worker));
                    true
                }
                Err(_) => {
                    tracing::error!("Worker {} panicked", self.thread_name);
                    self.state = Some(SlotState::Lost);
                    false
                }
            },
            Some(SlotState::Lost) => {
                self.state = Some(SlotState::Lost);
                false
            }
            other => {
                self.state = other;
                true
            }
        }
    }

    /// The module, if it is not currently running on a thread.
    pub fn worker_mut(&mut self) -> Option<&mut (dyn Worker + 'static)> {
        match self.state.as_mut() {
            Some(SlotState::Idle(worker)) => Some(worker.as_mut()),
            _ => None,
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.is_running() {
            self.input.stop();
            self.join();
        }
    }
}
