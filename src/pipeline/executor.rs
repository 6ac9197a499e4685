//! Pipeline orchestrator.
//!
//! [`PipelineBuilder`] wires the stage modules together from a
//! [`PipelineParams`] bundle and the injected collaborators; [`Pipeline`]
//! owns the result and exposes the lifecycle:
//!
//! 1. `spin(packet)` hands a packet to the initializer until a seed exists,
//!    then to the frontend queue.
//! 2. In parallel mode every module runs on its own named thread; in
//!    sequential mode `spin` drives each module on the caller's thread until
//!    the packet has been fully processed.
//! 3. `pause`/`resume` park and relaunch the workers; `shutdown` is terminal
//!    and idempotent.
//!
//! Outputs reach callers through callbacks registered on the backend
//! (keyframe rate) and loop-closure stages. Those callbacks run on the
//! producing stage's worker thread.

use crate::config::{InitializationMode, PipelineParams, RunMode, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::ground_truth::GroundTruthSource;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::initialization::{
    ImuGravityAligner, InitStep, InitializationCell, InitializationRecord, InitializationState,
    Initializer, OnlineAligner,
};
use crate::pipeline::module::{ModuleStats, ModuleStatsSnapshot, SpinOutcome, StageAlgorithm, StageModule};
use crate::pipeline::queue::ThreadsafeQueue;
use crate::pipeline::signals::{FatalReport, PipelineSignals};
use crate::pipeline::sink::SinkList;
use crate::pipeline::stages::{
    BackendOutput, BackendStage, CovarianceFeatureSelector, Display, DisplayHandle, FeatureSelector,
    FrontendInput, FrontendOutput, FrontendStage, LcdOutput, LoopClosureDetector, LoopClosureStage,
    MesherOutput, MesherStage, SharedBackendState, VioBackend, VioFrontend, VioMesher,
    VioVisualizer, VisualizerInput, VisualizerOutput, VisualizerStage,
};
use crate::pipeline::worker::WorkerSlot;
use crate::types::SyncPacket;
use crossbeam_channel::Receiver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Coarse lifecycle of a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// Workers joined, queues closed; `resume()` relaunches.
    Paused,
    /// Terminal.
    ShutDown,
}

fn configuration_error(message: impl Into<String>) -> PipelineError {
    let message = message.into();
    tracing::error!("Configuration error: {}", message);
    PipelineError::Configuration(message)
}

fn fatal_error(signals: &PipelineSignals) -> PipelineResult<()> {
    match signals.fatal() {
        Some(FatalReport { stage, message }) => Err(PipelineError::Fatal { stage, message }),
        None => Ok(()),
    }
}

fn new_queue<T: Send + 'static>(
    name: &str,
    capacity: Option<usize>,
    signals: &PipelineSignals,
) -> Arc<ThreadsafeQueue<T>> {
    let queue = Arc::new(ThreadsafeQueue::with_capacity(name, capacity));
    signals.register_queue(queue.clone());
    queue
}

/// Enabled-but-missing is an error; supplied-but-disabled is ignored.
fn optional_stage<T>(name: &str, enabled: bool, stage: Option<T>) -> PipelineResult<Option<T>> {
    match (enabled, stage) {
        (true, Some(stage)) => Ok(Some(stage)),
        (true, None) => Err(configuration_error(format!(
            "use_{} is set but no {} algorithm was supplied",
            name, name
        ))),
        (false, Some(_)) => {
            tracing::warn!("A {} algorithm was supplied but use_{} is off, ignoring it", name, name);
            Ok(None)
        }
        (false, None) => Ok(None),
    }
}

/// Collects collaborators and wires a [`Pipeline`].
pub struct PipelineBuilder {
    params: PipelineParams,
    frontend: Option<Box<dyn VioFrontend>>,
    backend: Option<Box<dyn VioBackend>>,
    mesher: Option<Box<dyn VioMesher>>,
    loop_closure: Option<Box<dyn LoopClosureDetector>>,
    visualizer: Option<Box<dyn VioVisualizer>>,
    feature_selector: Option<Box<dyn FeatureSelector>>,
    ground_truth: Option<Box<dyn GroundTruthSource>>,
    online_aligner: Option<Box<dyn OnlineAligner>>,
}

impl PipelineBuilder {
    pub fn new(params: PipelineParams) -> Self {
        Self {
            params,
            frontend: None,
            backend: None,
            mesher: None,
            loop_closure: None,
            visualizer: None,
            feature_selector: None,
            ground_truth: None,
            online_aligner: None,
        }
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn frontend(mut self, frontend: impl VioFrontend + 'static) -> Self {
        self.frontend = Some(Box::new(frontend));
        self
    }

    pub fn backend(mut self, backend: impl VioBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn mesher(mut self, mesher: impl VioMesher + 'static) -> Self {
        self.mesher = Some(Box::new(mesher));
        self
    }

    pub fn loop_closure(mut self, detector: impl LoopClosureDetector + 'static) -> Self {
        self.loop_closure = Some(Box::new(detector));
        self
    }

    pub fn visualizer(mut self, visualizer: impl VioVisualizer + 'static) -> Self {
        self.visualizer = Some(Box::new(visualizer));
        self
    }

    /// Replace the default [`CovarianceFeatureSelector`].
    pub fn feature_selector(mut self, selector: impl FeatureSelector + 'static) -> Self {
        self.feature_selector = Some(Box::new(selector));
        self
    }

    pub fn ground_truth(mut self, source: impl GroundTruthSource + 'static) -> Self {
        self.ground_truth = Some(Box::new(source));
        self
    }

    /// Replace the default [`ImuGravityAligner`].
    pub fn online_aligner(mut self, aligner: impl OnlineAligner + 'static) -> Self {
        self.online_aligner = Some(Box::new(aligner));
        self
    }

    /// Validate, wire every enabled stage and, in parallel mode, launch the
    /// workers.
    pub fn build(self) -> PipelineResult<Pipeline> {
        let params = self.params;
        params
            .validate()
            .map_err(|e| configuration_error(e.to_string()))?;

        let frontend = self
            .frontend
            .ok_or_else(|| configuration_error("no frontend algorithm was supplied"))?;
        let backend = self
            .backend
            .ok_or_else(|| configuration_error("no backend algorithm was supplied"))?;
        if backend.variant() != params.backend.backend_type {
            return Err(configuration_error(format!(
                "backend_type is {:?} but the supplied backend is {:?}",
                params.backend.backend_type,
                backend.variant()
            )));
        }
        let mesher = optional_stage("mesher", params.use_mesher, self.mesher)?;
        let loop_closure = optional_stage("loop_closure", params.use_loop_closure, self.loop_closure)?;
        let visualizer = optional_stage("visualizer", params.use_visualizer, self.visualizer)?;
        if params.initialization.mode == InitializationMode::GroundTruth && self.ground_truth.is_none() {
            return Err(configuration_error(
                "ground-truth initialization needs a ground-truth source",
            ));
        }

        let parallel = params.run_mode == RunMode::Parallel;
        let capacity = params.queue_capacity;
        let policies = params.failure_policies.clone();
        let signals = PipelineSignals::new();
        let record = InitializationCell::new(InitializationRecord::uninitialized(0));
        let backend_state = SharedBackendState::default();

        // One draw per stage slot, enabled or not, so a stage's seed does not
        // depend on which other modules are on.
        let mut rng = StdRng::seed_from_u64(params.random_seed);
        let seeds: [u64; 5] = std::array::from_fn(|_| rng.gen());

        // Frontend
        let frontend_queue = new_queue::<FrontendInput>("frontend", capacity, &signals);
        let mut frontend_stage = FrontendStage::new(frontend, signals.clone());
        if params.frontend.use_feature_selection {
            let selector = self
                .feature_selector
                .unwrap_or_else(|| Box::new(CovarianceFeatureSelector));
            frontend_stage = frontend_stage.with_feature_selection(
                selector,
                params.frontend.feature_budget,
                backend_state.clone(),
                parallel,
            );
        }
        frontend_stage.seed(seeds[0]);
        let frontend_module =
            StageModule::new(frontend_stage, frontend_queue.clone(), signals.clone(), parallel)
                .with_policy(policies.frontend);

        // Backend
        let backend_queue = new_queue::<Arc<FrontendOutput>>("backend", capacity, &signals);
        frontend_module.sinks().connect_stage_queue(
            backend_queue.clone(),
            signals.clone(),
            |output: &Arc<FrontendOutput>| Some(output.clone()),
        );
        let mut backend_stage = BackendStage::new(backend, record.clone(), backend_state);
        backend_stage.seed(seeds[1]);
        let backend_module =
            StageModule::new(backend_stage, backend_queue.clone(), signals.clone(), parallel)
                .with_policy(policies.backend);
        let backend_sinks = backend_module.sinks();

        let mut workers = vec![
            WorkerSlot::new("vio-frontend", Box::new(frontend_module), frontend_queue.clone()),
            WorkerSlot::new("vio-backend", Box::new(backend_module), backend_queue),
        ];

        // Mesher
        let mesher_sinks = match mesher {
            Some(mesher) => {
                let queue = new_queue::<Arc<BackendOutput>>("mesher", capacity, &signals);
                backend_sinks.connect_stage_queue(
                    queue.clone(),
                    signals.clone(),
                    |output: &Arc<BackendOutput>| Some(output.clone()),
                );
                let mut stage = MesherStage::new(mesher);
                stage.seed(seeds[2]);
                let module = StageModule::new(stage, queue.clone(), signals.clone(), parallel)
                    .with_policy(policies.mesher);
                let sinks = module.sinks();
                workers.push(WorkerSlot::new("vio-mesher", Box::new(module), queue));
                Some(sinks)
            }
            None => None,
        };

        // Loop closure
        let lcd_sinks = match loop_closure {
            Some(detector) => {
                let queue = new_queue::<Arc<BackendOutput>>("loop_closure", capacity, &signals);
                backend_sinks.connect_stage_queue(
                    queue.clone(),
                    signals.clone(),
                    |output: &Arc<BackendOutput>| Some(output.clone()),
                );
                let mut stage = LoopClosureStage::new(detector);
                stage.seed(seeds[3]);
                let module = StageModule::new(stage, queue.clone(), signals.clone(), parallel)
                    .with_policy(policies.loop_closure);
                let sinks = module.sinks();
                workers.push(WorkerSlot::new("vio-lcd", Box::new(module), queue));
                Some(sinks)
            }
            None => None,
        };

        // Visualizer. The display queue is drained by `spin_viz`, outside
        // the in-flight accounting.
        let display_queue = new_queue::<Arc<VisualizerOutput>>("display", None, &signals);
        if let Some(visualizer) = visualizer {
            let queue = new_queue::<VisualizerInput>("visualizer", capacity, &signals);
            match &mesher_sinks {
                Some(mesher_sinks) => mesher_sinks.connect_stage_queue(
                    queue.clone(),
                    signals.clone(),
                    |output: &Arc<MesherOutput>| {
                        Some(VisualizerInput::new(
                            output.backend.clone(),
                            Some(output.mesh.clone()),
                        ))
                    },
                ),
                None => backend_sinks.connect_stage_queue(
                    queue.clone(),
                    signals.clone(),
                    |output: &Arc<BackendOutput>| Some(VisualizerInput::new(output.clone(), None)),
                ),
            }
            let mut stage = VisualizerStage::new(visualizer);
            stage.seed(seeds[4]);
            let module = StageModule::new(stage, queue.clone(), signals.clone(), parallel)
                .with_policy(policies.visualizer);
            module.sinks().connect_output_queue(
                display_queue.clone(),
                |output: &Arc<VisualizerOutput>| Some(output.clone()),
            );
            workers.push(WorkerSlot::new("vio-visualizer", Box::new(module), queue));
        }

        let online_aligner = self.online_aligner.unwrap_or_else(|| {
            Box::new(ImuGravityAligner::new(
                params.initialization.gravity_magnitude_tolerance,
                params.initialization.max_accelerometer_spread,
            ))
        });
        let initializer = Initializer::new(
            params.initialization.clone(),
            params.gravity(),
            self.ground_truth,
            online_aligner,
        );

        let stats: Vec<(String, Arc<ModuleStats>)> = workers
            .iter()
            .map(|slot| (slot.thread_name().to_string(), slot.stats().clone()))
            .collect();
        let frontend_stats = stats[0].1.clone();

        let mut pipeline = Pipeline {
            params,
            signals,
            record,
            initializer,
            frontend_queue,
            frontend_submitted: 0,
            frontend_stats,
            display_queue,
            backend_sinks,
            lcd_sinks,
            workers,
            stats,
            lifecycle: Lifecycle::Running,
        };

        if parallel {
            pipeline.launch_workers()?;
        }
        tracing::info!(
            "Pipeline built: {} modules, {:?} mode, initialization {:?}",
            pipeline.workers.len(),
            pipeline.params.run_mode,
            pipeline.params.initialization.mode
        );
        Ok(pipeline)
    }
}

/// A wired visual-inertial pipeline.
pub struct Pipeline {
    params: PipelineParams,
    signals: Arc<PipelineSignals>,
    record: Arc<InitializationCell>,
    initializer: Initializer,
    frontend_queue: Arc<ThreadsafeQueue<FrontendInput>>,
    /// Packets pushed to the frontend queue so far.
    frontend_submitted: u64,
    frontend_stats: Arc<ModuleStats>,
    display_queue: Arc<ThreadsafeQueue<Arc<VisualizerOutput>>>,
    backend_sinks: SinkList<Arc<BackendOutput>>,
    lcd_sinks: Option<SinkList<Arc<LcdOutput>>>,
    /// In launch order: frontend, backend, mesher, loop closure, visualizer.
    workers: Vec<WorkerSlot>,
    stats: Vec<(String, Arc<ModuleStats>)>,
    lifecycle: Lifecycle,
}

impl Pipeline {
    pub fn builder(params: PipelineParams) -> PipelineBuilder {
        PipelineBuilder::new(params)
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    fn is_sequential(&self) -> bool {
        self.params.run_mode == RunMode::Sequential
    }

    fn launch_workers(&mut self) -> PipelineResult<()> {
        for slot in &mut self.workers {
            slot.launch()?;
        }
        Ok(())
    }

    fn ensure_accepting(&self) -> PipelineResult<()> {
        match self.lifecycle {
            Lifecycle::ShutDown => Err(PipelineError::ShutDown),
            Lifecycle::Paused => Err(PipelineError::Paused),
            Lifecycle::Running => fatal_error(&self.signals),
        }
    }

    // ── Input ──

    /// Accept one packet.
    ///
    /// While uninitialized the packet goes to the initializer, which may
    /// buffer it. Once a seed exists, buffered packets and then every new
    /// packet are queued for the frontend. In parallel mode this returns
    /// after the hand-off; in sequential mode after the packet has gone
    /// through every stage.
    pub fn spin(&mut self, packet: SyncPacket) -> PipelineResult<()> {
        self.ensure_accepting()?;

        let record = self.record.snapshot();
        if record.is_initialized() {
            self.await_tracking_history();
            if !self.initializer.check_reinitialize(&packet, &self.signals) {
                if record.state != InitializationState::Steady {
                    self.record.publish(record.steady());
                }
                return self.submit(packet);
            }
            self.reinitialize();
        }

        match self.initializer.feed(packet) {
            Ok(InitStep::Pending { buffered }) => {
                tracing::debug!("Initialization pending, {} packets buffered", buffered);
                Ok(())
            }
            Ok(InitStep::Seeded {
                mode,
                seed,
                reference_frame_id,
                packets,
            }) => {
                let epoch = self.signals.current_epoch();
                self.record.publish(InitializationRecord::seeded(
                    epoch,
                    mode,
                    reference_frame_id,
                    seed,
                ));
                self.signals.reset_tracking_failures();
                for packet in packets {
                    self.submit(packet)?;
                }
                Ok(())
            }
            Err(e) => {
                self.signals.raise_fatal("initialization", e.to_string());
                Err(e)
            }
        }
    }

    /// Parallel mode with the tracking-loss criterion on: wait until the
    /// frontend has tracked every packet submitted so far, so the criterion
    /// sees the same history as in sequential mode.
    fn await_tracking_history(&self) {
        if self.is_sequential() || self.params.initialization.max_consecutive_tracking_failures == 0 {
            return;
        }
        let submitted = self.frontend_submitted;
        let stats = &self.frontend_stats;
        self.signals.wait_until(|| stats.handled() >= submitted);
    }

    fn submit(&mut self, packet: SyncPacket) -> PipelineResult<()> {
        let input = FrontendInput {
            epoch: self.signals.current_epoch(),
            packet,
        };
        self.signals.item_enqueued();
        if self.frontend_queue.push(input).is_err() {
            self.signals.item_done();
            fatal_error(&self.signals)?;
            return Err(PipelineError::ShutDown);
        }
        self.frontend_submitted += 1;
        if self.is_sequential() {
            self.drive_sequential()?;
        }
        Ok(())
    }

    /// Run every module until no queue has work left.
    fn drive_sequential(&mut self) -> PipelineResult<usize> {
        let signals = self.signals.clone();
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for slot in &mut self.workers {
                let Some(worker) = slot.worker_mut() else {
                    continue;
                };
                loop {
                    match worker.spin_once() {
                        SpinOutcome::Idle | SpinOutcome::Closed => break,
                        SpinOutcome::Fatal => return fatal_error(&signals).map(|_| handled),
                        _ => {
                            handled += 1;
                            progressed = true;
                        }
                    }
                }
            }
            if !progressed {
                return Ok(handled);
            }
        }
    }

    /// Sequential mode: give every module one `spin_once`. Returns whether
    /// any module handled an item.
    pub fn spin_once(&mut self) -> PipelineResult<bool> {
        if !self.is_sequential() {
            return Err(PipelineError::WrongMode("parallel"));
        }
        let mut progressed = false;
        for slot in &mut self.workers {
            if let Some(worker) = slot.worker_mut() {
                match worker.spin_once() {
                    SpinOutcome::Idle | SpinOutcome::Closed => {}
                    SpinOutcome::Fatal => break,
                    _ => progressed = true,
                }
            }
        }
        fatal_error(&self.signals)?;
        Ok(progressed)
    }

    /// Sequential mode: drive all modules until quiescent. Returns the
    /// number of items handled.
    pub fn spin_sequential(&mut self) -> PipelineResult<usize> {
        if !self.is_sequential() {
            return Err(PipelineError::WrongMode("parallel"));
        }
        self.drive_sequential()
    }

    // ── Display ──

    /// Consumer handle for the display queue, for use on the display thread.
    pub fn display_handle(&self) -> DisplayHandle {
        DisplayHandle::new(self.display_queue.clone())
    }

    /// Show visualizer outputs on the calling thread.
    ///
    /// Parallel mode: blocks until the pipeline shuts down and the display
    /// queue is drained. Sequential mode: shows what is queued and returns,
    /// since this thread is also the one driving the stages.
    pub fn spin_viz(&self, display: &mut dyn Display) -> usize {
        if !self.params.use_visualizer {
            tracing::warn!("spin_viz called without a visualizer stage");
        }
        let handle = self.display_handle();
        if self.is_sequential() {
            handle.drain(display)
        } else {
            handle.spin(display)
        }
    }

    // ── Lifecycle ──

    /// Wait for all queued work to drain, then shut down.
    pub fn shutdown_when_finished(&mut self) -> PipelineResult<()> {
        if self.lifecycle == Lifecycle::ShutDown {
            return Ok(());
        }
        if self.initializer.buffered() > 0 {
            tracing::warn!(
                "Finishing with {} packets still waiting for initialization",
                self.initializer.buffered()
            );
        }
        if self.lifecycle == Lifecycle::Running {
            if self.is_sequential() {
                if let Err(e) = self.drive_sequential() {
                    self.shutdown();
                    return Err(e);
                }
            } else {
                tracing::info!("Waiting for {} in-flight items", self.signals.in_flight());
                self.signals.wait_idle();
            }
        }
        let pending = self.signals.non_empty_queues();
        if !pending.is_empty() {
            tracing::debug!("Queues with items at shutdown: {:?}", pending);
        }
        self.shutdown();
        fatal_error(&self.signals)
    }

    /// Stop every queue, join every worker and release the modules.
    /// Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if self.lifecycle == Lifecycle::ShutDown {
            tracing::debug!("Pipeline already shut down");
            return;
        }
        tracing::info!("Shutting down pipeline");
        self.signals.request_shutdown();
        self.signals.stop_queues();
        for slot in &mut self.workers {
            slot.join();
        }
        self.workers.clear();
        self.lifecycle = Lifecycle::ShutDown;
        for (name, stats) in &self.stats {
            tracing::info!("{}: {}", name, stats.snapshot());
        }
    }

    /// Drain queued work, then park every worker, keeping module state.
    pub fn pause(&mut self) -> PipelineResult<()> {
        match self.lifecycle {
            Lifecycle::ShutDown => return Err(PipelineError::ShutDown),
            Lifecycle::Paused => return Ok(()),
            Lifecycle::Running => {}
        }
        if self.is_sequential() {
            self.drive_sequential()?;
        } else {
            self.signals.wait_idle();
        }
        self.signals.set_running(false);
        for slot in &self.workers {
            slot.stop_input();
        }
        for slot in &mut self.workers {
            slot.join();
        }
        self.lifecycle = Lifecycle::Paused;
        tracing::info!("Pipeline paused");
        Ok(())
    }

    /// Reopen the queues after `pause()` and relaunch the workers.
    pub fn resume(&mut self) -> PipelineResult<()> {
        match self.lifecycle {
            Lifecycle::ShutDown => return Err(PipelineError::Terminated),
            Lifecycle::Running => return Ok(()),
            Lifecycle::Paused => {}
        }
        fatal_error(&self.signals)?;
        for slot in &self.workers {
            slot.resume_input();
        }
        self.signals.set_running(true);
        if !self.is_sequential() {
            self.launch_workers()?;
        }
        self.lifecycle = Lifecycle::Running;
        tracing::info!("Pipeline resumed");
        Ok(())
    }

    // ── Initialization ──

    /// Start a new epoch: the next packet begins a fresh initialization and
    /// nothing from the current epoch reaches a sink afterwards.
    pub fn request_reinitialization(&mut self) -> PipelineResult<()> {
        if self.lifecycle == Lifecycle::ShutDown {
            return Err(PipelineError::ShutDown);
        }
        self.reinitialize();
        Ok(())
    }

    fn reinitialize(&mut self) {
        let epoch = self.signals.advance_epoch();
        self.record.publish(InitializationRecord::uninitialized(epoch));
        self.initializer.reset();
        self.signals.reset_tracking_failures();
        tracing::info!("Re-initializing, entering epoch {}", epoch);
    }

    pub fn initialization_record(&self) -> Arc<InitializationRecord> {
        self.record.snapshot()
    }

    pub fn is_initialized(&self) -> bool {
        self.record.snapshot().is_initialized()
    }

    pub fn epoch(&self) -> u64 {
        self.signals.current_epoch()
    }

    // ── Outputs ──

    /// Observe every keyframe-rate backend output. Runs on the backend
    /// worker in parallel mode.
    pub fn register_keyframe_rate_output_callback<F>(&self, callback: F)
    where
        F: Fn(&BackendOutput) + Send + Sync + 'static,
    {
        self.backend_sinks
            .add_callback("keyframe-rate callback", move |output: &Arc<BackendOutput>| {
                callback(output.as_ref())
            });
    }

    /// Keyframe-rate outputs through a bounded channel. A subscriber that
    /// falls behind loses outputs instead of stalling the backend.
    pub fn subscribe_keyframe_rate_output(&self) -> Receiver<Arc<BackendOutput>> {
        self.backend_sinks
            .subscribe("keyframe-rate subscriber", DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Observe every pose-graph update. Fails if the pipeline has no
    /// loop-closure module; the callback is then never invoked.
    pub fn register_lcd_pgo_output_callback<F>(&self, callback: F) -> PipelineResult<()>
    where
        F: Fn(&LcdOutput) + Send + Sync + 'static,
    {
        match &self.lcd_sinks {
            Some(sinks) => {
                sinks.add_callback("pgo callback", move |output: &Arc<LcdOutput>| {
                    callback(output.as_ref())
                });
                Ok(())
            }
            None => Err(configuration_error(
                "cannot register a loop-closure callback: use_loop_closure is off",
            )),
        }
    }

    // ── Diagnostics ──

    pub fn module_stats(&self) -> Vec<(String, ModuleStatsSnapshot)> {
        self.stats
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }

    pub fn fatal(&self) -> Option<FatalReport> {
        self.signals.fatal()
    }

    /// True while any submitted item is still queued or being processed.
    pub fn is_working(&self) -> bool {
        self.signals.in_flight() > 0
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;
    use crate::pipeline::module::{StageError, StageOutput};
    use crate::pipeline::stages::{BackendEstimate, FrontendMeasurements, TrackingStatus};
    use crate::types::{FrameId, NavState, StereoImages};
    use nalgebra::Matrix6;

    struct EveryFrame;

    impl VioFrontend for EveryFrame {
        fn process(&mut self, packet: SyncPacket) -> Result<StageOutput<FrontendMeasurements>, StageError> {
            Ok(StageOutput::Payload(FrontendMeasurements {
                frame_id: packet.frame_id,
                timestamp: packet.timestamp,
                tracking: TrackingStatus::Valid,
                features: Vec::new(),
                imu: packet.imu,
            }))
        }

        fn tracking_status(&self) -> TrackingStatus {
            TrackingStatus::Valid
        }
    }

    struct Echo(BackendType);

    impl VioBackend for Echo {
        fn variant(&self) -> BackendType {
            self.0
        }

        fn initialize(&mut self, _seed: &NavState) -> Result<(), StageError> {
            Ok(())
        }

        fn process(
            &mut self,
            measurements: &FrontendMeasurements,
            record: &InitializationRecord,
        ) -> Result<StageOutput<BackendEstimate>, StageError> {
            let seed = record.seed.unwrap_or_else(|| NavState::identity(0));
            Ok(StageOutput::Payload(BackendEstimate {
                state: seed.at(measurements.timestamp),
                covariance: Matrix6::identity(),
                landmark_count: 0,
            }))
        }
    }

    fn sequential_params() -> PipelineParams {
        let mut params = PipelineParams::default();
        params.run_mode = RunMode::Sequential;
        params.initialization.mode = InitializationMode::GroundTruth;
        params
    }

    fn packet(id: u64) -> SyncPacket {
        SyncPacket::new(FrameId(id), id as i64, StereoImages::default(), Vec::new())
    }

    fn ground_truth(t: i64) -> Option<NavState> {
        Some(NavState::identity(t))
    }

    #[test]
    fn test_build_rejects_variant_mismatch() {
        let err = PipelineBuilder::new(sequential_params())
            .frontend(EveryFrame)
            .backend(Echo(BackendType::StructuralRegularities))
            .ground_truth(ground_truth)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_build_requires_enabled_stage() {
        let mut params = sequential_params();
        params.use_mesher = true;
        let err = PipelineBuilder::new(params)
            .frontend(EveryFrame)
            .backend(Echo(BackendType::Stereo))
            .ground_truth(ground_truth)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("mesher"));
    }

    #[test]
    fn test_sequential_spin_delivers_in_order() {
        let mut pipeline = PipelineBuilder::new(sequential_params())
            .frontend(EveryFrame)
            .backend(Echo(BackendType::Stereo))
            .ground_truth(ground_truth)
            .build()
            .unwrap();
        let rx = pipeline.subscribe_keyframe_rate_output();

        for id in 0..4 {
            pipeline.spin(packet(id)).unwrap();
        }
        let frames: Vec<_> = rx.try_iter().map(|o| o.frame_id).collect();
        assert_eq!(frames, (0..4).map(FrameId).collect::<Vec<_>>());
        assert_eq!(
            pipeline.initialization_record().state,
            InitializationState::Steady
        );
        assert!(!pipeline.spin_once().unwrap());
    }

    #[test]
    fn test_spin_sequential_wrong_mode_in_parallel() {
        let mut params = sequential_params();
        params.run_mode = RunMode::Parallel;
        let mut pipeline = PipelineBuilder::new(params)
            .frontend(EveryFrame)
            .backend(Echo(BackendType::Stereo))
            .ground_truth(ground_truth)
            .build()
            .unwrap();
        assert!(matches!(
            pipeline.spin_sequential(),
            Err(PipelineError::WrongMode(_))
        ));
        pipeline.shutdown();
    }

    #[test]
    fn test_spin_after_shutdown_fails() {
        let mut pipeline = PipelineBuilder::new(sequential_params())
            .frontend(EveryFrame)
            .backend(Echo(BackendType::Stereo))
            .ground_truth(ground_truth)
            .build()
            .unwrap();
        pipeline.shutdown();
        pipeline.shutdown();
        assert!(matches!(pipeline.spin(packet(0)), Err(PipelineError::ShutDown)));
        assert!(matches!(pipeline.resume(), Err(PipelineError::Terminated)));
    }
}
