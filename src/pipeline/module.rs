//! Generic stage module: one input queue, one algorithm, ordered sinks.
//!
//! Every pipeline stage (frontend, backend, mesher, loop closure, visualizer)
//! is a [`StageModule`] over an adapter implementing [`StageAlgorithm`].
//! The module owns the queue/thread plumbing; the adapter only turns one
//! input into one output, a skip, or an error.
//!
//! # Epochs
//!
//! Inputs and outputs carry the initialization epoch they were produced in.
//! Items from a superseded epoch are discarded without reaching the
//! algorithm or the sinks. The first item of a newer epoch resets the
//! algorithm's stage-local history before it is processed.

use crate::pipeline::queue::{ThreadsafeQueue, TryPopError};
use crate::pipeline::signals::PipelineSignals;
use crate::pipeline::sink::SinkList;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Items that know which initialization epoch produced them.
pub trait EpochTagged {
    fn epoch(&self) -> u64;
}

impl<T: EpochTagged> EpochTagged for Arc<T> {
    fn epoch(&self) -> u64 {
        (**self).epoch()
    }
}

/// Result of one algorithm invocation that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput<T> {
    /// Forward this payload to the sinks.
    Payload(T),
    /// Nothing to forward for this input (e.g. not a keyframe).
    Skip(&'static str),
}

impl<T> StageOutput<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutput<U> {
        match self {
            StageOutput::Payload(v) => StageOutput::Payload(f(v)),
            StageOutput::Skip(reason) => StageOutput::Skip(reason),
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, StageOutput::Skip(_))
    }
}

/// Failure reported by a stage algorithm.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The current input could not be processed; the next one may be fine.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Internal state is unrecoverable.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StageError::Fatal(message.into())
    }
}

/// What a module does with a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and continue with the next input.
    #[default]
    Continue,
    /// Treat as fatal and stop the pipeline.
    Escalate,
}

/// Narrow capability interface wrapped by [`StageModule`].
pub trait StageAlgorithm: Send + 'static {
    type Input: EpochTagged + Send + 'static;
    type Output: EpochTagged + Send + 'static;

    fn name(&self) -> &str;

    fn process(&mut self, input: Self::Input) -> Result<StageOutput<Self::Output>, StageError>;

    /// Drop stage-local history tied to the previous epoch's seed.
    fn reset(&mut self) {}

    /// Seed any stochastic sub-algorithm.
    fn seed(&mut self, _seed: u64) {}
}

/// What a single `spin_once` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinOutcome {
    /// Output produced and delivered.
    Processed,
    /// The algorithm chose not to produce output.
    Skipped,
    /// Input or output belonged to a superseded epoch.
    Stale,
    /// Transient failure absorbed by the module.
    Failed,
    /// Fatal failure escalated to the pipeline.
    Fatal,
    /// Nothing queued (sequential mode only).
    Idle,
    /// Input queue stopped and drained.
    Closed,
}

/// Per-module counters, readable while the worker thread runs.
#[derive(Debug, Default)]
pub struct ModuleStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
}

impl ModuleStats {
    fn record(&self, outcome: SpinOutcome) {
        let counter = match outcome {
            SpinOutcome::Processed => &self.processed,
            SpinOutcome::Skipped => &self.skipped,
            SpinOutcome::Stale => &self.stale,
            SpinOutcome::Failed | SpinOutcome::Fatal => &self.failed,
            SpinOutcome::Idle | SpinOutcome::Closed => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Inputs popped and fully handled, whatever the outcome.
    pub fn handled(&self) -> u64 {
        self.snapshot().handled()
    }

    pub fn snapshot(&self) -> ModuleStatsSnapshot {
        ModuleStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ModuleStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleStatsSnapshot {
    pub processed: u64,
    pub skipped: u64,
    pub stale: u64,
    pub failed: u64,
}

impl ModuleStatsSnapshot {
    pub fn handled(&self) -> u64 {
        self.processed + self.skipped + self.stale + self.failed
    }
}

impl fmt::Display for ModuleStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} skipped={} stale={} failed={}",
            self.processed, self.skipped, self.stale, self.failed
        )
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Queue/thread plumbing around one stage algorithm.
pub struct StageModule<A: StageAlgorithm> {
    algorithm: A,
    input: Arc<ThreadsafeQueue<A::Input>>,
    sinks: SinkList<A::Output>,
    signals: Arc<PipelineSignals>,
    policy: FailurePolicy,
    /// Blocking pops when true (own worker thread), non-blocking otherwise.
    parallel: bool,
    /// Epoch of the most recent input this module processed.
    epoch: u64,
    working: Arc<AtomicBool>,
    stats: Arc<ModuleStats>,
}

impl<A: StageAlgorithm> StageModule<A> {
    pub fn new(
        algorithm: A,
        input: Arc<ThreadsafeQueue<A::Input>>,
        signals: Arc<PipelineSignals>,
        parallel: bool,
    ) -> Self {
        let epoch = signals.current_epoch();
        Self {
            algorithm,
            input,
            sinks: SinkList::new(),
            signals,
            policy: FailurePolicy::default(),
            parallel,
            epoch,
            working: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ModuleStats::default()),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        self.algorithm.name()
    }

    /// Shared handle to this module's output sinks.
    pub fn sinks(&self) -> SinkList<A::Output> {
        self.sinks.clone()
    }

    pub fn input_queue(&self) -> &Arc<ThreadsafeQueue<A::Input>> {
        &self.input
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<ModuleStats> {
        self.stats.clone()
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    /// Pop one input and handle it. A panic in the algorithm or a sink is
    /// escalated as a fatal error of this stage.
    pub fn spin_once(&mut self) -> SpinOutcome {
        let input = if self.parallel {
            match self.input.pop_blocking() {
                Some(input) => input,
                None => return SpinOutcome::Closed,
            }
        } else {
            match self.input.pop_non_blocking() {
                Ok(input) => input,
                Err(TryPopError::Empty) => return SpinOutcome::Idle,
                Err(TryPopError::Closed) => return SpinOutcome::Closed,
            }
        };

        self.working.store(true, Ordering::Release);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.handle(input))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let stage = self.name().to_string();
                self.signals
                    .raise_fatal(&stage, format!("panicked: {}", panic_message(&*payload)));
                SpinOutcome::Fatal
            }
        };
        self.working.store(false, Ordering::Release);
        self.stats.record(outcome);
        self.signals.item_done();
        outcome
    }

    /// Run until the queue closes, the pipeline stops, or a fatal error.
    pub fn spin(&mut self) {
        tracing::info!("Module {} spinning", self.name());
        while self.signals.is_running() {
            match self.spin_once() {
                SpinOutcome::Closed | SpinOutcome::Fatal => break,
                _ => {}
            }
        }
        tracing::info!(
            "Module {} stopped ({})",
            self.name(),
            self.stats.snapshot()
        );
    }

    fn handle(&mut self, input: A::Input) -> SpinOutcome {
        let epoch = input.epoch();
        if self.signals.is_stale(epoch) {
            tracing::debug!(
                "{}: discarding input from stale epoch {} (current {})",
                self.name(),
                epoch,
                self.signals.current_epoch()
            );
            return SpinOutcome::Stale;
        }
        if epoch > self.epoch {
            tracing::debug!("{}: entering epoch {}, resetting", self.name(), epoch);
            self.algorithm.reset();
            self.epoch = epoch;
        }

        match self.algorithm.process(input) {
            Ok(StageOutput::Payload(output)) => self.deliver(output),
            Ok(StageOutput::Skip(reason)) => {
                tracing::trace!("{}: skipped input ({})", self.name(), reason);
                SpinOutcome::Skipped
            }
            Err(StageError::Transient(message)) if self.policy == FailurePolicy::Continue => {
                tracing::warn!("{}: {}", self.name(), message);
                SpinOutcome::Failed
            }
            Err(err) => {
                let message = match err {
                    StageError::Transient(m) | StageError::Fatal(m) => m,
                };
                let stage = self.name().to_string();
                self.signals.raise_fatal(&stage, message);
                SpinOutcome::Fatal
            }
        }
    }

    fn deliver(&self, output: A::Output) -> SpinOutcome {
        let _guard = self.signals.delivery_guard();
        if self.signals.is_stale(output.epoch()) {
            tracing::debug!(
                "{}: dropping output of stale epoch {}",
                self.name(),
                output.epoch()
            );
            return SpinOutcome::Stale;
        }
        self.sinks.dispatch(&output);
        SpinOutcome::Processed
    }
}
