//! Lifecycle flags shared between the orchestrator and the stage threads.
//!
//! Everything a stage thread reads on its hot path is an atomic: the running
//! flag, the current epoch and the in-flight counter. Locks are only taken
//! on rare transitions (fatal escalation, re-initialization, idle waits).

use crate::pipeline::queue::StopHandle;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Description of the fatal error that stopped the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalReport {
    pub stage: String,
    pub message: String,
}

/// Flags and counters visible to every stage.
pub struct PipelineSignals {
    /// Cleared on pause, shutdown, and fatal escalation.
    running: AtomicBool,
    /// Set once on terminal shutdown.
    shut_down: AtomicBool,
    /// Current initialization epoch.
    epoch: AtomicU64,
    /// Held for reading while outputs are delivered, for writing while the
    /// epoch advances.
    delivery_gate: RwLock<()>,
    /// Items pushed to a stage queue and not yet fully processed.
    in_flight: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
    /// Threads in `wait_until`; while non-zero every `item_done` wakes them.
    progress_waiters: AtomicUsize,
    consecutive_tracking_failures: AtomicU32,
    fatal: Mutex<Option<FatalReport>>,
    queues: RwLock<Vec<Arc<dyn StopHandle>>>,
}

impl PipelineSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ── Running / shutdown ──

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
        self.wake_idle_waiters();
    }

    /// Mark the pipeline as terminally shut down.
    pub fn request_shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.set_running(false);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    // ── Queues ──

    pub fn register_queue(&self, queue: Arc<dyn StopHandle>) {
        self.queues.write().push(queue);
    }

    /// Stop every registered queue, waking all blocked consumers.
    pub fn stop_queues(&self) {
        for queue in self.queues.read().iter() {
            queue.stop();
        }
    }

    /// Names of the queues that still hold items.
    pub fn non_empty_queues(&self) -> Vec<String> {
        self.queues
            .read()
            .iter()
            .filter(|q| !q.is_empty())
            .map(|q| q.queue_name().to_string())
            .collect()
    }

    // ── Epochs ──

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// True if an item tagged with `epoch` belongs to a superseded epoch.
    pub fn is_stale(&self, epoch: u64) -> bool {
        epoch < self.current_epoch()
    }

    /// Start a new epoch. Returns once no delivery of an older epoch is in
    /// progress, so nothing stale reaches a sink afterwards.
    pub fn advance_epoch(&self) -> u64 {
        let _gate = self.delivery_gate.write();
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Guard held by a stage while it checks staleness and delivers an output.
    pub fn delivery_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.delivery_gate.read_recursive()
    }

    // ── In-flight accounting ──

    pub fn item_enqueued(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// An enqueued item was fully handled (processed, skipped, or discarded).
    pub fn item_done(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "in-flight counter underflow");
        if previous == 1 || self.progress_waiters.load(Ordering::Acquire) > 0 {
            self.wake_idle_waiters();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Block until no item is in flight or the pipeline stops running.
    pub fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock();
        while self.in_flight() > 0 && self.is_running() {
            self.idle.wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    /// Block until `done()` holds or the pipeline stops running. `done` is
    /// re-checked each time an item finishes.
    pub fn wait_until(&self, done: impl Fn() -> bool) {
        self.progress_waiters.fetch_add(1, Ordering::AcqRel);
        {
            let mut guard = self.idle_lock.lock();
            while !done() && self.is_running() {
                self.idle.wait_for(&mut guard, Duration::from_millis(50));
            }
        }
        self.progress_waiters.fetch_sub(1, Ordering::AcqRel);
    }

    fn wake_idle_waiters(&self) {
        let _guard = self.idle_lock.lock();
        self.idle.notify_all();
    }

    // ── Tracking quality ──

    /// Record the tracking outcome of one frame.
    pub fn record_tracking(&self, valid: bool) {
        if valid {
            self.consecutive_tracking_failures.store(0, Ordering::Release);
        } else {
            self.consecutive_tracking_failures
                .fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn consecutive_tracking_failures(&self) -> u32 {
        self.consecutive_tracking_failures.load(Ordering::Acquire)
    }

    pub fn reset_tracking_failures(&self) {
        self.consecutive_tracking_failures.store(0, Ordering::Release);
    }

    // ── Fatal escalation ──

    /// Record a fatal error and stop the whole pipeline. Only the first
    /// report is kept.
    pub fn raise_fatal(&self, stage: &str, message: impl Into<String>) {
        let message = message.into();
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                tracing::error!("Fatal error in {}: {}", stage, message);
                *fatal = Some(FatalReport {
                    stage: stage.to_string(),
                    message,
                });
            }
        }
        self.set_running(false);
        self.stop_queues();
    }

    pub fn fatal(&self) -> Option<FatalReport> {
        self.fatal.lock().clone()
    }
}

impl Default for PipelineSignals {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            delivery_gate: RwLock::new(()),
            in_flight: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            progress_waiters: AtomicUsize::new(0),
            consecutive_tracking_failures: AtomicU32::new(0),
            fatal: Mutex::new(None),
            queues: RwLock::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::ThreadsafeQueue;
    use std::thread;

    #[test]
    fn test_epoch_advances() {
        let signals = PipelineSignals::new();
        assert_eq!(signals.current_epoch(), 0);
        assert_eq!(signals.advance_epoch(), 1);
        assert!(signals.is_stale(0));
        assert!(!signals.is_stale(1));
    }

    #[test]
    fn test_fatal_stops_queues_and_keeps_first_report() {
        let signals = PipelineSignals::new();
        let queue = Arc::new(ThreadsafeQueue::<u8>::new("q"));
        signals.register_queue(queue.clone());

        signals.raise_fatal("backend", "diverged");
        signals.raise_fatal("mesher", "second");

        assert!(!signals.is_running());
        assert!(queue.is_stopped());
        let report = signals.fatal().unwrap();
        assert_eq!(report.stage, "backend");
        assert_eq!(report.message, "diverged");
    }

    #[test]
    fn test_wait_idle_returns_when_drained() {
        let signals = PipelineSignals::new();
        signals.item_enqueued();
        let worker = {
            let signals = signals.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signals.item_done();
            })
        };
        signals.wait_idle();
        assert_eq!(signals.in_flight(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_until_wakes_on_each_item() {
        let signals = PipelineSignals::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            signals.item_enqueued();
        }
        let worker = {
            let signals = signals.clone();
            let done = done.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    thread::sleep(Duration::from_millis(10));
                    done.fetch_add(1, Ordering::SeqCst);
                    signals.item_done();
                }
            })
        };
        signals.wait_until(|| done.load(Ordering::SeqCst) >= 2);
        assert!(done.load(Ordering::SeqCst) >= 2);
        worker.join().unwrap();
    }

    #[test]
    fn test_tracking_failures_reset_on_success() {
        let signals = PipelineSignals::new();
        signals.record_tracking(false);
        signals.record_tracking(false);
        assert_eq!(signals.consecutive_tracking_failures(), 2);
        signals.record_tracking(true);
        assert_eq!(signals.consecutive_tracking_failures(), 0);
    }
}
