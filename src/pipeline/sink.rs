//! Output fan-out for stage modules.
//!
//! A stage's output goes to every registered sink in registration order.
//! Sinks are either downstream queues (the output is mapped to the next
//! stage's input type and pushed) or observer callbacks.
//!
//! # Threading
//!
//! In parallel mode sinks run on the producing stage's worker thread.
//! A callback touching state that another thread also touches must do its
//! own synchronization. Callbacks must not register further sinks on the
//! list that is invoking them.

use crate::pipeline::queue::ThreadsafeQueue;
use crate::pipeline::signals::PipelineSignals;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Observer invoked synchronously with each output.
pub type OutputCallback<T> = Box<dyn Fn(&T) + Send + Sync>;

enum SinkKind<T> {
    /// Maps and pushes into a queue; returns false if the push was rejected.
    Queue(Box<dyn Fn(&T) -> bool + Send + Sync>),
    Callback(OutputCallback<T>),
}

struct Sink<T> {
    name: String,
    kind: SinkKind<T>,
}

/// Shared, ordered list of sinks for one stage's output.
///
/// Cloning shares the list, so sinks registered through the pipeline after
/// a worker thread has started are seen by that worker.
pub struct SinkList<T> {
    sinks: Arc<RwLock<Vec<Sink<T>>>>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for SinkList<T> {
    fn clone(&self) -> Self {
        Self {
            sinks: self.sinks.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> Default for SinkList<T> {
    fn default() -> Self {
        Self {
            sinks: Arc::new(RwLock::new(Vec::new())),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T: 'static> SinkList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a downstream stage queue. Pushes are counted as in-flight work
    /// so the orchestrator can tell when the pipeline has drained.
    ///
    /// `map` returning `None` means this output is not meant for that stage.
    pub fn connect_stage_queue<U, F>(
        &self,
        queue: Arc<ThreadsafeQueue<U>>,
        signals: Arc<PipelineSignals>,
        map: F,
    ) where
        U: Send + 'static,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        let name = queue.name().to_string();
        let push = move |output: &T| -> bool {
            let Some(item) = map(output) else {
                return true;
            };
            signals.item_enqueued();
            match queue.push(item) {
                Ok(()) => true,
                Err(_) => {
                    signals.item_done();
                    false
                }
            }
        };
        self.push_sink(name, SinkKind::Queue(Box::new(push)));
    }

    /// Connect a queue drained outside the stage graph (e.g. the display queue).
    pub fn connect_output_queue<U, F>(&self, queue: Arc<ThreadsafeQueue<U>>, map: F)
    where
        U: Send + 'static,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        let name = queue.name().to_string();
        let push = move |output: &T| -> bool {
            match map(output) {
                Some(item) => queue.push(item).is_ok(),
                None => true,
            }
        };
        self.push_sink(name, SinkKind::Queue(Box::new(push)));
    }

    /// Register an observer callback.
    pub fn add_callback<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.push_sink(name.into(), SinkKind::Callback(Box::new(callback)));
    }

    /// Register a channel subscriber. Outputs are cloned into a bounded
    /// channel; when the subscriber falls behind, outputs are dropped and
    /// counted rather than blocking the producing stage.
    pub fn subscribe(&self, name: impl Into<String>, capacity: usize) -> Receiver<T>
    where
        T: Clone + Send,
    {
        let (tx, rx) = bounded(capacity.max(1));
        let dropped = self.dropped.clone();
        self.add_callback(name, move |output: &T| {
            if tx.try_send(output.clone()).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        });
        rx
    }

    fn push_sink(&self, name: String, kind: SinkKind<T>) {
        tracing::debug!("Registered sink '{}'", name);
        self.sinks.write().push(Sink { name, kind });
    }

    /// Deliver `output` to every sink in registration order.
    pub fn dispatch(&self, output: &T) {
        for sink in self.sinks.read().iter() {
            match &sink.kind {
                SinkKind::Queue(push) => {
                    if !push(output) {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Queue '{}' is closed, dropping output", sink.name);
                    }
                }
                SinkKind::Callback(callback) => callback(output),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    /// Outputs rejected by a closed queue or a full subscriber channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
