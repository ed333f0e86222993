// Streaming ingestion processor
//
// Bounded producer/consumer engine. Producers block in `enqueue` when the
// queue is full; a fixed set of named worker threads pull items and run the
// handler. One failing item never stops the others: failures are counted
// and published as events.

pub mod events;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::common::CancelToken;
use crate::error::{CapflowError, Result};

pub use events::{IngestEvent, ProcessingStats, ProcessorState};

/// Default bounded queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Processor construction options
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Queue bound; `None` for an unbounded queue
    pub queue_capacity: Option<usize>,
    /// Workers spawned by `start` when the caller passes `None` (0 = CPU count)
    pub worker_count: usize,
    /// Upper bound on how long `dispose` waits for workers
    pub dispose_timeout: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            worker_count: 0,
            dispose_timeout: Duration::from_secs(5),
        }
    }
}

impl ProcessorOptions {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == Some(0) {
            return Err(CapflowError::config("queue capacity must be greater than zero"));
        }
        Ok(())
    }

    fn resolved_workers(&self, requested: Option<usize>) -> usize {
        match requested.unwrap_or(self.worker_count) {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }
}

/// State shared between the processor handle and its workers
struct Shared {
    state: AtomicU8,
    enqueued: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    sequence: AtomicU64,
    active_workers: AtomicUsize,
    started_at: Mutex<Option<Instant>>,
    subscribers: RwLock<Vec<Sender<IngestEvent>>>,
}

impl Shared {
    fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move Processing -> Draining; other states are left alone
    fn begin_draining(&self) {
        let _ = self.state.compare_exchange(
            ProcessorState::Processing as u8,
            ProcessorState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn publish(&self, event: IngestEvent) {
        let subscribers = self.subscribers.read();
        for tx in subscribers.iter() {
            // A dropped subscriber is not an error
            let _ = tx.send(event.clone());
        }
    }
}

/// Bounded producer/consumer processor for items of type `T`
pub struct StreamProcessor<T: Send + 'static> {
    sender: Mutex<Option<Sender<(u64, T)>>>,
    receiver: Receiver<(u64, T)>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    cancel: CancelToken,
    disposed: AtomicBool,
    options: ProcessorOptions,
}

impl<T: Send + 'static> StreamProcessor<T> {
    pub fn new(options: ProcessorOptions) -> Result<Self> {
        options.validate()?;
        let (sender, receiver) = match options.queue_capacity {
            Some(capacity) => channel::bounded(capacity),
            None => channel::unbounded(),
        };
        let (done_tx, done_rx) = channel::bounded(0);

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ProcessorState::Idle as u8),
                enqueued: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                active_workers: AtomicUsize::new(0),
                started_at: Mutex::new(None),
                subscribers: RwLock::new(Vec::new()),
            }),
            workers: Mutex::new(Vec::new()),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            cancel: CancelToken::new(),
            disposed: AtomicBool::new(false),
            options,
        })
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state()
    }

    /// Items currently waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.receiver.len()
    }

    /// The processor's own cancellation token
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Register for notifications. Events are buffered until read, so a
    /// subscriber that never reads grows without bound.
    pub fn subscribe(&self) -> Receiver<IngestEvent> {
        let (tx, rx) = channel::unbounded();
        self.shared.subscribers.write().push(tx);
        rx
    }

    /// Spawn the workers. `worker_count` overrides the configured count.
    pub fn start<F>(&self, handler: F, worker_count: Option<usize>) -> Result<()>
    where
        F: Fn(T) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        if let Err(current) = self.shared.state.compare_exchange(
            ProcessorState::Idle as u8,
            ProcessorState::Processing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return match ProcessorState::from_u8(current) {
                ProcessorState::Stopped => Err(CapflowError::Closed("processor has stopped".to_string())),
                _ => Err(CapflowError::AlreadyStarted),
            };
        }
        // complete_adding may have run before start
        if self.sender.lock().is_none() {
            self.shared.begin_draining();
        }

        let count = self.options.resolved_workers(worker_count);
        let handler = Arc::new(handler);
        let done_tx = self.done_tx.lock().take();
        *self.shared.started_at.lock() = Some(Instant::now());
        self.shared.active_workers.store(count, Ordering::SeqCst);

        let mut workers = self.workers.lock();
        for id in 0..count {
            let worker = Worker {
                id,
                receiver: self.receiver.clone(),
                cancel: self.cancel.clone(),
                shared: Arc::clone(&self.shared),
                handler: Arc::clone(&handler),
                _done: done_tx.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("capflow-ingest-{}", id))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Workers already running see the cancel and exit
                    warn!(error = %e, worker = id, "Failed to spawn ingest worker");
                    self.shared.active_workers.fetch_sub(count - id, Ordering::SeqCst);
                    self.cancel();
                    return Err(CapflowError::Io(e));
                }
            }
        }

        info!(workers = count, capacity = ?self.options.queue_capacity, "Stream processor started");
        Ok(())
    }

    /// Enqueue one item, blocking while the queue is full
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.send(item, None)
    }

    /// Enqueue one item; the wait for queue space also ends on `cancel`
    pub fn enqueue_with(&self, item: T, cancel: &CancelToken) -> Result<()> {
        self.send(item, Some(cancel))
    }

    /// Enqueue items in order, stopping at the first failure.
    /// Returns how many were accepted.
    pub fn enqueue_batch<I>(&self, items: I, cancel: &CancelToken) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
    {
        let mut accepted = 0;
        for item in items {
            self.send(item, Some(cancel))?;
            accepted += 1;
        }
        Ok(accepted)
    }

    fn send(&self, item: T, cancel: Option<&CancelToken>) -> Result<()> {
        // cancel() also drops the sender, so check the tokens first
        if self.cancel.is_cancelled() || cancel.map_or(false, CancelToken::is_cancelled) {
            return Err(CapflowError::Cancelled);
        }
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| CapflowError::Closed("processor no longer accepts items".to_string()))?;

        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let message = (sequence, item);
        let outcome = match cancel {
            Some(caller) => select! {
                send(sender, message) -> res => res.map_err(|_| ()),
                recv(self.cancel.as_receiver()) -> _ => return Err(CapflowError::Cancelled),
                recv(caller.as_receiver()) -> _ => return Err(CapflowError::Cancelled),
            },
            None => select! {
                send(sender, message) -> res => res.map_err(|_| ()),
                recv(self.cancel.as_receiver()) -> _ => return Err(CapflowError::Cancelled),
            },
        };
        outcome.map_err(|_| CapflowError::Closed("queue disconnected".to_string()))?;

        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Signal that no further items will be enqueued
    pub fn complete_adding(&self) {
        if self.sender.lock().take().is_some() {
            debug!(queued = self.receiver.len(), "Stream processor input completed");
        }
        self.shared.begin_draining();
    }

    /// Block until the queue drains and every worker has returned.
    ///
    /// Call [`complete_adding`](Self::complete_adding) first, otherwise the
    /// workers keep waiting for input. Returns `Err(Cancelled)` if the
    /// processor was cancelled.
    pub fn wait_for_completion(&self) -> Result<()> {
        if self.state() == ProcessorState::Idle {
            return Err(CapflowError::config("processor was never started"));
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Ingest worker terminated abnormally");
            }
        }
        if self.cancel.is_cancelled() {
            Err(CapflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cooperative shutdown: in-flight handlers finish, nothing new is dequeued
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.sender.lock().take();
        self.shared.begin_draining();
    }

    /// Cancel, close the queue and wait (bounded) for workers to exit.
    /// Never fails; a timeout is logged and the workers are left detached.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel();
        self.done_tx.lock().take();

        let deadline = Instant::now() + self.options.dispose_timeout;
        loop {
            match self.done_rx.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout_ms = self.options.dispose_timeout.as_millis() as u64,
                        "Timed out waiting for ingest workers during dispose"
                    );
                    self.workers.lock().clear();
                    return;
                }
            }
        }

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        self.shared.set_state(ProcessorState::Stopped);
        debug!("Stream processor disposed");
    }

    pub fn stats(&self) -> ProcessingStats {
        let elapsed_ms = self
            .shared
            .started_at
            .lock()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        ProcessingStats::derive(
            self.shared.enqueued.load(Ordering::Relaxed),
            self.shared.processed.load(Ordering::Relaxed),
            self.shared.errors.load(Ordering::Relaxed),
            elapsed_ms,
        )
    }

    pub fn reset_stats(&self) {
        self.shared.enqueued.store(0, Ordering::Relaxed);
        self.shared.processed.store(0, Ordering::Relaxed);
        self.shared.errors.store(0, Ordering::Relaxed);
        let mut started = self.shared.started_at.lock();
        if started.is_some() {
            *started = Some(Instant::now());
        }
    }
}

impl<T: Send + 'static> Drop for StreamProcessor<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct Worker<T, F> {
    id: usize,
    receiver: Receiver<(u64, T)>,
    cancel: CancelToken,
    shared: Arc<Shared>,
    handler: Arc<F>,
    /// Dropped on exit; `dispose` waits for every clone to go
    _done: Option<Sender<()>>,
}

impl<T, F> Worker<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    fn run(self) {
        trace!(worker = self.id, "Ingest worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = select! {
                recv(self.receiver) -> msg => msg.ok(),
                recv(self.cancel.as_receiver()) -> _ => None,
            };
            let Some((sequence, item)) = next else {
                break;
            };
            if self.cancel.is_cancelled() {
                break;
            }
            self.handle(sequence, item);
        }

        if self.shared.active_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.set_state(ProcessorState::Stopped);
            let processed = self.shared.processed.load(Ordering::SeqCst);
            let errors = self.shared.errors.load(Ordering::SeqCst);
            info!(processed, errors, "Stream processor completed");
            self.shared.publish(IngestEvent::Completed { processed, errors });
        }
        trace!(worker = self.id, "Ingest worker exiting");
    }

    fn handle(&self, sequence: u64, item: T) {
        let handler = &self.handler;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(item)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(message)) => Some(message),
            Err(payload) => Some(panic_message(payload)),
        };
        match failure {
            None => {
                self.shared.processed.fetch_add(1, Ordering::Relaxed);
                self.shared.publish(IngestEvent::Processed { sequence });
            }
            Some(message) => {
                debug!(worker = self.id, sequence, error = %message, "Ingest handler failed");
                self.shared.errors.fetch_add(1, Ordering::Relaxed);
                self.shared.publish(IngestEvent::Error { sequence, message });
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
