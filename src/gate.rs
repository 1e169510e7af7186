//! Concurrency gate: a fixed pool of session workers behind a FIFO queue.
//!
//! Engine sessions are blocking and the engine itself is not safe for
//! concurrent documents, so sessions never run on the async runtime. The gate
//! owns exactly `N` OS threads that pull jobs from one shared queue; callers
//! `submit` a request and await a oneshot reply.
//!
//! ```text
//! submit ──▶ [ unbounded FIFO ] ──▶ worker 0 ─┐
//!                                ──▶ worker 1 ─┼──▶ SessionExecutor::execute
//!                                ──▶ …        ─┘
//! ```
//!
//! At most `N` sessions execute at any instant. With `N = 1` requests run in
//! submission order.
//!
//! There is no cancellation: a caller that stops awaiting its reply does not
//! stop the session. The result is dropped when the reply cannot be
//! delivered, which also drops any file-backed output and unlinks its file.

use crate::error::GatewayError;
use crate::output::RenderedOutput;
use crate::request::ConversionRequest;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Runs one conversion session to completion on the calling thread.
pub trait SessionExecutor: Send + Sync + 'static {
    fn execute(&self, request: ConversionRequest) -> Result<RenderedOutput, GatewayError>;
}

type Reply = oneshot::Sender<Result<RenderedOutput, GatewayError>>;

struct Job {
    request: ConversionRequest,
    reply: Reply,
    queued_at: Instant,
}

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    active: AtomicUsize,
}

/// Admits conversion work at a fixed concurrency ceiling.
pub struct ConversionGate {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    counters: Arc<Counters>,
    concurrency: usize,
    max_queue: Option<usize>,
}

impl ConversionGate {
    /// Start `concurrency` worker threads. `max_queue` of `None` keeps the
    /// queue unbounded.
    pub fn new(
        concurrency: usize,
        max_queue: Option<usize>,
        executor: Arc<dyn SessionExecutor>,
    ) -> Result<Self, GatewayError> {
        if concurrency == 0 {
            return Err(GatewayError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            let receiver = Arc::clone(&receiver);
            let executor = Arc::clone(&executor);
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("docbridge-session-{id}"))
                .spawn(move || worker_loop(id, receiver, executor, counters))
                .map_err(|e| {
                    GatewayError::Internal(format!("cannot spawn session worker {id}: {e}"))
                })?;
            workers.push(handle);
        }
        info!(
            "Conversion gate started: {} worker(s), queue {}",
            concurrency,
            max_queue.map_or_else(|| "unbounded".to_string(), |n| format!("≤ {n}"))
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
            concurrency,
            max_queue,
        })
    }

    /// Queue a request and wait for its session to finish.
    pub async fn submit(
        &self,
        request: ConversionRequest,
    ) -> Result<RenderedOutput, GatewayError> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(GatewayError::ShuttingDown)?;

        self.admit()?;
        let (reply, outcome) = oneshot::channel();
        let job = Job {
            request,
            reply,
            queued_at: Instant::now(),
        };
        if sender.send(job).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(GatewayError::ShuttingDown);
        }

        outcome
            .await
            .map_err(|_| GatewayError::Internal("session worker dropped the request".into()))?
    }

    /// Reserve a queue slot, honouring the optional limit.
    fn admit(&self) -> Result<(), GatewayError> {
        match self.max_queue {
            None => {
                self.counters.queued.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(limit) => self
                .counters
                .queued
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map(drop)
                .map_err(|depth| {
                    warn!("Rejecting request: {depth} already queued");
                    GatewayError::QueueFull { depth }
                }),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Requests waiting for a worker.
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Acquire)
    }

    /// Sessions currently executing.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::Acquire)
    }

    /// Stop admitting requests, let queued ones finish, and join the workers.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut guard| guard.take());
        drop(sender);

        let workers = self
            .workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        if workers.is_empty() {
            return;
        }
        debug!("Waiting for {} session worker(s)", workers.len());
        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    error!("Session worker panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            error!("Failed to join session workers: {e}");
        }
        info!("Conversion gate stopped");
    }
}

fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    executor: Arc<dyn SessionExecutor>,
    counters: Arc<Counters>,
) {
    debug!("Session worker {id} started");
    loop {
        // Only one idle worker waits on the channel at a time, which keeps
        // hand-out strictly FIFO.
        let job = match receiver.lock() {
            Ok(mut rx) => rx.blocking_recv(),
            Err(_) => break,
        };
        let Some(job) = job else { break };

        counters.queued.fetch_sub(1, Ordering::AcqRel);
        counters.active.fetch_add(1, Ordering::AcqRel);
        debug!(
            "Worker {id} took request after {}ms in queue",
            job.queued_at.elapsed().as_millis()
        );

        let request = job.request;
        let result = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(request)))
            .unwrap_or_else(|_| {
                error!("Session panicked on worker {id}");
                Err(GatewayError::Internal("conversion session panicked".into()))
            });
        counters.active.fetch_sub(1, Ordering::AcqRel);

        if job.reply.send(result).is_err() {
            debug!("Worker {id}: caller went away, discarding result");
        }
    }
    debug!("Session worker {id} stopped");
}
