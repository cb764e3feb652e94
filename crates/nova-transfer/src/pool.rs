use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as channel;
use parking_lot::RwLock;

use crate::WorkerPoolConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How a job submitted to [`WorkerPool::execute`] was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A new worker thread was started for the job.
    Spawned,
    /// The job is waiting in the backlog queue.
    Queued,
    /// Threads and backlog were saturated (or no thread could be started); the job already ran
    /// on the submitting thread.
    Inline,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool has been shut down")]
    Shutdown,
}

/// Bounded pool of pull workers.
///
/// At most `max_threads` workers run jobs concurrently and at most `queue_capacity` jobs wait for
/// a worker. When both limits are reached `execute` runs the job on the caller's thread instead
/// of rejecting it, which pushes back on whoever is submitting. Workers are started on demand and
/// exit after sitting idle for `keep_alive`.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    max_threads: usize,
    keep_alive: Duration,
    tx: RwLock<Option<channel::Sender<Job>>>,
    rx: channel::Receiver<Job>,
    threads: AtomicUsize,
    /// Workers blocked waiting for a queued job.
    idle: AtomicUsize,
    shutdown: AtomicBool,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: &WorkerPoolConfig) -> Self {
        let (tx, rx) = channel::bounded(config.queue_capacity);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_threads: config.max_threads.max(1),
                keep_alive: config.keep_alive(),
                tx: RwLock::new(Some(tx)),
                rx,
                threads: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn execute<F>(&self, job: F) -> Result<Submission, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        let mut job: Job = Box::new(job);

        {
            // Holding the read lock keeps `shutdown_now` from closing the queue under us.
            let tx = inner.tx.read();
            let Some(tx) = tx.as_ref() else {
                return Err(PoolError::Shutdown);
            };

            // An idle worker picks the job up; otherwise grow the pool before queueing.
            if inner.idle.load(Ordering::Acquire) == 0 {
                match PoolInner::spawn_worker(inner, Some(job)) {
                    Ok(()) => return Ok(Submission::Spawned),
                    Err(returned) => job = returned,
                }
            }

            match tx.try_send(job) {
                Ok(()) => {
                    // Every worker may have timed out between the check and the send.
                    if inner.threads.load(Ordering::Acquire) > 0 {
                        return Ok(Submission::Queued);
                    }
                    let _ = PoolInner::spawn_worker(inner, None);
                    if inner.threads.load(Ordering::Acquire) > 0 {
                        return Ok(Submission::Queued);
                    }
                    // No thread could be started; take a job back so the queue cannot strand.
                    match inner.rx.try_recv() {
                        Ok(returned) => job = returned,
                        Err(_) => return Ok(Submission::Queued),
                    }
                }
                Err(channel::TrySendError::Full(returned))
                | Err(channel::TrySendError::Disconnected(returned)) => job = returned,
            }
        }

        if inner.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        tracing::debug!(
            target: "nova.transfer",
            pool = %inner.name,
            "worker pool saturated; running job on the submitting thread"
        );
        run_job(&inner.name, job);
        Ok(Submission::Inline)
    }

    /// Stop accepting work and discard queued jobs, returning how many were dropped.
    ///
    /// Jobs that are already running are left to finish; they are expected to notice
    /// cancellation through their own means.
    pub fn shutdown_now(&self) -> usize {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::Release);
        drop(inner.tx.write().take());

        let discarded = inner.rx.try_iter().count();
        if discarded > 0 {
            tracing::debug!(
                target: "nova.transfer",
                pool = %inner.name,
                discarded,
                "discarded queued jobs on shutdown"
            );
        }
        discarded
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Number of live worker threads.
    pub fn active_threads(&self) -> usize {
        self.inner.threads.load(Ordering::Acquire)
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.rx.len()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("max_threads", &self.inner.max_threads)
            .field("active_threads", &self.active_threads())
            .field("queued", &self.queued())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl PoolInner {
    fn try_reserve_thread(&self) -> bool {
        let mut current = self.threads.load(Ordering::Acquire);
        loop {
            if current >= self.max_threads || self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            match self.threads.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Start a worker, optionally seeded with its first job. Hands the job back when no thread
    /// could be started.
    fn spawn_worker(inner: &Arc<PoolInner>, first: Option<Job>) -> Result<(), Job> {
        if !inner.try_reserve_thread() {
            return match first {
                Some(job) => Err(job),
                None => Ok(()),
            };
        }

        let idx = inner.threads.load(Ordering::Relaxed);
        let worker_inner = Arc::clone(inner);
        // The job travels through a slot so it can be recovered if the OS refuses the thread.
        let slot = Arc::new(parking_lot::Mutex::new(first));
        let worker_slot = Arc::clone(&slot);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{idx}", inner.name))
            .spawn(move || {
                let first = worker_slot.lock().take();
                worker_inner.worker_loop(first);
            });

        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                // Thread creation can fail in constrained environments (low RLIMIT_NPROC,
                // `EAGAIN`). Degrade to running on the caller.
                inner.threads.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(
                    target: "nova.transfer",
                    pool = %inner.name,
                    error = %err,
                    "failed to spawn pull worker"
                );
                match slot.lock().take() {
                    Some(job) => Err(job),
                    None => Ok(()),
                }
            }
        }
    }

    fn worker_loop(self: Arc<Self>, first: Option<Job>) {
        if let Some(job) = first {
            run_job(&self.name, job);
        }

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.idle.fetch_add(1, Ordering::AcqRel);
            let received = self.rx.recv_timeout(self.keep_alive);
            self.idle.fetch_sub(1, Ordering::AcqRel);
            match received {
                Ok(job) => run_job(&self.name, job),
                Err(channel::RecvTimeoutError::Timeout) => {
                    self.threads.fetch_sub(1, Ordering::AcqRel);
                    // A job may have been queued while we were deciding to exit.
                    if !self.rx.is_empty() && self.try_reserve_thread() {
                        continue;
                    }
                    return;
                }
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        self.threads.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_job(pool: &str, job: Job) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        tracing::error!(
            target: "nova.transfer",
            pool,
            panic = %panic_payload_to_str(&*panic),
            "pool job panicked"
        );
    }
}

pub(crate) fn panic_payload_to_str(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
