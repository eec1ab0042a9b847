//! Worker pool for backup deliveries

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce(&JobContext) + Send + 'static>;

/// Why a job was not accepted
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("backup queue is full ({capacity} pending jobs)")]
    Full { capacity: usize },

    #[error("backup pool is shut down")]
    Closed,
}

/// Counters since the pool started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// Jobs accepted by [`BackupPool::submit`]
    pub submitted: u64,
    /// Jobs refused because the queue was full or the pool closed
    pub dropped: u64,
    /// Backup deliveries that succeeded
    pub delivered: u64,
    /// Backup deliveries that failed
    pub failed: u64,
    /// Backup deliveries skipped because of shutdown
    pub cancelled: u64,
}

/// Result of [`BackupPool::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every job finished before the deadline
    pub drained: bool,
    /// Jobs that ran to completion since the pool started
    pub completed: u64,
    /// Jobs still queued or running when the deadline passed
    pub abandoned: usize,
    pub stats: BackupStats,
}

/// What a running job can see of the pool
pub struct JobContext {
    shared: Arc<Shared>,
}

impl JobContext {
    /// Set once shutdown gave up waiting; jobs should stop before their next
    /// delivery
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn record_delivered(&self) {
        self.shared.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.shared.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.shared.cancelled_deliveries.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Shared {
    /// Jobs queued or running
    in_flight: Mutex<usize>,
    idle: Condvar,
    cancelled: AtomicBool,
    completed: AtomicU64,
    submitted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    cancelled_deliveries: AtomicU64,
}

impl Shared {
    fn start_job(&self) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn finish_job(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn in_flight(&self) -> usize {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> BackupStats {
        BackupStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Fixed set of worker threads fed by a bounded queue.
///
/// Every accepted job is tracked until it returns, so shutdown can wait for
/// outstanding backup deliveries instead of losing them silently.
pub struct BackupPool {
    queue: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
    capacity: usize,
}

impl BackupPool {
    /// Start `workers` threads sharing a queue of `capacity` jobs
    pub fn new(workers: usize, capacity: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let shared = Arc::new(Shared::default());

        let handles = (0..workers)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("backup-{id}"))
                    .spawn(move || worker_loop(id, &receiver, shared))
            })
            .collect::<io::Result<Vec<_>>>()?;

        debug!(workers, capacity, "Backup pool started");

        Ok(Self {
            queue: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            shared,
            capacity,
        })
    }

    /// Queue a job without blocking
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce(&JobContext) + Send + 'static,
    {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = queue.as_ref() else {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Closed);
        };

        // Counted before sending so a fast worker cannot finish it first
        self.shared.start_job();
        match sender.try_send(Box::new(job)) {
            Ok(()) => {
                self.shared.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.finish_job();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                match e {
                    TrySendError::Full(_) => Err(PoolError::Full {
                        capacity: self.capacity,
                    }),
                    TrySendError::Disconnected(_) => Err(PoolError::Closed),
                }
            }
        }
    }

    /// Jobs queued or running right now
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    pub fn stats(&self) -> BackupStats {
        self.shared.stats()
    }

    /// Block until no job is queued or running, or `timeout` passes.
    ///
    /// Returns whether the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let in_flight = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (in_flight, _) = self
            .shared
            .idle
            .wait_timeout_while(in_flight, timeout, |n| *n > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *in_flight == 0
    }

    /// Stop accepting jobs and wait up to `grace` for the outstanding ones.
    ///
    /// Jobs still pending at the deadline are cancelled: queued ones skip
    /// their deliveries and running ones stop before the next one. A
    /// delivery already in progress is not interrupted.
    pub fn shutdown(&self, grace: Duration) -> ShutdownReport {
        // Dropping the sender lets workers exit once the queue is empty
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());

        let pending = self.in_flight();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "Waiting for backup deliveries");
        }

        let drained = self.wait_idle(grace);
        let abandoned = if drained {
            let handles = std::mem::take(
                &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
            );
            for handle in handles {
                if handle.join().is_err() {
                    error!("Backup worker panicked");
                }
            }
            0
        } else {
            self.shared.cancelled.store(true, Ordering::SeqCst);
            let abandoned = self.in_flight();
            warn!(abandoned, "Backup deliveries still pending at shutdown deadline");
            abandoned
        };

        ShutdownReport {
            drained,
            completed: self.shared.completed.load(Ordering::Relaxed),
            abandoned,
            stats: self.stats(),
        }
    }
}

fn worker_loop(id: usize, receiver: &Mutex<Receiver<Job>>, shared: Arc<Shared>) {
    let context = JobContext {
        shared: Arc::clone(&shared),
    };

    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };

        let Ok(job) = job else {
            break; // Pool shut down and queue empty
        };

        if panic::catch_unwind(AssertUnwindSafe(|| job(&context))).is_err() {
            error!(worker = id, "Backup job panicked");
        } else {
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        shared.finish_job();
    }

    debug!(worker = id, "Backup worker stopped");
}
