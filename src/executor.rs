//! In-memory millisecond scheduler.
//!
//! Accepts jobs up to `grace` ahead of their trigger time and delivers each
//! due job exactly once onto the outbound dispatch channel. A single tick
//! worker owns the dispatch side; everyone else (coordinator writes, the
//! minute poll, deletes) mutates the shared state under the mutex.
//!
//! Exactly-once within a leader is enforced by two pieces of state:
//! - a `version` counter per job id — queue entries snapshot the version at
//!   insert time and only the entry matching the live version may fire;
//! - a `deleted` tombstone — set by `delete` or by an update that moved the
//!   job beyond the grace horizon, checked before every dispatch.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::job::{current_millis, Job};
use crate::metrics::{DISPATCH_LAG_MS, EXECUTOR_QUEUE_DEPTH, JOBS_DISPATCHED_TOTAL};

#[derive(Error, Debug, PartialEq)]
pub enum ExecutorError {
    #[error("job trigger time is already in the past")]
    TooLate,

    #[error("job trigger time is beyond the grace period")]
    NotWithinGracePeriod,

    #[error("executor is closed")]
    ExecutorClosed,

    #[error("job not found")]
    JobNotFound,
}

struct JobEntry {
    job: Job,
    version: u64,
    deleted: bool,
}

/// Snapshot of a job at queue time, ordered by trigger time.
struct QueueItem {
    trigger_ms: i64,
    id: String,
    version: u64,
    job: Job,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.trigger_ms == other.trigger_ms && self.id == other.id && self.version == other.version
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.trigger_ms
            .cmp(&other.trigger_ms)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.version.cmp(&other.version))
    }
}

struct Inner {
    jobs: HashMap<String, JobEntry>,
    queue: BinaryHeap<Reverse<QueueItem>>,
    closed: bool,
}

impl Inner {
    fn push(&mut self, item: QueueItem) {
        self.queue.push(Reverse(item));
        EXECUTOR_QUEUE_DEPTH.set(self.queue.len() as i64);
    }

    /// Pops every due job that is still live. Runs under the mutex; sending
    /// happens outside it.
    fn take_due(&mut self, now: i64) -> Vec<Job> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.trigger_ms >= now {
                break;
            }
            let item = self.queue.pop().expect("peeked head exists").0;
            match self.jobs.get(&item.id) {
                // Dispatched on an earlier tick.
                None => continue,
                Some(entry) if entry.deleted => {
                    self.jobs.remove(&item.id);
                }
                Some(entry) if entry.version == item.version => {
                    let job = entry.job.clone();
                    self.jobs.remove(&item.id);
                    due.push(job);
                }
                // Stale version; a newer copy of this id is in the queue.
                Some(_) => continue,
            }
        }
        EXECUTOR_QUEUE_DEPTH.set(self.queue.len() as i64);
        due
    }
}

/// Process-wide scheduler handle. Cheap to share via `Arc`.
pub struct Executor {
    inner: Arc<Mutex<Inner>>,
    grace: Duration,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Starts the tick worker and returns the executor together with the
    /// receive side of the dispatch channel.
    pub fn start(
        grace: Duration,
        accuracy: Duration,
        dispatch_buffer: usize,
    ) -> (Arc<Executor>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(dispatch_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Mutex::new(Inner {
            jobs: HashMap::new(),
            queue: BinaryHeap::new(),
            closed: false,
        }));

        let worker = tokio::spawn(tick_worker(inner.clone(), tx, accuracy, shutdown_rx));

        let executor = Arc::new(Executor {
            inner,
            grace,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        });
        (executor, rx)
    }

    /// Accepts a job for in-memory scheduling.
    ///
    /// A job already known to this executor is updated in place: its version
    /// is bumped so the old queue entry goes stale, or — if the new trigger
    /// falls outside the grace horizon — the live entry is tombstoned and
    /// the minute poll re-supplies the job closer to its fire time.
    pub fn queue(&self, job: Job) -> Result<(), ExecutorError> {
        let now = current_millis();
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Err(ExecutorError::ExecutorClosed);
        }
        if job.trigger_ms < now {
            return Err(ExecutorError::TooLate);
        }
        let within_grace = job.trigger_ms < now + self.grace.as_millis() as i64;

        let item = match inner.jobs.entry(job.id.clone()) {
            Entry::Occupied(mut occupied) => {
                if within_grace {
                    let entry = occupied.get_mut();
                    entry.version += 1;
                    entry.deleted = false;
                    entry.job = job.clone();
                    Some(QueueItem {
                        trigger_ms: job.trigger_ms,
                        id: job.id.clone(),
                        version: entry.version,
                        job,
                    })
                } else {
                    occupied.get_mut().deleted = true;
                    None
                }
            }
            Entry::Vacant(vacant) => {
                if !within_grace {
                    return Err(ExecutorError::NotWithinGracePeriod);
                }
                vacant.insert(JobEntry {
                    job: job.clone(),
                    version: 0,
                    deleted: false,
                });
                Some(QueueItem {
                    trigger_ms: job.trigger_ms,
                    id: job.id.clone(),
                    version: 0,
                    job,
                })
            }
        };
        if let Some(item) = item {
            inner.push(item);
        }
        Ok(())
    }

    /// Tombstones a job so the tick that would dispatch it skips it instead.
    pub fn delete(&self, job_id: &str) -> Result<(), ExecutorError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(job_id) {
            Some(entry) => {
                entry.deleted = true;
                Ok(())
            }
            None => Err(ExecutorError::JobNotFound),
        }
    }

    /// Current state of a job: `(job, version, deleted)`.
    pub fn get(&self, job_id: &str) -> Result<(Job, u64, bool), ExecutorError> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .get(job_id)
            .map(|e| (e.job.clone(), e.version, e.deleted))
            .ok_or(ExecutorError::JobNotFound)
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// True if the trigger time can be queued directly right now.
    pub fn within_grace(&self, trigger_ms: i64) -> bool {
        trigger_ms < current_millis() + self.grace.as_millis() as i64
    }

    /// Stops accepting jobs, lets the worker drain for the grace period,
    /// then cancels the ticker and closes the dispatch channel.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        info!(grace_ms = self.grace.as_millis() as u64, "executor closing, draining");

        tokio::time::sleep(self.grace).await;
        let _ = self.shutdown_tx.send(true);

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("executor closed");
    }
}

async fn tick_worker(
    inner: Arc<Mutex<Inner>>,
    tx: mpsc::Sender<Job>,
    accuracy: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(accuracy);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = current_millis();
                let due = inner.lock().unwrap().take_due(now);
                for job in due {
                    JOBS_DISPATCHED_TOTAL.inc();
                    DISPATCH_LAG_MS.observe((now - job.trigger_ms).max(0) as f64);
                    debug!(job_id = %job.id, lag_ms = now - job.trigger_ms, "dispatching job");
                    if tx.send(job).await.is_err() {
                        // Dispatch channel abandoned; nothing left to do.
                        return;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                // Final sweep so anything due during the grace drain fires.
                let now = current_millis();
                let due = inner.lock().unwrap().take_due(now);
                for job in due {
                    JOBS_DISPATCHED_TOTAL.inc();
                    if tx.send(job).await.is_err() {
                        return;
                    }
                }
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
