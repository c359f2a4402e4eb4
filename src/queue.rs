//! In-process job queue.
//!
//! Jobs are delivered FIFO to a bounded pool of concurrent handlers. A failed
//! job is redelivered until it has used up its attempts. A job that stops
//! reporting progress for longer than the stall timeout is aborted and handed
//! to the stall handler, which decides between discarding and requeueing it;
//! neither path consumes an attempt.

use futures::StreamExt;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;

pub type JobId = u64;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue {0} is closed")]
    Closed(String),
    #[error("queue {0} is already being processed")]
    AlreadyProcessing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total deliveries allowed before a failing job is abandoned.
    pub attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self { attempts: 1 }
    }
}

#[derive(Debug, Clone)]
struct Job<P> {
    id: JobId,
    data: P,
    options: JobOptions,
    attempts_made: u32,
}

/// The handler's view of the job it is running.
pub struct JobHandle<P> {
    id: JobId,
    data: P,
    attempts_made: u32,
    progress: watch::Sender<u8>,
}

impl<P> JobHandle<P> {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn data(&self) -> &P {
        &self.data
    }

    /// Failed deliveries before this one.
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Reports progress (clamped to 100). Every report also counts as a
    /// heartbeat for stall detection.
    pub fn progress(&self, value: u8) {
        self.progress.send_replace(value.min(100));
    }

    pub fn current_progress(&self) -> u8 {
        *self.progress.borrow()
    }
}

#[cfg(test)]
impl<P> JobHandle<P> {
    /// A handle not owned by any queue, plus a receiver observing its progress.
    pub(crate) fn detached(id: JobId, data: P) -> (Self, watch::Receiver<u8>) {
        let (progress, receiver) = watch::channel(0);
        (
            Self {
                id,
                data,
                attempts_made: 0,
                progress,
            },
            receiver,
        )
    }
}

#[derive(Debug, Clone)]
pub struct StalledJob<P> {
    pub id: JobId,
    pub data: P,
    pub attempts_made: u32,
    pub progress: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    /// Drop the job permanently.
    Discard,
    /// Put the job back on the queue without consuming an attempt.
    Requeue,
}

#[derive(Debug, Clone)]
pub enum QueueEvent<P, R> {
    Completed {
        id: JobId,
        data: P,
        result: R,
    },
    Retrying {
        id: JobId,
        data: P,
        attempts_made: u32,
        error: String,
    },
    Failed {
        id: JobId,
        data: P,
        attempts_made: u32,
        error: String,
    },
    Stalled {
        id: JobId,
        data: P,
        action: StallAction,
    },
}

#[derive(Debug, Default)]
pub struct QueueStats {
    waiting: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    stalled: AtomicUsize,
    concurrency: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub stalled: usize,
    pub concurrency: usize,
}

impl QueueStats {
    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            waiting: self.waiting.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            concurrency: self.concurrency.load(Ordering::Relaxed),
        }
    }
}

type StallHandler<P> = Arc<dyn Fn(&StalledJob<P>) -> StallAction + Send + Sync>;

enum Settled<R> {
    Completed(R),
    Failed(String),
    Stalled,
}

pub struct JobQueue<P, R> {
    name: String,
    stall_timeout: Duration,
    sender: Mutex<Option<mpsc::UnboundedSender<Job<P>>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Job<P>>>>,
    next_id: AtomicU64,
    stall_handler: RwLock<Option<StallHandler<P>>>,
    events: broadcast::Sender<QueueEvent<P, R>>,
    stats: Arc<QueueStats>,
}

impl<P, R> JobQueue<P, R>
where
    P: Clone + Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, stall_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            name: name.into(),
            stall_timeout,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            next_id: AtomicU64::new(1),
            stall_handler: RwLock::new(None),
            events,
            stats: Arc::new(QueueStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent<P, R>> {
        self.events.subscribe()
    }

    pub fn add(&self, data: P, options: JobOptions) -> Result<JobId, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.push(Job {
            id,
            data,
            options,
            attempts_made: 0,
        })?;
        debug!(queue = %self.name, job_id = id, "job added");
        Ok(id)
    }

    /// Installs the policy applied to stalled jobs. Without one, stalled jobs
    /// are requeued.
    pub fn on_stalled<F>(&self, handler: F)
    where
        F: Fn(&StalledJob<P>) -> StallAction + Send + Sync + 'static,
    {
        let mut slot = self.stall_handler.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(handler));
    }

    /// Stops accepting jobs. `process` returns once the backlog has drained.
    pub fn close(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Runs `handler` for every job with at most `concurrency` jobs in flight.
    pub async fn process<F, Fut, E>(self: &Arc<Self>, concurrency: usize, handler: F) -> Result<(), QueueError>
    where
        F: Fn(JobHandle<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| QueueError::AlreadyProcessing(self.name.clone()))?;

        let concurrency = concurrency.max(1);
        self.stats.concurrency.store(concurrency, Ordering::Relaxed);
        info!(queue = %self.name, concurrency, "processing jobs");

        let handler = Arc::new(handler);
        UnboundedReceiverStream::new(receiver)
            .for_each_concurrent(concurrency, |job| {
                let queue = Arc::clone(self);
                let handler = Arc::clone(&handler);
                async move { queue.run_job(job, handler).await }
            })
            .await;

        info!(queue = %self.name, "queue drained");
        Ok(())
    }

    async fn run_job<F, Fut, E>(&self, mut job: Job<P>, handler: Arc<F>)
    where
        F: Fn(JobHandle<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.stats.waiting.fetch_sub(1, Ordering::Relaxed);
        self.stats.active.fetch_add(1, Ordering::Relaxed);

        let (progress_tx, mut progress_rx) = watch::channel(0u8);
        let handle = JobHandle {
            id: job.id,
            data: job.data.clone(),
            attempts_made: job.attempts_made,
            progress: progress_tx,
        };
        let mut task = tokio::spawn((*handler)(handle));
        let settled = self.supervise(&mut task, &mut progress_rx).await;

        self.stats.active.fetch_sub(1, Ordering::Relaxed);

        match settled {
            Settled::Completed(result) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %self.name, job_id = job.id, "job completed");
                self.emit(QueueEvent::Completed {
                    id: job.id,
                    data: job.data,
                    result,
                });
            }
            Settled::Failed(error) => {
                job.attempts_made += 1;
                if job.attempts_made < job.options.attempts {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        queue = %self.name,
                        job_id = job.id,
                        attempt = job.attempts_made,
                        max_attempts = job.options.attempts,
                        error = %error,
                        "job failed, retrying"
                    );
                    self.emit(QueueEvent::Retrying {
                        id: job.id,
                        data: job.data.clone(),
                        attempts_made: job.attempts_made,
                        error,
                    });
                    self.requeue(job);
                } else {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        queue = %self.name,
                        job_id = job.id,
                        attempts = job.attempts_made,
                        error = %error,
                        "job failed permanently"
                    );
                    self.emit(QueueEvent::Failed {
                        id: job.id,
                        data: job.data,
                        attempts_made: job.attempts_made,
                        error,
                    });
                }
            }
            Settled::Stalled => {
                self.stats.stalled.fetch_add(1, Ordering::Relaxed);
                let stalled = StalledJob {
                    id: job.id,
                    data: job.data.clone(),
                    attempts_made: job.attempts_made,
                    progress: *progress_rx.borrow(),
                };
                let policy = self
                    .stall_handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let action = policy.map_or(StallAction::Requeue, |handler| (*handler)(&stalled));

                warn!(
                    queue = %self.name,
                    job_id = job.id,
                    progress = stalled.progress,
                    action = ?action,
                    "job stalled"
                );
                self.emit(QueueEvent::Stalled {
                    id: job.id,
                    data: job.data.clone(),
                    action,
                });
                if action == StallAction::Requeue {
                    self.requeue(job);
                }
            }
        }
    }

    /// Waits for the job task while watching its progress reports. The stall
    /// deadline restarts on every report.
    async fn supervise<E>(
        &self,
        task: &mut JoinHandle<Result<R, E>>,
        progress: &mut watch::Receiver<u8>,
    ) -> Settled<R>
    where
        E: Display,
    {
        loop {
            tokio::select! {
                biased;
                joined = &mut *task => return settle(joined),
                changed = tokio::time::timeout(self.stall_timeout, progress.changed()) => match changed {
                    Ok(Ok(())) => continue,
                    // The handle was dropped, so no heartbeat can arrive any more.
                    Ok(Err(_)) => return settle((&mut *task).await),
                    Err(_) => {
                        task.abort();
                        return Settled::Stalled;
                    }
                },
            }
        }
    }

    fn push(&self, job: Job<P>) -> Result<(), QueueError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender
            .as_ref()
            .ok_or_else(|| QueueError::Closed(self.name.clone()))?;
        self.stats.waiting.fetch_add(1, Ordering::Relaxed);
        if sender.send(job).is_err() {
            self.stats.waiting.fetch_sub(1, Ordering::Relaxed);
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn requeue(&self, job: Job<P>) {
        let id = job.id;
        if let Err(e) = self.push(job) {
            warn!(queue = %self.name, job_id = id, error = %e, "dropping job that could not be requeued");
        }
    }

    fn emit(&self, event: QueueEvent<P, R>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn settle<R, E: Display>(joined: Result<Result<R, E>, JoinError>) -> Settled<R> {
    match joined {
        Ok(Ok(result)) => Settled::Completed(result),
        Ok(Err(error)) => Settled::Failed(error.to_string()),
        Err(e) if e.is_panic() => Settled::Failed("job handler panicked".to_string()),
        Err(e) => Settled::Failed(format!("job handler cancelled: {e}")),
    }
}
