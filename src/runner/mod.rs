//! Polling worker runner
//!
//! A registry maps job types to workers. Each tick the runner claims
//! jobs while slots remain under the concurrency cap and dispatches them
//! onto the runtime. Workers never panic the loop; they return an
//! outcome with an explicit retryable flag and the runner applies the
//! queue's fail policy. Shutdown stops polling, waits for in-flight jobs
//! up to a deadline, then signals stragglers through their cancellation
//! handles.

use crate::queue::{Job, JobPayload, JobQueue, JobType};
use crate::store::runs::RunRecord;
use crate::store::types::RunStatus;
use crate::store::Store;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// What a worker hands back to the runner.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Job done; optional result blob is stored on the job row.
    Success(Option<serde_json::Value>),
    /// Job failed; `retryable` selects between backoff and dead-letter.
    Failure { message: String, retryable: bool },
}

impl WorkerOutcome {
    pub fn retryable(message: impl Into<String>) -> Self {
        WorkerOutcome::Failure {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        WorkerOutcome::Failure {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Cancellation handle passed to every dispatched job. Workers poll it
/// at their suspension points; supervisors translate it into SIGTERM for
/// child processes.
#[derive(Clone)]
pub struct WorkerContext {
    cancel: watch::Receiver<bool>,
}

impl WorkerContext {
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// For tests and direct invocations outside the runner. A dropped
    /// sender leaves the flag permanently false.
    #[cfg(test)]
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { cancel: rx }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, job: &Job, payload: JobPayload, ctx: &WorkerContext) -> WorkerOutcome;
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub shutdown_deadline: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3000),
            max_concurrent: 2,
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

pub struct WorkerRunner {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    workers: HashMap<JobType, Arc<dyn Worker>>,
    config: RunnerConfig,
    cancels: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl WorkerRunner {
    pub fn new(store: Arc<Store>, queue: Arc<JobQueue>, config: RunnerConfig) -> Self {
        Self {
            store,
            queue,
            workers: HashMap::new(),
            config,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register(&mut self, job_type: JobType, worker: Arc<dyn Worker>) {
        self.workers.insert(job_type, worker);
    }

    /// Poll until `shutdown` flips, then drain in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inflight: JoinSet<String> = JoinSet::new();

        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Worker runner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(finished) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Ok(job_id) = finished {
                        self.cancels.lock().expect("cancel map poisoned").remove(&job_id);
                    }
                }
                _ = interval.tick() => {
                    while inflight.len() < self.config.max_concurrent {
                        match self.queue.claim() {
                            Ok(Some(job)) => self.dispatch(job, &mut inflight),
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!("Queue claim failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(inflight = inflight.len(), "Worker runner draining");
        let deadline = Instant::now() + self.config.shutdown_deadline;
        while !inflight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, inflight.join_next()).await {
                Ok(Some(finished)) => {
                    if let Ok(job_id) = finished {
                        self.cancels.lock().expect("cancel map poisoned").remove(&job_id);
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        // Anything still running gets its cancellation handle flipped;
        // supervisors propagate this as a graceful child termination.
        let stragglers: Vec<String> = {
            let cancels = self.cancels.lock().expect("cancel map poisoned");
            cancels.keys().cloned().collect()
        };
        if !stragglers.is_empty() {
            tracing::warn!(count = stragglers.len(), "Signalling in-flight jobs to cancel");
            {
                let cancels = self.cancels.lock().expect("cancel map poisoned");
                for id in &stragglers {
                    if let Some(tx) = cancels.get(id) {
                        let _ = tx.send(true);
                    }
                }
            }
            // Give signalled jobs a moment to wind down before aborting.
            let _ = tokio::time::timeout(Duration::from_secs(5), async {
                while inflight.join_next().await.is_some() {}
            })
            .await;
        }
        inflight.shutdown().await;
        tracing::info!("Worker runner stopped");
    }

    fn dispatch(&self, job: Job, inflight: &mut JoinSet<String>) {
        let job_id = job.id.clone();

        // Decode the payload before spawning; an undecodable or unknown
        // payload is a data error, not a transient one.
        let payload = match job.payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.fail_dispatch(&job, &format!("invalid job payload: {}", e));
                return;
            }
        };

        let Some(worker) = self.workers.get(&job.job_type).cloned() else {
            self.fail_dispatch(
                &job,
                &format!("no worker registered for job type {}", job.job_type.as_str()),
            );
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .expect("cancel map poisoned")
            .insert(job_id.clone(), cancel_tx);

        let queue = self.queue.clone();
        let ctx = WorkerContext { cancel: cancel_rx };
        inflight.spawn(async move {
            let outcome = worker.run(&job, payload, &ctx).await;
            match outcome {
                WorkerOutcome::Success(result) => {
                    if let Err(e) = queue.complete(&job.id, result.as_ref()) {
                        tracing::error!(job_id = %job.id, "Failed to complete job: {}", e);
                    }
                }
                WorkerOutcome::Failure { message, retryable } => {
                    if let Err(e) = queue.fail(&job.id, &message, retryable) {
                        tracing::error!(job_id = %job.id, "Failed to fail job: {}", e);
                    }
                }
            }
            job.id
        });
    }

    /// A job that cannot even be dispatched fails non-retryably with a
    /// run row for the dashboard.
    fn fail_dispatch(&self, job: &Job, message: &str) {
        tracing::error!(job_id = %job.id, "{}", message);
        if let Err(e) = self.queue.fail(&job.id, message, false) {
            tracing::error!(job_id = %job.id, "Failed to dead-letter job: {}", e);
        }
        let event_id = job.event_id.clone().unwrap_or_else(|| job.id.clone());
        let _ = self.store.record_run(&RunRecord {
            event_id: &event_id,
            job_type: job.job_type.as_str(),
            status: RunStatus::Error,
            input_snapshot: job.payload.as_deref(),
            output_snapshot: None,
            error_message: Some(message),
            duration_ms: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, JobStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingWorker {
        calls: Arc<AtomicUsize>,
        outcome_retryable: Option<bool>,
    }

    #[async_trait]
    impl Worker for RecordingWorker {
        async fn run(
            &self,
            _job: &Job,
            _payload: JobPayload,
            _ctx: &WorkerContext,
        ) -> WorkerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome_retryable {
                None => WorkerOutcome::Success(Some(serde_json::json!({"done": true}))),
                Some(retryable) => WorkerOutcome::Failure {
                    message: "scripted failure".into(),
                    retryable,
                },
            }
        }
    }

    fn harness() -> (tempfile::TempDir, Arc<Store>, Arc<JobQueue>) {
        let (dir, store) = Store::open_temp().unwrap();
        let store = Arc::new(store);
        let queue = Arc::new(JobQueue::new(store.clone()));
        (dir, store, queue)
    }

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(20),
            max_concurrent: 2,
            shutdown_deadline: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_worker() {
        let (_dir, store, queue) = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = WorkerRunner::new(store, queue.clone(), fast_config());
        runner.register(
            JobType::Stt,
            Arc::new(RecordingWorker {
                calls: calls.clone(),
                outcome_retryable: None,
            }),
        );

        let job = queue
            .enqueue(
                Some("ev"),
                &JobPayload::Stt {
                    audio_path: "/tmp/a.ogg".into(),
                    language: None,
                },
                EnqueueOptions::default(),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.get(&job.id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn unregistered_type_fails_non_retryably() {
        let (_dir, store, queue) = harness();
        let runner = WorkerRunner::new(store.clone(), queue.clone(), fast_config());

        let job = queue
            .enqueue(
                None,
                &JobPayload::TtlCleanup { dry_run: false },
                EnqueueOptions::default(),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let failed = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.unwrap().contains("no worker registered"));
        assert_eq!(queue.list_dead_letters(10).unwrap().len(), 1);
        // Dispatch failures leave a run row behind.
        let runs = store.runs_for_event(&job.id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "error");
    }

    #[tokio::test]
    async fn retryable_worker_failure_lands_in_retry() {
        let (_dir, store, queue) = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut runner = WorkerRunner::new(store, queue.clone(), fast_config());
        runner.register(
            JobType::Extract,
            Arc::new(RecordingWorker {
                calls,
                outcome_retryable: Some(true),
            }),
        );

        let job = queue
            .enqueue(
                Some("ev"),
                &JobPayload::Extract {
                    transcript: "hello".into(),
                    language: None,
                },
                EnqueueOptions::default(),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.get(&job.id).unwrap().unwrap().status, JobStatus::Retry);
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let (_dir, store, queue) = harness();

        struct SlowWorker {
            peak: Arc<AtomicUsize>,
            current: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Worker for SlowWorker {
            async fn run(
                &self,
                _job: &Job,
                _payload: JobPayload,
                _ctx: &WorkerContext,
            ) -> WorkerOutcome {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                WorkerOutcome::Success(None)
            }
        }

        let peak = Arc::new(AtomicUsize::new(0));
        let mut runner = WorkerRunner::new(store, queue.clone(), fast_config());
        runner.register(
            JobType::Push,
            Arc::new(SlowWorker {
                peak: peak.clone(),
                current: Arc::new(AtomicUsize::new(0)),
            }),
        );

        for i in 0..5 {
            queue
                .enqueue(
                    None,
                    &JobPayload::Push {
                        action_id: format!("a{}", i),
                        event_id: "ev".into(),
                    },
                    EnqueueOptions::default(),
                )
                .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(800)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    }
}
