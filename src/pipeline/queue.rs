//! In-process stage-keyed job queues with at-least-once delivery.
//!
//! Each queue runs a bounded number of concurrent handler tasks. Failed
//! jobs are re-enqueued with exponential backoff up to their attempt
//! budget; exhausted jobs ask the handler for terminal follow-ups (the
//! cleanup branch). Follow-up jobs returned by handlers are routed to the
//! right queue by the shared router task, so handlers never hold a queue
//! reference and the wiring stays acyclic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{JobPayload, PipelineError, QueueName};

/// Per-job queueing options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Total attempts (first try included).
    pub attempts: u32,
    /// Backoff base; attempt `n` failing sleeps `base * 2^(n-1)`.
    pub backoff_base: Duration,
    /// High-priority jobs are dequeued before normal ones.
    pub priority: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_secs(5),
            priority: false,
        }
    }
}

/// Recent outcomes kept for the health endpoint.
const KEEP_COMPLETED: usize = 100;
const KEEP_FAILED: usize = 50;

/// A finished job, as reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Wire job name.
    pub job: &'static str,
    /// Attempts consumed.
    pub attempts: u32,
    /// Terminal error, when the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

/// Counters for one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Jobs waiting (including scheduled retries).
    pub queued: u64,
    /// Jobs currently running.
    pub active: u64,
    /// Jobs finished successfully.
    pub completed: u64,
    /// Jobs that exhausted their attempts.
    pub failed: u64,
    /// Retries scheduled so far.
    pub retried: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    queued: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    history: Mutex<History>,
}

#[derive(Debug, Default)]
struct History {
    completed: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
}

impl QueueState {
    fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queued.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }

    fn push_completed(&self, record: JobRecord) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.completed.push_back(record);
        while history.completed.len() > KEEP_COMPLETED {
            history.completed.pop_front();
        }
    }

    fn push_failed(&self, record: JobRecord) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.failed.push_back(record);
        while history.failed.len() > KEEP_FAILED {
            history.failed.pop_front();
        }
    }
}

/// Processes jobs and names their follow-ups.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one job; returned jobs are enqueued after this one
    /// commits. Errors are retried per the job's options.
    async fn handle(&self, job: &JobPayload) -> Result<Vec<JobPayload>, PipelineError>;

    /// Called once when a job's attempts are exhausted (or the error is
    /// not retryable); returned jobs are terminal follow-ups such as
    /// cleanup.
    async fn on_exhausted(&self, job: &JobPayload, error: &PipelineError) -> Vec<JobPayload>;
}

#[derive(Debug)]
struct Envelope {
    payload: JobPayload,
    options: JobOptions,
    attempt: u32,
}

/// One named worker pool.
pub struct JobQueue {
    name: QueueName,
    normal_tx: mpsc::UnboundedSender<Envelope>,
    priority_tx: mpsc::UnboundedSender<Envelope>,
    state: Arc<QueueState>,
}

impl JobQueue {
    /// Start a queue with `concurrency` worker slots.
    pub fn start(
        name: QueueName,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
        router_tx: mpsc::UnboundedSender<JobPayload>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::default());

        let queue = Self {
            name,
            normal_tx: normal_tx.clone(),
            priority_tx,
            state: Arc::clone(&state),
        };
        let handle = tokio::spawn(run_queue(
            name,
            concurrency,
            handler,
            normal_rx,
            priority_rx,
            normal_tx,
            router_tx,
            state,
            shutdown,
        ));
        (queue, handle)
    }

    /// Enqueue with default options.
    pub fn enqueue(&self, payload: JobPayload) -> bool {
        self.enqueue_with(payload, JobOptions::default())
    }

    /// Enqueue with explicit options. Returns `false` once the queue has
    /// shut down.
    pub fn enqueue_with(&self, payload: JobPayload, options: JobOptions) -> bool {
        let envelope = Envelope {
            payload,
            options,
            attempt: 1,
        };
        self.state.queued.fetch_add(1, Ordering::Relaxed);
        let sent = if envelope.options.priority {
            self.priority_tx.send(envelope).is_ok()
        } else {
            self.normal_tx.send(envelope).is_ok()
        };
        if !sent {
            self.state.queued.fetch_sub(1, Ordering::Relaxed);
            warn!(queue = self.name.as_str(), "enqueue after shutdown dropped");
        }
        sent
    }

    /// Current counters.
    pub fn stats(&self) -> QueueStats {
        self.state.stats()
    }

    /// Recent failures, oldest first.
    pub fn recent_failures(&self) -> Vec<JobRecord> {
        let history = self
            .state
            .history
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        history.failed.iter().cloned().collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_queue(
    name: QueueName,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
    mut normal_rx: mpsc::UnboundedReceiver<Envelope>,
    mut priority_rx: mpsc::UnboundedReceiver<Envelope>,
    retry_tx: mpsc::UnboundedSender<Envelope>,
    router_tx: mpsc::UnboundedSender<JobPayload>,
    state: Arc<QueueState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(queue = name.as_str(), concurrency, "queue started");
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        // Reap finished workers so the set stays small.
        while tasks.try_join_next().is_some() {}

        let envelope = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            Some(envelope) = priority_rx.recv() => envelope,
            Some(envelope) = normal_rx.recv() => envelope,
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        state.queued.fetch_sub(1, Ordering::Relaxed);
        state.active.fetch_add(1, Ordering::Relaxed);

        let handler = Arc::clone(&handler);
        let retry_tx = retry_tx.clone();
        let router_tx = router_tx.clone();
        let state = Arc::clone(&state);
        tasks.spawn(async move {
            run_job(name, envelope, handler, retry_tx, router_tx, &state).await;
            state.active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    // Let in-flight jobs finish before reporting the queue closed.
    while tasks.join_next().await.is_some() {}
    info!(queue = name.as_str(), "queue stopped");
}

async fn run_job(
    name: QueueName,
    envelope: Envelope,
    handler: Arc<dyn JobHandler>,
    retry_tx: mpsc::UnboundedSender<Envelope>,
    router_tx: mpsc::UnboundedSender<JobPayload>,
    state: &QueueState,
) {
    let job_name = envelope.payload.job_name();
    debug!(queue = name.as_str(), job = job_name, attempt = envelope.attempt, "job started");

    match handler.handle(&envelope.payload).await {
        Ok(followups) => {
            state.completed.fetch_add(1, Ordering::Relaxed);
            state.push_completed(JobRecord {
                job: job_name,
                attempts: envelope.attempt,
                error: None,
                finished_at: Utc::now(),
            });
            for followup in followups {
                let _ = router_tx.send(followup);
            }
        }
        Err(error) if error.is_retryable() && envelope.attempt < envelope.options.attempts => {
            warn!(
                queue = name.as_str(),
                job = job_name,
                attempt = envelope.attempt,
                error = %error,
                "job failed, retrying"
            );
            state.retried.fetch_add(1, Ordering::Relaxed);
            state.queued.fetch_add(1, Ordering::Relaxed);
            let factor = 2u32.saturating_pow(envelope.attempt.saturating_sub(1));
            let delay = envelope.options.backoff_base.saturating_mul(factor);
            let retry = Envelope {
                payload: envelope.payload,
                options: envelope.options,
                attempt: envelope.attempt.saturating_add(1),
            };
            // The backoff sleeps outside the worker slot so a waiting
            // retry never starves running jobs.
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = retry_tx.send(retry);
            });
        }
        Err(error) => {
            warn!(
                queue = name.as_str(),
                job = job_name,
                attempts = envelope.attempt,
                error = %error,
                "job exhausted"
            );
            state.failed.fetch_add(1, Ordering::Relaxed);
            state.push_failed(JobRecord {
                job: job_name,
                attempts: envelope.attempt,
                error: Some(error.to_string()),
                finished_at: Utc::now(),
            });
            for followup in handler.on_exhausted(&envelope.payload, &error).await {
                let _ = router_tx.send(followup);
            }
        }
    }
}

// ── Queue set ───────────────────────────────────────────────────

/// Worker-pool sizing.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent smart-upload handlers.
    pub smart_upload_concurrency: usize,
    /// Concurrent cleanup handlers.
    pub cleanup_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            smart_upload_concurrency: 3,
            cleanup_concurrency: 1,
        }
    }
}

/// Both pipeline queues plus the follow-up router.
pub struct QueueSet {
    smart_upload: JobQueue,
    cleanup: JobQueue,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl QueueSet {
    /// Start both queues and the router.
    pub fn start(
        handler: Arc<dyn JobHandler>,
        config: QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (router_tx, mut router_rx) = mpsc::unbounded_channel::<JobPayload>();

        let (smart_upload, smart_handle) = JobQueue::start(
            QueueName::SmartUpload,
            config.smart_upload_concurrency,
            Arc::clone(&handler),
            router_tx.clone(),
            shutdown.clone(),
        );
        let (cleanup, cleanup_handle) = JobQueue::start(
            QueueName::Cleanup,
            config.cleanup_concurrency,
            handler,
            router_tx,
            shutdown.clone(),
        );

        // Router: follow-ups from handlers land on the right queue.
        let smart_tx = smart_upload.normal_tx.clone();
        let cleanup_tx = cleanup.normal_tx.clone();
        let smart_state = Arc::clone(&smart_upload.state);
        let cleanup_state = Arc::clone(&cleanup.state);
        let mut router_shutdown = shutdown;
        let router_handle = tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    changed = router_shutdown.changed() => {
                        if changed.is_err() || *router_shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    maybe = router_rx.recv() => match maybe {
                        Some(payload) => payload,
                        None => break,
                    },
                };
                let envelope = Envelope {
                    payload,
                    options: JobOptions::default(),
                    attempt: 1,
                };
                match envelope.payload.queue() {
                    QueueName::SmartUpload => {
                        smart_state.queued.fetch_add(1, Ordering::Relaxed);
                        let _ = smart_tx.send(envelope);
                    }
                    QueueName::Cleanup => {
                        cleanup_state.queued.fetch_add(1, Ordering::Relaxed);
                        let _ = cleanup_tx.send(envelope);
                    }
                }
            }
        });

        Self {
            smart_upload,
            cleanup,
            handles: Mutex::new(vec![
                ("smart-upload", smart_handle),
                ("cleanup", cleanup_handle),
                ("router", router_handle),
            ]),
        }
    }

    /// Enqueue onto the queue the payload belongs to.
    pub fn enqueue(&self, payload: JobPayload) -> bool {
        match payload.queue() {
            QueueName::SmartUpload => self.smart_upload.enqueue(payload),
            QueueName::Cleanup => self.cleanup.enqueue(payload),
        }
    }

    /// Enqueue with explicit options.
    pub fn enqueue_with(&self, payload: JobPayload, options: JobOptions) -> bool {
        match payload.queue() {
            QueueName::SmartUpload => self.smart_upload.enqueue_with(payload, options),
            QueueName::Cleanup => self.cleanup.enqueue_with(payload, options),
        }
    }

    /// Stats per queue, for `/health`.
    pub fn stats(&self) -> Vec<(QueueName, QueueStats)> {
        vec![
            (QueueName::SmartUpload, self.smart_upload.stats()),
            (QueueName::Cleanup, self.cleanup.stats()),
        ]
    }

    /// Recent failures across both queues.
    pub fn recent_failures(&self) -> Vec<JobRecord> {
        let mut failures = self.smart_upload.recent_failures();
        failures.extend(self.cleanup.recent_failures());
        failures
    }

    /// Liveness per worker task, for `/health` and `/ready`.
    pub fn worker_status(&self) -> Vec<(&'static str, bool)> {
        let handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles
            .iter()
            .map(|(name, handle)| (*name, !handle.is_finished()))
            .collect()
    }

    /// Whether every worker task is still running.
    pub fn all_workers_running(&self) -> bool {
        self.worker_status().iter().all(|(_, running)| *running)
    }

    /// Wait for both queues (and the router) to wind down after the
    /// shutdown signal fires. In-flight jobs finish first.
    pub async fn close(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for (_, handle) in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    /// Fails the first `failures` calls per job, then succeeds with the
    /// given follow-ups.
    struct FlakyHandler {
        failures: usize,
        calls: AtomicUsize,
        cleanups: AtomicUsize,
        followups: Vec<JobPayload>,
        exhausted: Mutex<Vec<&'static str>>,
    }

    impl FlakyHandler {
        fn new(failures: usize, followups: Vec<JobPayload>) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
                followups,
                exhausted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, job: &JobPayload) -> Result<Vec<JobPayload>, PipelineError> {
            if matches!(job, JobPayload::Cleanup { .. }) {
                // Terminal branch: always succeeds, no follow-ups.
                self.cleanups.fetch_add(1, Ordering::SeqCst);
                return Ok(Vec::new());
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(PipelineError::Extraction("flaky".to_owned()))
            } else {
                Ok(self.followups.clone())
            }
        }

        async fn on_exhausted(
            &self,
            job: &JobPayload,
            _error: &PipelineError,
        ) -> Vec<JobPayload> {
            self.exhausted
                .lock()
                .expect("test lock")
                .push(job.job_name());
            if matches!(job, JobPayload::Cleanup { .. }) {
                return Vec::new();
            }
            vec![JobPayload::Cleanup {
                item_id: Uuid::nil(),
                reason: super::super::CleanupReason::Failed,
            }]
        }
    }

    async fn settle() {
        // Drive the paused clock until queue bookkeeping quiesces.
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_retries_then_succeeds() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = Arc::new(FlakyHandler::new(2, vec![]));
        let queues = QueueSet::start(handler.clone(), QueueConfig::default(), shutdown_rx);

        queues.enqueue(JobPayload::ExtractText {
            item_id: Uuid::new_v4(),
        });
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let stats = queues.stats();
        let smart = &stats[0].1;
        assert_eq!(smart.completed, 1);
        assert_eq!(smart.retried, 2);
        assert_eq!(smart.failed, 0);

        shutdown_tx.send(true).expect("signal");
        queues.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_job_emits_cleanup_followup() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = Arc::new(FlakyHandler::new(usize::MAX, vec![]));
        let queues = QueueSet::start(handler.clone(), QueueConfig::default(), shutdown_rx);

        queues.enqueue(JobPayload::ExtractText {
            item_id: Uuid::new_v4(),
        });
        settle().await;

        // Three attempts, then exhaustion.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            handler.exhausted.lock().expect("test lock").as_slice(),
            ["smartupload.extractText"]
        );

        let stats = queues.stats();
        assert_eq!(stats[0].1.failed, 1);
        // The cleanup follow-up landed on the cleanup queue and ran.
        assert_eq!(handler.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(stats[1].1.completed, 1);

        let failures = queues.recent_failures();
        assert!(failures.iter().any(|f| f.job == "smartupload.extractText"));

        shutdown_tx.send(true).expect("signal");
        queues.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_followups_route_to_their_queue() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handler = Arc::new(FlakyHandler::new(
            0,
            vec![JobPayload::Cleanup {
                item_id: Uuid::nil(),
                reason: super::super::CleanupReason::Cancelled,
            }],
        ));
        let queues = QueueSet::start(handler.clone(), QueueConfig::default(), shutdown_rx);

        queues.enqueue(JobPayload::Finalize {
            item_id: Uuid::new_v4(),
        });
        settle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.cleanups.load(Ordering::SeqCst), 1);
        let stats = queues.stats();
        assert_eq!(stats[1].1.completed, 1, "cleanup queue should have run");

        shutdown_tx.send(true).expect("signal");
        queues.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_skips_retries() {
        struct CancelledHandler;

        #[async_trait]
        impl JobHandler for CancelledHandler {
            async fn handle(&self, _job: &JobPayload) -> Result<Vec<JobPayload>, PipelineError> {
                Err(PipelineError::Cancelled)
            }
            async fn on_exhausted(
                &self,
                _job: &JobPayload,
                _error: &PipelineError,
            ) -> Vec<JobPayload> {
                Vec::new()
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queues = QueueSet::start(
            Arc::new(CancelledHandler),
            QueueConfig::default(),
            shutdown_rx,
        );

        queues.enqueue(JobPayload::ExtractText {
            item_id: Uuid::new_v4(),
        });
        settle().await;

        let stats = queues.stats();
        assert_eq!(stats[0].1.failed, 1);
        assert_eq!(stats[0].1.retried, 0);

        shutdown_tx.send(true).expect("signal");
        queues.close().await;
    }
}
