//! Background execution of comparison and analysis jobs.
//!
//! A submitted job already owns a `processing` operation with a budget
//! reservation. [`WorkerPool`] runs jobs on a fixed number of tokio tasks;
//! each job runs its stages sequentially inside one [`JobHandler::attempt`].
//!
//! [`JobRunner::run`] gives every job the same lifecycle:
//!
//! 1. Skip it unless its operation is still `processing` (at most once).
//! 2. Wait `subscriber_grace_ms` so a progress subscriber can attach.
//! 3. Attempt. Transient failures retry with exponential backoff up to
//!    `jobs.max_attempts`; domain failures end the job at once.
//! 4. Move the operation to `completed` or `failed` (releasing the
//!    reservation) and publish the terminal progress event.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use repo_compare_core::models::{OperationKind, OperationStatus, PendingOperation};
use repo_compare_core::store::Store;

use crate::analyzer::RepositoryAnalyzer;
use crate::config::JobsConfig;
use crate::error::PipelineError;
use crate::ledger::BudgetGate;
use crate::progress::{ProgressBroadcaster, ProgressHub};

/// Exponential backoff between attempts of one job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Delay before retry number `retry` (0-indexed): `base * 2^retry`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << retry.min(20));
        Duration::from_millis(exponential_ms.min(self.max_delay.as_millis() as u64))
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// What a job works on.
#[derive(Debug, Clone)]
pub enum JobPayload {
    Comparison { query: String, limit: usize },
    Analysis { repository_id: i64 },
}

/// A job waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub operation: PendingOperation,
    pub payload: JobPayload,
}

/// Successful end of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub result_id: i64,
    pub redirect_target: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(CompletedJob),
    Failed(PipelineError),
    /// The operation was no longer `processing` when picked up.
    Skipped,
}

/// One attempt at a job. Errors are classified with
/// [`PipelineError::classify`] to decide whether to retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn attempt(&self, job: &QueuedJob, progress: &ProgressBroadcaster)
        -> Result<CompletedJob>;
}

pub struct JobRunner {
    store: Arc<dyn Store>,
    gate: Arc<BudgetGate>,
    hub: ProgressHub,
    policy: RetryPolicy,
    grace: Duration,
    comparison: Arc<dyn JobHandler>,
    analysis: Arc<dyn JobHandler>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn Store>,
        gate: Arc<BudgetGate>,
        hub: ProgressHub,
        config: &JobsConfig,
        comparison: Arc<dyn JobHandler>,
        analysis: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            store,
            gate,
            hub,
            policy: RetryPolicy::from_config(config),
            grace: Duration::from_millis(config.subscriber_grace_ms),
            comparison,
            analysis,
        }
    }

    pub async fn run(&self, job: QueuedJob) -> JobOutcome {
        let op = &job.operation;
        match self.store.get_operation(&op.id).await {
            Ok(Some(current)) if current.status == OperationStatus::Processing => {}
            Ok(_) => {
                debug!(operation = %op.id, "operation no longer processing; skipping");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                error!(operation = %op.id, error = %e, "could not load operation");
                return JobOutcome::Skipped;
            }
        }

        let progress = match self.hub.broadcaster(op.kind, &op.session_id) {
            Ok(p) => p,
            Err(e) => {
                let failure = PipelineError::Internal(e.to_string());
                self.finish_failed(op, &failure, None).await;
                return JobOutcome::Failed(failure);
            }
        };

        if !self.grace.is_zero() {
            tokio::time::sleep(self.grace).await;
        }

        let handler = match op.kind {
            OperationKind::Comparison => &self.comparison,
            OperationKind::Analysis => &self.analysis,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match handler.attempt(&job, &progress).await {
                Ok(done) => {
                    let now = chrono::Utc::now().timestamp();
                    if let Err(e) = self
                        .gate
                        .release(&op.id, OperationStatus::Completed, Some(done.result_id), None, now)
                        .await
                    {
                        error!(operation = %op.id, error = %e, "could not complete operation");
                    }
                    progress.broadcast_complete(&done.message, &done.redirect_target);
                    info!(
                        operation = %op.id,
                        kind = op.kind.as_str(),
                        result = done.result_id,
                        attempts,
                        "job completed"
                    );
                    return JobOutcome::Completed(done);
                }
                Err(e) => {
                    let failure = PipelineError::classify(&e);
                    if failure.is_retryable() && self.policy.should_retry(attempts) {
                        let delay = self.policy.delay_for_attempt(attempts - 1);
                        warn!(
                            operation = %op.id,
                            attempt = attempts,
                            ?delay,
                            error = %format!("{:#}", e),
                            "transient failure; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(
                        operation = %op.id,
                        attempts,
                        error = %format!("{:#}", e),
                        "job failed"
                    );
                    self.finish_failed(op, &failure, Some(&progress)).await;
                    return JobOutcome::Failed(failure);
                }
            }
        }
    }

    async fn finish_failed(
        &self,
        op: &PendingOperation,
        failure: &PipelineError,
        progress: Option<&ProgressBroadcaster>,
    ) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self
            .gate
            .release(
                &op.id,
                OperationStatus::Failed,
                None,
                Some(&failure.to_string()),
                now,
            )
            .await
        {
            error!(operation = %op.id, error = %e, "could not fail operation");
        }
        if let Some(p) = progress {
            p.broadcast_error(&failure.user_message());
        }
    }
}

struct Envelope {
    job: QueuedJob,
    reply: Option<oneshot::Sender<JobOutcome>>,
}

/// Fixed-size pool of tokio workers pulling jobs from one queue.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Envelope>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(runner: Arc<JobRunner>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Envelope>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let runner = runner.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        // Hold the lock only while waiting for the next job.
                        let next = receiver.lock().await.recv().await;
                        let Some(envelope) = next else { break };
                        debug!(worker, operation = %envelope.job.operation.id, "job picked up");
                        let outcome = runner.run(envelope.job).await;
                        if let Some(reply) = envelope.reply {
                            let _ = reply.send(outcome);
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self { sender, handles }
    }

    /// Queue a job and get a handle to its outcome.
    pub fn enqueue(&self, job: QueuedJob) -> Result<oneshot::Receiver<JobOutcome>> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .send(Envelope {
                job,
                reply: Some(reply),
            })
            .map_err(|_| anyhow!("worker pool is shut down"))?;
        Ok(outcome)
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Deep analysis of one stored repository, as a budget-gated job.
pub struct DeepAnalysisJobs {
    store: Arc<dyn Store>,
    analyzer: Arc<RepositoryAnalyzer>,
    gate: Arc<BudgetGate>,
}

impl DeepAnalysisJobs {
    pub fn new(
        store: Arc<dyn Store>,
        analyzer: Arc<RepositoryAnalyzer>,
        gate: Arc<BudgetGate>,
    ) -> Self {
        Self {
            store,
            analyzer,
            gate,
        }
    }

    /// Reserve budget for a deep analysis of `full_name`.
    pub async fn submit(
        &self,
        full_name: &str,
        user_id: &str,
        session_id: &str,
        now: i64,
    ) -> std::result::Result<QueuedJob, PipelineError> {
        if session_id.trim().is_empty() {
            return Err(PipelineError::InvalidQuery(
                "A session id is required to follow progress.".to_string(),
            ));
        }
        let repository = self
            .store
            .find_repository_by_full_name(full_name)
            .await
            .map_err(|e| PipelineError::Internal(format!("{:#}", e)))?
            .ok_or_else(|| {
                PipelineError::InvalidQuery(format!(
                    "Repository {} is not known yet. Run a comparison or sync first.",
                    full_name
                ))
            })?;
        let operation = self
            .gate
            .reserve(OperationKind::Analysis, session_id, user_id, full_name, now)
            .await?;
        Ok(QueuedJob {
            operation,
            payload: JobPayload::Analysis {
                repository_id: repository.id,
            },
        })
    }
}

#[async_trait]
impl JobHandler for DeepAnalysisJobs {
    async fn attempt(
        &self,
        job: &QueuedJob,
        progress: &ProgressBroadcaster,
    ) -> Result<CompletedJob> {
        let JobPayload::Analysis { repository_id } = job.payload else {
            return Err(PipelineError::Internal("analysis handler got a comparison job".into()).into());
        };
        let now = chrono::Utc::now().timestamp();
        let repository = self
            .store
            .get_repository(repository_id)
            .await?
            .ok_or_else(|| PipelineError::Internal(format!("repository {} vanished", repository_id)))?;

        let run = self
            .analyzer
            .analyze_deep(&repository, now, Some(progress))
            .await?;
        Ok(CompletedJob {
            result_id: run.analysis.id,
            redirect_target: format!("/repositories/{}", repository.id),
            message: format!("Deep analysis of {} is ready", repository.full_name),
        })
    }
}
