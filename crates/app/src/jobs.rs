use std::{sync::Arc, time::Duration};

use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hostmap_core::DomainId;
use hostmap_probe::Probe;

use crate::primary::PrimaryDomainCoordinator;
use crate::verification::{VerificationError, VerificationWorker};

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Asynchronous work produced by domain mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    ProcessDomainStage { domain_id: DomainId },
    RemoveOldPrimaryDomains { domain_ids: Vec<DomainId> },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessDomainStage { .. } => "process_domain_stage",
            Self::RemoveOldPrimaryDomains { .. } => "remove_old_primary_domains",
        }
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("job queue is closed")]
    Closed,
}

/// Where domain mutations hand off their follow-up work. Delivery is
/// at-least-once, so every handler must tolerate duplicates.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<(), EnqueueError>;
}

/// A job together with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub job: Job,
    pub attempt: u32,
}

/// In-process queue backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct JobDispatcher {
    sender: mpsc::UnboundedSender<JobEnvelope>,
}

impl JobDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn redeliver(&self, envelope: JobEnvelope) -> Result<(), EnqueueError> {
        self.sender
            .send(envelope)
            .map_err(|_| EnqueueError::Closed)
    }
}

impl JobQueue for JobDispatcher {
    fn enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        let envelope = JobEnvelope {
            id: Uuid::new_v4(),
            job,
            attempt: 1,
        };
        debug!(stage = "jobs", job_id = %envelope.id, job = envelope.job.name(), "job enqueued");
        self.redeliver(envelope)
    }
}

/// What happened to a delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { delay: Duration },
    Failed,
}

/// Consumes jobs from the dispatcher. Demotions run on the consumer task;
/// each verification runs on its own task so a slow check never holds up
/// the queue.
pub struct JobRunner<P> {
    receiver: mpsc::UnboundedReceiver<JobEnvelope>,
    handler: JobHandler<P>,
}

impl<P: Probe + 'static> JobRunner<P> {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<JobEnvelope>,
        dispatcher: JobDispatcher,
        coordinator: PrimaryDomainCoordinator,
        verifier: Arc<VerificationWorker<P>>,
        max_attempts: u32,
    ) -> Self {
        Self {
            receiver,
            handler: JobHandler {
                dispatcher,
                coordinator,
                verifier,
                max_attempts: max_attempts.max(1),
                base_delay: DEFAULT_BASE_DELAY,
            },
        }
    }

    #[cfg(test)]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.handler.base_delay = base_delay;
        self
    }

    /// Runs the consumer loop in the background until every dispatcher is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(mut self) {
        while let Some(envelope) = self.receiver.recv().await {
            match envelope.job {
                Job::RemoveOldPrimaryDomains { .. } => {
                    self.handler.handle(envelope).await;
                }
                Job::ProcessDomainStage { .. } => {
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        handler.handle(envelope).await;
                    });
                }
            }
        }
        info!(stage = "jobs", "job queue closed, runner exiting");
    }

    /// Runs a single delivery.
    pub async fn handle(&self, envelope: JobEnvelope) -> JobOutcome {
        self.handler.handle(envelope).await
    }
}

/// Per-delivery logic shared between the consumer and verification tasks.
struct JobHandler<P> {
    dispatcher: JobDispatcher,
    coordinator: PrimaryDomainCoordinator,
    verifier: Arc<VerificationWorker<P>>,
    max_attempts: u32,
    base_delay: Duration,
}

impl<P> Clone for JobHandler<P> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            coordinator: self.coordinator.clone(),
            verifier: self.verifier.clone(),
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
        }
    }
}

impl<P: Probe + 'static> JobHandler<P> {
    async fn handle(&self, envelope: JobEnvelope) -> JobOutcome {
        let job_name = envelope.job.name();
        match &envelope.job {
            Job::RemoveOldPrimaryDomains { domain_ids } => {
                match self.coordinator.remove_old_primary_domains(domain_ids).await {
                    Ok(demoted) => {
                        debug!(stage = "jobs", job_id = %envelope.id, job = job_name, demoted, "job completed");
                        JobOutcome::Completed
                    }
                    Err(err) => {
                        warn!(stage = "jobs", job_id = %envelope.id, job = job_name, error = %err, "job failed");
                        self.retry_or_give_up(envelope, None).await
                    }
                }
            }
            Job::ProcessDomainStage { domain_id } => {
                let domain_id = *domain_id;
                match self.verifier.process_domain_stage(domain_id).await {
                    Ok(stage) => {
                        debug!(stage = "jobs", job_id = %envelope.id, job = job_name, %domain_id, result = ?stage, "job completed");
                        JobOutcome::Completed
                    }
                    Err(VerificationError::Permanent(reason)) => {
                        info!(stage = "jobs", job_id = %envelope.id, job = job_name, %domain_id, %reason, "verification failed permanently");
                        JobOutcome::Failed
                    }
                    Err(err) => {
                        warn!(stage = "jobs", job_id = %envelope.id, job = job_name, %domain_id, attempt = envelope.attempt, error = %err, "verification attempt failed");
                        self.retry_or_give_up(envelope, Some(domain_id)).await
                    }
                }
            }
        }
    }

    async fn retry_or_give_up(
        &self,
        envelope: JobEnvelope,
        verifying: Option<DomainId>,
    ) -> JobOutcome {
        if envelope.attempt >= self.max_attempts {
            error!(stage = "jobs", job_id = %envelope.id, job = envelope.job.name(), attempts = envelope.attempt, "job exhausted its retries");
            if let Some(domain_id) = verifying {
                if let Err(err) = self.verifier.fail_exhausted(domain_id).await {
                    error!(stage = "jobs", %domain_id, error = %err, "failed to record exhausted verification");
                }
            }
            return JobOutcome::Failed;
        }

        let exponent = envelope.attempt.saturating_sub(1).min(16);
        let delay = self.base_delay * 2u32.pow(exponent);
        counter!("jobs_retried_total", "job" => envelope.job.name()).increment(1);

        let dispatcher = self.dispatcher.clone();
        let next = JobEnvelope {
            attempt: envelope.attempt + 1,
            ..envelope
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = dispatcher.redeliver(next) {
                warn!(stage = "jobs", error = %err, "dropping retry, queue closed");
            }
        });

        JobOutcome::Retrying { delay }
    }
}

/// Queue that records jobs so tests can drain them by hand.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingQueue {
    jobs: std::sync::Mutex<Vec<Job>>,
    closed: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingQueue {
    pub fn drain(&self) -> Vec<Job> {
        std::mem::take(&mut *self.jobs.lock().expect("queue poisoned"))
    }

    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: Job) -> Result<(), EnqueueError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EnqueueError::Closed);
        }
        self.jobs.lock().expect("queue poisoned").push(job);
        Ok(())
    }
}
