use std::{sync::Arc, time::Duration};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use hostmap_core::{
    hostname::validate_hostname,
    verification::{StageEvent, TransitionError},
    Domain, DomainId, DomainStage,
};
use hostmap_probe::Probe;
use hostmap_storage::{DomainRepository, DomainStoreError};

use crate::Clock;

/// Drives a domain through the verification stages.
pub struct VerificationWorker<P> {
    domains: DomainRepository,
    probe: Arc<P>,
    probe_timeout: Duration,
    clock: Clock,
}

impl<P: Probe> VerificationWorker<P> {
    pub fn new(domains: DomainRepository, probe: Arc<P>, probe_timeout: Duration, clock: Clock) -> Self {
        Self {
            domains,
            probe,
            probe_timeout,
            clock,
        }
    }

    /// Job handler for `process_domain_stage`.
    ///
    /// Returns the stage the domain settled in, or `None` when the domain
    /// was deleted or another delivery already moved it on.
    pub async fn process_domain_stage(
        &self,
        domain_id: DomainId,
    ) -> Result<Option<DomainStage>, VerificationError> {
        let Some(domain) = self.domains.find_by_id(domain_id).await? else {
            debug!(stage = "verify", %domain_id, "domain deleted before verification");
            return Ok(None);
        };

        if domain.stage != DomainStage::Checking {
            let next = domain.stage.apply(StageEvent::Enqueued)?;
            if !self
                .domains
                .transition_stage(domain_id, domain.stage, next, None, (self.clock)())
                .await?
            {
                debug!(stage = "verify", %domain_id, "stage changed underneath, skipping");
                return Ok(None);
            }
        }

        if let Err(err) = validate_hostname(&domain.domain) {
            self.settle(&domain, StageEvent::ProbeFailed, false).await?;
            return Err(VerificationError::Permanent(err.to_string()));
        }

        match tokio::time::timeout(self.probe_timeout, self.probe.check_reachable(&domain.domain)).await {
            Err(_) => {
                counter!("domain_verification_total", "outcome" => "transient").increment(1);
                Err(VerificationError::Transient(format!(
                    "probe timed out after {:?}",
                    self.probe_timeout
                )))
            }
            Ok(Err(err)) if err.is_transient() => {
                counter!("domain_verification_total", "outcome" => "transient").increment(1);
                Err(VerificationError::Transient(err.to_string()))
            }
            Ok(Err(err)) => {
                self.settle(&domain, StageEvent::ProbeFailed, false).await?;
                Err(VerificationError::Permanent(err.to_string()))
            }
            Ok(Ok(())) => {
                let secure = tokio::time::timeout(self.probe_timeout, self.probe.check_https(&domain.domain))
                    .await
                    .unwrap_or(false);
                self.settle(&domain, StageEvent::ProbeSucceeded, secure).await
            }
        }
    }

    /// Records that the job system gave up on a domain still in `Checking`.
    pub async fn fail_exhausted(&self, domain_id: DomainId) -> Result<bool, VerificationError> {
        let to = DomainStage::Checking.apply(StageEvent::TimedOut)?;
        let changed = self
            .domains
            .transition_stage(domain_id, DomainStage::Checking, to, Some(false), (self.clock)())
            .await?;
        if changed {
            counter!("domain_verification_total", "outcome" => "exhausted").increment(1);
            warn!(stage = "verify", %domain_id, "verification exhausted, domain marked error");
        }
        Ok(changed)
    }

    async fn settle(
        &self,
        domain: &Domain,
        event: StageEvent,
        secure: bool,
    ) -> Result<Option<DomainStage>, VerificationError> {
        let to = DomainStage::Checking.apply(event)?;
        let changed = self
            .domains
            .transition_stage(domain.id, DomainStage::Checking, to, Some(secure), (self.clock)())
            .await?;
        if !changed {
            debug!(stage = "verify", domain_id = %domain.id, "verdict already recorded");
            return Ok(None);
        }

        counter!("domain_verification_total", "outcome" => to.as_str()).increment(1);
        info!(
            stage = "verify",
            domain_id = %domain.id,
            domain = %domain.domain,
            result = %to,
            is_secure = secure,
            "verification settled"
        );
        Ok(Some(to))
    }
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification failed, will retry: {0}")]
    Transient(String),
    #[error("verification failed: {0}")]
    Permanent(String),
    #[error("domain storage unavailable: {0}")]
    PersistenceUnavailable(#[from] DomainStoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}
