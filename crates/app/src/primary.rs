use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use hostmap_core::{Domain, DomainId};
use hostmap_storage::{DomainRepository, DomainStoreError};

use crate::jobs::{Job, JobQueue};
use crate::Clock;

/// Keeps at most one primary domain per site.
///
/// Promotion is synchronous; clearing the previous primaries is handed to
/// the job queue and converges once the queue drains.
#[derive(Clone)]
pub struct PrimaryDomainCoordinator {
    domains: DomainRepository,
    queue: Arc<dyn JobQueue>,
    clock: Clock,
}

impl PrimaryDomainCoordinator {
    pub fn new(domains: DomainRepository, queue: Arc<dyn JobQueue>, clock: Clock) -> Self {
        Self {
            domains,
            queue,
            clock,
        }
    }

    pub async fn promote(&self, domain_id: DomainId) -> Result<Domain, PromoteError> {
        let promotion = self
            .domains
            .promote(domain_id, (self.clock)())
            .await?
            .ok_or(PromoteError::NotFound(domain_id))?;

        info!(
            stage = "primary",
            %domain_id,
            site_id = %promotion.domain.site_id,
            siblings = promotion.siblings.len(),
            "domain promoted"
        );

        if !promotion.siblings.is_empty() {
            let job = Job::RemoveOldPrimaryDomains {
                domain_ids: promotion.siblings.clone(),
            };
            if let Err(err) = self.queue.enqueue(job) {
                warn!(stage = "primary", %domain_id, error = %err, "demotion enqueue failed, demoting inline");
                self.remove_old_primary_domains(&promotion.siblings).await?;
            }
        }

        Ok(promotion.domain)
    }

    /// Job handler: clears the primary flag on each listed row unless it has
    /// since become its site's current primary. Safe to run more than once.
    pub async fn remove_old_primary_domains(
        &self,
        domain_ids: &[DomainId],
    ) -> Result<usize, PromoteError> {
        let mut demoted = 0;
        for &domain_id in domain_ids {
            match self.domains.find_by_id(domain_id).await? {
                Some(row) if row.is_primary => {}
                _ => {
                    debug!(stage = "primary", %domain_id, "sibling gone or already demoted");
                    continue;
                }
            }

            if self
                .domains
                .demote_if_superseded(domain_id, (self.clock)())
                .await?
            {
                demoted += 1;
                counter!("primary_demotions_total").increment(1);
                info!(stage = "primary", %domain_id, "old primary demoted");
            }
        }
        Ok(demoted)
    }
}

#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("domain {0} not found")]
    NotFound(DomainId),
    #[error("domain storage unavailable: {0}")]
    PersistenceUnavailable(#[from] DomainStoreError),
}
