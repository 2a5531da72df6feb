use std::{borrow::Cow, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, warn};

use hostmap_core::{
    hostname::{parse_domain, HostnameError},
    verification::StageEvent,
    Domain, DomainId, DomainStage, SiteId,
};
use hostmap_storage::{DomainInsertOutcome, DomainRepository, DomainStoreError, NewDomain};

use crate::jobs::{EnqueueError, Job, JobQueue};
use crate::primary::{PrimaryDomainCoordinator, PromoteError};
use crate::Clock;

/// Authoritative store of domain to site mappings.
#[derive(Clone)]
pub struct DomainRegistry {
    domains: DomainRepository,
    coordinator: PrimaryDomainCoordinator,
    queue: Arc<dyn JobQueue>,
    clock: Clock,
}

impl DomainRegistry {
    pub fn new(
        domains: DomainRepository,
        coordinator: PrimaryDomainCoordinator,
        queue: Arc<dyn JobQueue>,
        clock: Clock,
    ) -> Self {
        Self {
            domains,
            coordinator,
            queue,
            clock,
        }
    }

    /// Maps `domain` to `site_id`, optionally making it the site's primary.
    ///
    /// Registering a name the site already owns returns the existing row.
    pub async fn register(
        &self,
        domain: &str,
        site_id: SiteId,
        make_primary: bool,
    ) -> Result<Domain, RegistryError> {
        let normalized = parse_domain(domain).map_err(|source| RegistryError::InvalidDomain {
            domain: domain.to_string(),
            source,
        })?;

        let outcome = self
            .domains
            .insert(&NewDomain {
                domain: Cow::Borrowed(normalized.as_str()),
                site_id,
                created_at: (self.clock)(),
            })
            .await?;

        let row = match outcome {
            DomainInsertOutcome::Existing(existing) if existing.site_id != site_id => {
                warn!(stage = "registry", domain = %normalized, requested = %site_id, owner = %existing.site_id, "domain already mapped");
                return Err(RegistryError::DuplicateDomain {
                    domain: normalized,
                    site_id: existing.site_id,
                });
            }
            DomainInsertOutcome::Existing(existing) => {
                debug!(stage = "registry", domain = %normalized, %site_id, "domain already registered to site");
                if make_primary && !existing.is_primary {
                    return Ok(self.coordinator.promote(existing.id).await?);
                }
                return Ok(existing);
            }
            DomainInsertOutcome::Inserted(row) => row,
        };

        info!(stage = "registry", domain_id = %row.id, domain = %row.domain, %site_id, make_primary, "domain registered");

        let row = if make_primary {
            self.coordinator.promote(row.id).await?
        } else {
            row
        };

        match self.request_check(row.id).await {
            Ok(checking) => Ok(checking),
            Err(err) => {
                warn!(stage = "registry", domain_id = %row.id, error = %err, "verification not scheduled");
                Ok(row)
            }
        }
    }

    /// Removes a mapping. Removing the primary leaves the site without one.
    pub async fn deregister(&self, domain_id: DomainId) -> Result<(), RegistryError> {
        if !self.domains.delete(domain_id).await? {
            return Err(RegistryError::NotFound(domain_id));
        }
        info!(stage = "registry", %domain_id, "domain deregistered");
        Ok(())
    }

    /// Drops every mapping of a deleted site.
    pub async fn deregister_site(&self, site_id: SiteId) -> Result<u64, RegistryError> {
        let removed = self.domains.delete_for_site(site_id).await?;
        info!(stage = "registry", %site_id, removed, "site mappings removed");
        Ok(removed)
    }

    /// Exact lookup on an already normalized host.
    pub async fn find_by_host(&self, host: &str) -> Result<Option<Domain>, RegistryError> {
        Ok(self.domains.find_by_domain(host).await?)
    }

    pub async fn list_for_site(&self, site_id: SiteId) -> Result<Vec<Domain>, RegistryError> {
        Ok(self.domains.list_for_site(site_id).await?)
    }

    pub async fn primary_for_site(&self, site_id: SiteId) -> Result<Option<Domain>, RegistryError> {
        Ok(self.domains.primary_for_site(site_id).await?)
    }

    /// Moves the domain to `Checking` and schedules a verification run.
    pub async fn request_check(&self, domain_id: DomainId) -> Result<Domain, RegistryError> {
        let domain = self
            .domains
            .find_by_id(domain_id)
            .await?
            .ok_or(RegistryError::NotFound(domain_id))?;

        self.schedule_check(&domain).await?;

        self.domains
            .find_by_id(domain_id)
            .await?
            .ok_or(RegistryError::NotFound(domain_id))
    }

    /// Schedules verification for `domain` as last read. The stage is only
    /// rolled back on enqueue failure when this call moved it to `Checking`.
    async fn schedule_check(&self, domain: &Domain) -> Result<(), RegistryError> {
        let previous = domain.stage;
        let mut moved = false;
        if previous != DomainStage::Checking {
            let next = previous
                .apply(StageEvent::Enqueued)
                .unwrap_or(DomainStage::Checking);
            moved = self
                .domains
                .transition_stage(domain.id, previous, next, None, (self.clock)())
                .await?;
            if !moved {
                debug!(stage = "registry", domain_id = %domain.id, "stage moved concurrently");
            }
        }

        if let Err(err) = self.queue.enqueue(Job::ProcessDomainStage { domain_id: domain.id }) {
            if moved {
                self.domains
                    .transition_stage(domain.id, DomainStage::Checking, previous, None, (self.clock)())
                    .await?;
            }
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("'{domain}' is not a valid domain: {source}")]
    InvalidDomain {
        domain: String,
        #[source]
        source: HostnameError,
    },
    #[error("'{domain}' is already mapped to site {site_id}")]
    DuplicateDomain { domain: String, site_id: SiteId },
    #[error("domain {0} not found")]
    NotFound(DomainId),
    #[error("could not schedule verification: {0}")]
    Queue(#[from] EnqueueError),
    #[error("domain storage unavailable: {0}")]
    PersistenceUnavailable(#[from] DomainStoreError),
}

impl From<PromoteError> for RegistryError {
    fn from(err: PromoteError) -> Self {
        match err {
            PromoteError::NotFound(id) => Self::NotFound(id),
            PromoteError::PersistenceUnavailable(inner) => Self::PersistenceUnavailable(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RecordingQueue;
    use crate::testing::{clock_at, setup_db};

    struct Fixture {
        registry: DomainRegistry,
        coordinator: PrimaryDomainCoordinator,
        queue: Arc<RecordingQueue>,
        db: hostmap_storage::Database,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (db, dir) = setup_db().await;
        let queue = Arc::new(RecordingQueue::default());
        let coordinator = PrimaryDomainCoordinator::new(db.domains(), queue.clone(), clock_at(0));
        let registry =
            DomainRegistry::new(db.domains(), coordinator.clone(), queue.clone(), clock_at(0));
        Fixture {
            registry,
            coordinator,
            queue,
            db,
            _dir: dir,
        }
    }

    impl Fixture {
        async fn drain_demotions(&self) {
            for job in self.queue.drain() {
                if let Job::RemoveOldPrimaryDomains { domain_ids } = job {
                    self.coordinator
                        .remove_old_primary_domains(&domain_ids)
                        .await
                        .expect("demote");
                }
            }
        }
    }

    #[tokio::test]
    async fn register_then_find_by_host() {
        let f = fixture().await;
        let row = f
            .registry
            .register("Shop.Example.com.", SiteId(42), false)
            .await
            .expect("register");
        assert_eq!(row.domain, "shop.example.com");
        assert_eq!(row.stage, DomainStage::Checking);
        assert!(!row.is_secure);

        let found = f
            .registry
            .find_by_host("shop.example.com")
            .await
            .expect("lookup")
            .expect("mapped");
        assert_eq!(found.site_id, SiteId(42));
        assert_eq!(
            f.queue.drain(),
            vec![Job::ProcessDomainStage { domain_id: row.id }]
        );
    }

    #[tokio::test]
    async fn duplicate_on_other_site_leaves_registry_unchanged() {
        let f = fixture().await;
        f.registry
            .register("shop.example.com", SiteId(42), false)
            .await
            .expect("register");
        let before = f.registry.list_for_site(SiteId(42)).await.expect("list");

        let err = f
            .registry
            .register("shop.example.com", SiteId(7), true)
            .await
            .expect_err("duplicate");
        assert!(matches!(
            err,
            RegistryError::DuplicateDomain { site_id: SiteId(42), .. }
        ));
        assert_eq!(f.registry.list_for_site(SiteId(42)).await.expect("list"), before);
        assert!(f.registry.list_for_site(SiteId(7)).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn reregistering_on_same_site_is_a_noop() {
        let f = fixture().await;
        let first = f
            .registry
            .register("shop.example.com", SiteId(42), false)
            .await
            .expect("register");
        f.queue.drain();

        let again = f
            .registry
            .register("shop.example.com", SiteId(42), false)
            .await
            .expect("repeat");
        assert_eq!(again, first);
        assert!(f.queue.drain().is_empty());

        let promoted = f
            .registry
            .register("shop.example.com", SiteId(42), true)
            .await
            .expect("promote on repeat");
        assert!(promoted.is_primary);
    }

    #[tokio::test]
    async fn invalid_domain_is_rejected() {
        let f = fixture().await;
        for raw in ["", "localhost", "-bad-.example.com", "10.0.0.1", "shop..example.com"] {
            let err = f
                .registry
                .register(raw, SiteId(1), false)
                .await
                .expect_err(raw);
            assert!(matches!(err, RegistryError::InvalidDomain { .. }), "{raw}");
        }
    }

    #[tokio::test]
    async fn new_primary_demotes_the_old_one_after_drain() {
        let f = fixture().await;
        let old = f
            .registry
            .register("old.example.com", SiteId(42), true)
            .await
            .expect("register old");
        let new = f
            .registry
            .register("shop.example.com", SiteId(42), true)
            .await
            .expect("register new");
        assert!(new.is_primary);

        let current = f
            .registry
            .primary_for_site(SiteId(42))
            .await
            .expect("lookup")
            .expect("primary");
        assert_eq!(current.id, new.id);

        f.drain_demotions().await;
        let old_row = f
            .db
            .domains()
            .find_by_id(old.id)
            .await
            .expect("lookup")
            .expect("row");
        assert!(!old_row.is_primary);
    }

    #[tokio::test]
    async fn deregistering_primary_leaves_no_primary() {
        let f = fixture().await;
        let row = f
            .registry
            .register("shop.example.com", SiteId(42), true)
            .await
            .expect("register");
        f.registry
            .register("alt.example.com", SiteId(42), false)
            .await
            .expect("register");

        f.registry.deregister(row.id).await.expect("deregister");
        assert!(f
            .registry
            .primary_for_site(SiteId(42))
            .await
            .expect("lookup")
            .is_none());
        assert!(matches!(
            f.registry.deregister(row.id).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deregister_site_cascades() {
        let f = fixture().await;
        f.registry
            .register("a.example.com", SiteId(42), false)
            .await
            .expect("register");
        f.registry
            .register("b.example.com", SiteId(42), false)
            .await
            .expect("register");
        assert_eq!(f.registry.deregister_site(SiteId(42)).await.expect("cascade"), 2);
        assert!(f
            .registry
            .find_by_host("a.example.com")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn request_check_reverts_when_queue_closed() {
        let f = fixture().await;
        f.queue.close();
        let row = f
            .registry
            .register("shop.example.com", SiteId(42), false)
            .await
            .expect("register survives queue outage");
        assert_eq!(row.stage, DomainStage::Pending);

        let err = f.registry.request_check(row.id).await.expect_err("closed");
        assert!(matches!(err, RegistryError::Queue(_)));
        let stored = f
            .registry
            .find_by_host("shop.example.com")
            .await
            .expect("lookup")
            .expect("row");
        assert_eq!(stored.stage, DomainStage::Pending);
    }

    #[tokio::test]
    async fn failed_enqueue_keeps_a_check_started_elsewhere() {
        let f = fixture().await;
        f.queue.close();
        let row = f
            .registry
            .register("shop.example.com", SiteId(42), false)
            .await
            .expect("register");
        assert_eq!(row.stage, DomainStage::Pending);

        // A worker picks the row up between our read and our transition.
        assert!(f
            .db
            .domains()
            .transition_stage(row.id, DomainStage::Pending, DomainStage::Checking, None, row.updated_at)
            .await
            .expect("worker transition"));

        let err = f.registry.schedule_check(&row).await.expect_err("closed");
        assert!(matches!(err, RegistryError::Queue(_)));
        let stored = f
            .registry
            .find_by_host("shop.example.com")
            .await
            .expect("lookup")
            .expect("row");
        assert_eq!(stored.stage, DomainStage::Checking);
    }
}
