use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use hostmap_core::{hostname::AliasTable, TapMode};
use hostmap_storage::{Database, DomainRepository, DomainStoreError};
use hostmap_util::{config::PLATFORM_MODULE, DomainSettings};

use crate::activation::ActivationStore;
use crate::hooks::{CompatShim, HookPoint, HookRegistry, DEFAULT_PRIORITY, LOWEST_PRIORITY};
use crate::host::HostFramework;
use crate::jobs::{EnqueueError, Job, JobQueue};
use crate::lockdown::{ExtensionLoader, LockdownSwitch};
use crate::primary::{PrimaryDomainCoordinator, PromoteError};
use crate::registry::DomainRegistry;
use crate::resolver::HostResolver;
use crate::Clock;

/// Everything the bootstrap path and the request path need, wired in a
/// fixed order.
#[derive(Clone)]
pub struct CoreServices {
    pub activation: ActivationStore,
    pub domains: DomainRepository,
    pub coordinator: PrimaryDomainCoordinator,
    pub registry: DomainRegistry,
    pub resolver: HostResolver,
    pub lockdown: LockdownSwitch,
    pub extensions: ExtensionLoader,
    pub queue: Arc<dyn JobQueue>,
    pub trust_forwarded_host: bool,
}

impl CoreServices {
    pub fn load(
        db: &Database,
        settings: &DomainSettings,
        extensions: Vec<String>,
        queue: Arc<dyn JobQueue>,
        clock: Clock,
    ) -> Self {
        let activation = ActivationStore::new(db.options(), clock.clone());
        let domains = db.domains();
        let coordinator = PrimaryDomainCoordinator::new(domains.clone(), queue.clone(), clock.clone());
        let registry = DomainRegistry::new(domains.clone(), coordinator.clone(), queue.clone(), clock.clone());
        let resolver = HostResolver::new(
            domains.clone(),
            AliasTable::new(settings.alias_prefixes.iter().cloned()),
        );
        let lockdown = LockdownSwitch::new(db.options(), &settings.lockdown_secret, clock);
        let extensions = ExtensionLoader::new(extensions, PLATFORM_MODULE);

        Self {
            activation,
            domains,
            coordinator,
            registry,
            resolver,
            lockdown,
            extensions,
            queue,
            trust_forwarded_host: settings.trust_forwarded_host,
        }
    }

    /// Re-enqueues work a previous process left behind: demotions for
    /// superseded primaries and verification for unsettled rows. The job
    /// queue lives in memory, so this runs once at startup.
    pub async fn reconcile_jobs(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        let superseded = self.domains.superseded_primaries().await?;
        if !superseded.is_empty() {
            report.demotions = superseded.len();
            let job = Job::RemoveOldPrimaryDomains {
                domain_ids: superseded.clone(),
            };
            if let Err(err) = self.queue.enqueue(job) {
                warn!(stage = "bootstrap", error = %err, "demotion enqueue failed, demoting inline");
                self.coordinator.remove_old_primary_domains(&superseded).await?;
            }
        }

        for domain_id in self.domains.unsettled().await? {
            self.queue.enqueue(Job::ProcessDomainStage { domain_id })?;
            report.verifications += 1;
        }

        info!(
            stage = "bootstrap",
            demotions = report.demotions,
            verifications = report.verifications,
            "leftover jobs re-enqueued"
        );
        Ok(report)
    }
}

/// Counts of jobs re-enqueued by [`CoreServices::reconcile_jobs`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub demotions: usize,
    pub verifications: usize,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("domain storage unavailable: {0}")]
    PersistenceUnavailable(#[from] DomainStoreError),
    #[error("failed to clear old primaries: {0}")]
    Demotion(#[from] PromoteError),
    #[error("failed to enqueue verification: {0}")]
    Queue(#[from] EnqueueError),
}

/// Outcome of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub should_start: bool,
    pub drift_corrected: Option<TapMode>,
    pub degraded: bool,
}

/// Early-startup entry point: heals activation drift, then decides whether
/// domain resolution is wired in.
pub struct BootstrapLoader<H> {
    host: Arc<H>,
    services: CoreServices,
    timeout: Duration,
    healed: AtomicBool,
}

impl<H: HostFramework> BootstrapLoader<H> {
    pub fn new(host: Arc<H>, services: CoreServices, timeout: Duration) -> Self {
        Self {
            host,
            services,
            timeout,
            healed: AtomicBool::new(false),
        }
    }

    /// Never fails: every unreadable input counts as "do not start".
    pub async fn run(&self, hooks: &mut HookRegistry) -> BootstrapReport {
        let mut degraded = false;
        let drift_corrected = self.heal_drift(&mut degraded).await;

        let setup_finished = match self.host.setup_finished() {
            Ok(finished) => finished,
            Err(err) => {
                warn!(stage = "bootstrap", error = %err, "setup state unreadable");
                degraded = true;
                false
            }
        };

        let active = if setup_finished {
            match self.bounded(self.services.activation.read()).await {
                Some(Ok(record)) => record.active,
                Some(Err(err)) => {
                    warn!(stage = "bootstrap", error = %err, "activation record unreadable");
                    degraded = true;
                    false
                }
                None => {
                    warn!(stage = "bootstrap", timeout_ms = self.timeout.as_millis() as u64, "activation read timed out");
                    degraded = true;
                    false
                }
            }
        } else {
            false
        };

        let should_start = setup_finished && active;
        if should_start {
            self.register_hooks(hooks);
        }

        let report = BootstrapReport {
            should_start,
            drift_corrected,
            degraded,
        };
        info!(
            stage = "bootstrap",
            should_start,
            setup_finished,
            active,
            drift = ?drift_corrected,
            degraded,
            "bootstrap finished"
        );
        report
    }

    async fn bounded<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::time::timeout(self.timeout, future).await.ok()
    }

    async fn heal_drift(&self, degraded: &mut bool) -> Option<TapMode> {
        if self.healed.swap(true, Ordering::SeqCst) {
            return None;
        }

        let loaded = match self.host.is_module_loaded() {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(stage = "bootstrap", error = %err, "module state unreadable, skipping self-heal");
                *degraded = true;
                return None;
            }
        };

        let record = match self.bounded(self.services.activation.read()).await {
            Some(Ok(record)) => record,
            Some(Err(err)) => {
                warn!(stage = "bootstrap", error = %err, "activation record unreadable, skipping self-heal");
                *degraded = true;
                return None;
            }
            None => {
                warn!(stage = "bootstrap", "activation read timed out, skipping self-heal");
                *degraded = true;
                return None;
            }
        };

        if record.active == loaded {
            return None;
        }

        let mode = TapMode::for_loaded(loaded);
        match self.bounded(self.services.activation.maybe_tap(mode)).await {
            Some(true) => {
                info!(stage = "bootstrap", %mode, "activation drift corrected");
                Some(mode)
            }
            Some(false) => None,
            None => {
                warn!(stage = "bootstrap", %mode, "self-heal timed out");
                *degraded = true;
                None
            }
        }
    }

    fn register_hooks(&self, hooks: &mut HookRegistry) {
        let resolver = self.services.resolver.clone();
        hooks.register(
            HookPoint::MultisiteReady,
            DEFAULT_PRIORITY,
            "hostmap.resolver",
            move |runtime| {
                runtime.install_resolver(resolver);
            },
        );

        let lockdown = self.services.lockdown.clone();
        let trust_forwarded = self.services.trust_forwarded_host;
        hooks.register(
            HookPoint::PostReady,
            LOWEST_PRIORITY,
            "hostmap.post_ready",
            move |runtime| {
                if trust_forwarded {
                    runtime.add_shim(CompatShim::ForwardedHost);
                }
                runtime.install_lockdown(lockdown);
            },
        );
    }
}
