//! Fixtures shared by the unit tests of this crate.

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::StatusCode;
use tempfile::TempDir;

use hostmap_core::{DomainId, SiteId};
use hostmap_probe::{Probe, ProbeError};
use hostmap_storage::{Database, DomainInsertOutcome, NewDomain};
use hostmap_util::DomainSettings;

use crate::bootstrap::{BootstrapLoader, CoreServices};
use crate::hooks::{HookPoint, HookRegistry, RuntimeBuilder};
use crate::host::{HostError, HostFramework};
use crate::jobs::RecordingQueue;
use crate::router::AppState;
use crate::telemetry;
use crate::Clock;

pub async fn setup_db() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("hostmap.db").display());
    let db = Database::connect(&url).await.expect("connect");
    db.run_migrations().await.expect("migrations");
    (db, dir)
}

fn epoch_plus(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid date")
        + ChronoDuration::seconds(secs)
}

/// Fixed clock `secs` after a reference instant.
pub fn clock_at(secs: i64) -> Clock {
    let now = epoch_plus(secs);
    Arc::new(move || now)
}

/// Clock tests can move forward by hand.
#[derive(Clone)]
pub struct TestClock {
    offset: Arc<AtomicI64>,
}

impl TestClock {
    pub fn new(secs: i64) -> Self {
        Self {
            offset: Arc::new(AtomicI64::new(secs)),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.offset.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn as_clock(&self) -> Clock {
        let offset = self.offset.clone();
        Arc::new(move || epoch_plus(offset.load(Ordering::SeqCst)))
    }
}

pub async fn insert_domain(db: &Database, domain: &str, site_id: i64) -> DomainId {
    match db
        .domains()
        .insert(&NewDomain {
            domain: Cow::Borrowed(domain),
            site_id: SiteId(site_id),
            created_at: epoch_plus(0),
        })
        .await
        .expect("insert")
    {
        DomainInsertOutcome::Inserted(row) => row.id,
        other => panic!("unexpected {other:?}"),
    }
}

enum Script {
    Reachable { https: bool },
    Transient,
    Permanent,
    Hanging,
}

/// Probe with a canned answer.
pub struct ScriptedProbe {
    script: Script,
}

impl ScriptedProbe {
    pub fn reachable(https: bool) -> Self {
        Self {
            script: Script::Reachable { https },
        }
    }

    pub fn transient() -> Self {
        Self {
            script: Script::Transient,
        }
    }

    pub fn permanent() -> Self {
        Self {
            script: Script::Permanent,
        }
    }

    pub fn hanging() -> Self {
        Self {
            script: Script::Hanging,
        }
    }
}

impl Probe for ScriptedProbe {
    async fn check_reachable(&self, _host: &str) -> Result<(), ProbeError> {
        match self.script {
            Script::Reachable { .. } => Ok(()),
            Script::Transient => Err(ProbeError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
            }),
            Script::Permanent => Err(ProbeError::TokenMismatch),
            Script::Hanging => std::future::pending().await,
        }
    }

    async fn check_https(&self, _host: &str) -> bool {
        matches!(self.script, Script::Reachable { https: true })
    }
}

/// Host framework with state tests can flip.
pub struct StaticHost {
    pub setup_finished: AtomicBool,
    pub module_loaded: AtomicBool,
    pub broken: AtomicBool,
    pub extensions: Vec<String>,
}

impl StaticHost {
    pub fn new(setup_finished: bool, module_loaded: bool) -> Self {
        Self {
            setup_finished: AtomicBool::new(setup_finished),
            module_loaded: AtomicBool::new(module_loaded),
            broken: AtomicBool::new(false),
            extensions: vec!["hostmap".to_string(), "seo-pack".to_string()],
        }
    }

    fn check(&self) -> Result<(), HostError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(HostError::Unavailable("options table offline".to_string()));
        }
        Ok(())
    }
}

impl HostFramework for StaticHost {
    fn setup_finished(&self) -> Result<bool, HostError> {
        self.check()?;
        Ok(self.setup_finished.load(Ordering::SeqCst))
    }

    fn is_module_loaded(&self) -> Result<bool, HostError> {
        self.check()?;
        Ok(self.module_loaded.load(Ordering::SeqCst))
    }

    fn resolve_site(&self, host: &str) -> Option<SiteId> {
        (host == "network.test").then_some(SiteId(1))
    }

    fn extensions(&self) -> Vec<String> {
        self.extensions.clone()
    }
}

pub const ADMIN_TOKEN: &str = "admin-token";

pub fn app_settings() -> DomainSettings {
    DomainSettings {
        alias_prefixes: vec!["www.".to_string()],
        trust_forwarded_host: false,
        lockdown_secret: "lock-secret".to_string(),
        verify_token: "platform-token".to_string(),
        admin_token: ADMIN_TOKEN.to_string(),
        bootstrap_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_secs(1),
        job_max_attempts: 3,
    }
}

/// Fully bootstrapped application state over a temporary database.
pub struct Harness {
    pub state: AppState,
    pub queue: Arc<RecordingQueue>,
    pub db: Database,
    _dir: TempDir,
}

pub async fn harness(activate: bool) -> Harness {
    let (db, dir) = setup_db().await;
    let settings = app_settings();
    let queue = Arc::new(RecordingQueue::default());
    let services = CoreServices::load(
        &db,
        &settings,
        vec!["hostmap".to_string(), "seo-pack".to_string()],
        queue.clone(),
        clock_at(0),
    );
    let host = Arc::new(StaticHost::new(true, activate));

    let loader = BootstrapLoader::new(host.clone(), services.clone(), settings.bootstrap_timeout);
    let mut hooks = HookRegistry::new();
    loader.run(&mut hooks).await;
    let mut builder = RuntimeBuilder::new(services.extensions.clone());
    hooks.fire(HookPoint::MultisiteReady, &mut builder);
    hooks.fire(HookPoint::PostReady, &mut builder);

    let metrics = telemetry::init_metrics().expect("metrics init");
    let state = AppState::new(
        metrics,
        services,
        builder.build(),
        host,
        settings.verify_token.as_str(),
        settings.admin_token.as_str(),
    );
    Harness {
        state,
        queue,
        db,
        _dir: dir,
    }
}
