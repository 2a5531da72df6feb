mod activation;
mod admin;
mod bootstrap;
mod hooks;
mod host;
mod jobs;
mod lockdown;
mod primary;
mod problem;
mod registry;
mod resolver;
mod router;
mod telemetry;
#[cfg(test)]
mod testing;
mod verification;

use std::{net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use hostmap_probe::HttpProbe;
use hostmap_storage::Database;
use hostmap_util::{load_env_file, AppConfig};

use crate::bootstrap::{BootstrapLoader, CoreServices};
use crate::hooks::{HookPoint, HookRegistry, RuntimeBuilder};
use crate::host::{ConfiguredHost, HostFramework};
use crate::jobs::{JobDispatcher, JobQueue, JobRunner};
use crate::verification::VerificationWorker;

/// Source of "now" shared by every component.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let clock: Clock = Arc::new(Utc::now);
    let (dispatcher, receiver) = JobDispatcher::channel();
    let queue: Arc<dyn JobQueue> = Arc::new(dispatcher.clone());
    let host = Arc::new(ConfiguredHost::new(config.host.clone()));

    let services = CoreServices::load(
        &database,
        &config.domains,
        host.extensions(),
        queue,
        clock.clone(),
    );

    let loader = BootstrapLoader::new(
        host.clone(),
        services.clone(),
        config.domains.bootstrap_timeout,
    );
    let mut hooks = HookRegistry::new();
    let report = loader.run(&mut hooks).await;

    let mut builder = RuntimeBuilder::new(services.extensions.clone());
    hooks.fire(HookPoint::MultisiteReady, &mut builder);
    hooks.fire(HookPoint::PostReady, &mut builder);
    let runtime = builder.build();

    let http = reqwest::Client::builder()
        .timeout(config.domains.probe_timeout)
        .build()?;
    let probe = HttpProbe::new(http, config.domains.verify_token.clone());
    let verifier = Arc::new(VerificationWorker::new(
        database.domains(),
        Arc::new(probe),
        config.domains.probe_timeout,
        clock,
    ));
    let _runner = JobRunner::new(
        receiver,
        dispatcher,
        services.coordinator.clone(),
        verifier,
        config.domains.job_max_attempts,
    )
    .spawn();

    if let Err(err) = services.reconcile_jobs().await {
        warn!(stage = "app", error = %err, "leftover job reconciliation failed");
    }

    let host: Arc<dyn HostFramework> = host;
    let state = router::AppState::new(
        metrics,
        services,
        runtime,
        host,
        config.domains.verify_token.as_str(),
        config.domains.admin_token.as_str(),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        should_start = report.should_start,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
