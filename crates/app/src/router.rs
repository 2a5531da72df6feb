use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::warn;

use hostmap_core::{ActivationRecord, CurrentSite, SiteSource};
use hostmap_probe::VERIFY_PATH;

use crate::admin;
use crate::bootstrap::CoreServices;
use crate::hooks::{CompatShim, Runtime};
use crate::host::HostFramework;
use crate::lockdown::ESCAPE_PARAM;
use crate::problem::ProblemResponse;
use crate::resolver::extract_host;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    services: CoreServices,
    runtime: Runtime,
    host: Arc<dyn HostFramework>,
    verify_token: Arc<str>,
    admin_token: Arc<str>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        services: CoreServices,
        runtime: Runtime,
        host: Arc<dyn HostFramework>,
        verify_token: impl Into<Arc<str>>,
        admin_token: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            metrics,
            services,
            runtime,
            host,
            verify_token: verify_token.into(),
            admin_token: admin_token.into(),
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn services(&self) -> &CoreServices {
        &self.services
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/_debug/system-info", get(system_info))
        .route(VERIFY_PATH, get(verify_token))
        .merge(admin::admin_router(state.clone()))
        .fallback(site_info)
        .layer(middleware::from_fn_with_state(state.clone(), lockdown_escape))
        .layer(middleware::from_fn_with_state(state.clone(), resolve_site))
        .with_state(state)
}

/// Attaches the [`CurrentSite`] for the request host. Mapped domains override
/// the host framework's answer; everything else falls through to it.
async fn resolve_site(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let trust_forwarded = state.runtime.has_shim(CompatShim::ForwardedHost);
    if let Some(host) = extract_host(request.headers(), trust_forwarded) {
        let mapped = match &state.runtime.resolver {
            Some(resolver) => resolver.resolve(&host).await,
            None => None,
        };
        let site = mapped.or_else(|| {
            state.host.resolve_site(&host).map(|site_id| CurrentSite {
                site_id,
                host: host.clone(),
                source: SiteSource::Network,
            })
        });
        if let Some(site) = site {
            request.extensions_mut().insert(site);
        }
    }
    next.run(request).await
}

async fn lockdown_escape(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(lockdown) = &state.runtime.lockdown {
        let provided = request.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, _)| name == ESCAPE_PARAM)
                .map(|(_, value)| value.into_owned())
        });
        if let Some(key) = provided {
            if let Err(err) = lockdown.try_escape(&key).await {
                warn!(stage = "lockdown", error = %err, "escape attempt failed");
            }
        }
    }
    next.run(request).await
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn verify_token(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.verify_token.to_string(),
    )
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    activation: ActivationRecord,
    resolver_wired: bool,
    lockdown_enabled: Option<bool>,
    hooks: Vec<&'static str>,
}

async fn system_info(State(state): State<AppState>) -> Result<Json<SystemInfo>, ProblemResponse> {
    let activation = state
        .services
        .activation
        .system_info()
        .await
        .map_err(|err| {
            ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "activation_unavailable",
                err.to_string(),
            )
        })?;
    let lockdown_enabled = state.services.lockdown.is_enabled().await.ok();

    Ok(Json(SystemInfo {
        activation,
        resolver_wired: state.runtime.resolver.is_some(),
        lockdown_enabled,
        hooks: state.runtime.hooks_run.clone(),
    }))
}

#[derive(Debug, Serialize)]
struct SiteInfo {
    site: Option<CurrentSite>,
    extensions: Vec<String>,
}

async fn site_info(
    State(state): State<AppState>,
    site: Option<Extension<CurrentSite>>,
) -> Result<Json<SiteInfo>, ProblemResponse> {
    let Some(Extension(site)) = site else {
        return Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "site_not_found",
            "no site is mapped to this host",
        ));
    };
    let extensions = state.runtime.extensions.active_extensions().await;
    Ok(Json(SiteInfo {
        site: Some(site),
        extensions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::testing::{clock_at, harness};
    use hostmap_core::{SiteId, TapMode};

    async fn get(app: Router, uri: &str, host: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(uri)
                    .header(header::HOST, host)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let h = harness(true).await;
        let (status, _) = get(app_router(h.state), "/healthz", "network.test").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let h = harness(true).await;
        let response = app_router(h.state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn verify_endpoint_serves_the_token() {
        let h = harness(true).await;
        let response = app_router(h.state)
            .oneshot(
                HttpRequest::builder()
                    .uri(VERIFY_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"platform-token");
    }

    #[tokio::test]
    async fn registered_domain_resolves_immediately() {
        let h = harness(true).await;
        let registry = h.state.services().registry.clone();
        registry
            .register("old.example.com", SiteId(42), true)
            .await
            .expect("register old");
        registry
            .register("shop.example.com", SiteId(42), true)
            .await
            .expect("register new");
        let app = app_router(h.state.clone());

        let (status, body) = get(app.clone(), "/", "Shop.Example.com:443").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["site"]["site_id"], 42);
        assert_eq!(body["site"]["source"]["kind"], "mapped");

        let (_, body) = get(app.clone(), "/", "www.shop.example.com").await;
        assert_eq!(body["site"]["site_id"], 42);

        let (_, body) = get(app.clone(), "/", "network.test").await;
        assert_eq!(body["site"]["site_id"], 1);
        assert_eq!(body["site"]["source"]["kind"], "network");

        let (status, body) = get(app, "/", "unknown.example.org").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "site_not_found");
    }

    #[tokio::test]
    async fn inactive_bootstrap_leaves_resolution_to_host() {
        let h = harness(false).await;
        assert!(h.state.runtime().resolver.is_none());
        h.state
            .services()
            .registry
            .register("shop.example.com", SiteId(42), false)
            .await
            .expect("register");

        let (status, _) = get(app_router(h.state), "/", "shop.example.com").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lockdown_hides_extensions_until_escape_key() {
        let h = harness(true).await;
        let lockdown = h.state.services().lockdown.clone();
        lockdown.toggle(true).await.expect("toggle");
        let app = app_router(h.state.clone());

        let (_, body) = get(app.clone(), "/", "network.test").await;
        assert_eq!(body["extensions"], serde_json::json!(["hostmap"]));

        let (_, body) = get(app.clone(), "/?hostmap_unlock=wrong", "network.test").await;
        assert_eq!(body["extensions"], serde_json::json!(["hostmap"]));

        let key = lockdown.current_key(clock_at(0)()).expect("key");
        let (_, body) = get(app, &format!("/?{ESCAPE_PARAM}={key}"), "network.test").await;
        assert_eq!(body["extensions"], serde_json::json!(["hostmap", "seo-pack"]));
        assert!(!lockdown.is_enabled().await.expect("flag"));
    }

    #[tokio::test]
    async fn system_info_reports_activation() {
        let h = harness(true).await;
        let (status, body) = get(app_router(h.state.clone()), "/_debug/system-info", "network.test").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["activation"]["active"], true);
        assert_eq!(body["resolver_wired"], true);
        assert_eq!(
            body["hooks"],
            serde_json::json!(["hostmap.resolver", "hostmap.post_ready"])
        );

        h.state
            .services()
            .activation
            .tap(TapMode::Deactivating)
            .await
            .expect("tap");
        let (_, body) = get(app_router(h.state), "/_debug/system-info", "network.test").await;
        assert_eq!(body["activation"]["active"], false);
    }
}
