use axum::{
    extract::{Path, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use hostmap_core::{activation::UnknownTapMode, Domain, DomainId, SiteId, TapMode};

use crate::activation::ActivationError;
use crate::lockdown::LockdownError;
use crate::primary::PromoteError;
use crate::problem::ProblemResponse;
use crate::registry::RegistryError;
use crate::router::AppState;

/// Domain management, lockdown and lifecycle routes. Every route requires
/// `Authorization: Bearer <admin token>`.
pub fn admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/_admin/domains", post(register_domain))
        .route("/_admin/domains/:id", delete(deregister_domain))
        .route("/_admin/domains/:id/check", post(request_check))
        .route("/_admin/domains/:id/promote", post(promote_domain))
        .route(
            "/_admin/sites/:id/domains",
            get(list_site_domains).delete(deregister_site),
        )
        .route("/_admin/lockdown", post(toggle_lockdown))
        .route("/_admin/lockdown/key", get(lockdown_key))
        .route("/_lifecycle/tap/:mode", post(tap))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let authorized = provided.is_some_and(|token| {
        bool::from(token.as_bytes().ct_eq(state.admin_token().as_bytes()))
    });
    if !authorized {
        warn!(stage = "admin", path = %request.uri().path(), "admin request rejected");
        return ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "a valid admin bearer token is required",
        )
        .into_response();
    }
    next.run(request).await
}

fn registry_problem(err: RegistryError) -> ProblemResponse {
    let (status, problem_type) = match &err {
        RegistryError::InvalidDomain { .. } => (StatusCode::BAD_REQUEST, "invalid_domain"),
        RegistryError::DuplicateDomain { .. } => (StatusCode::CONFLICT, "duplicate_domain"),
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "domain_not_found"),
        RegistryError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable"),
        RegistryError::PersistenceUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
        }
    };
    ProblemResponse::new(status, problem_type, err.to_string())
}

fn lockdown_problem(err: LockdownError) -> ProblemResponse {
    match err {
        LockdownError::PersistenceUnavailable(_) => ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            err.to_string(),
        ),
        LockdownError::Key => ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "escape_key_unavailable",
            err.to_string(),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterDomain {
    domain: String,
    site_id: SiteId,
    #[serde(default)]
    make_primary: bool,
}

async fn register_domain(
    State(state): State<AppState>,
    Json(body): Json<RegisterDomain>,
) -> Result<(StatusCode, Json<Domain>), ProblemResponse> {
    let domain = state
        .services()
        .registry
        .register(&body.domain, body.site_id, body.make_primary)
        .await
        .map_err(registry_problem)?;
    Ok((StatusCode::CREATED, Json(domain)))
}

async fn deregister_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<DomainId>,
) -> Result<StatusCode, ProblemResponse> {
    state
        .services()
        .registry
        .deregister(domain_id)
        .await
        .map_err(registry_problem)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn request_check(
    State(state): State<AppState>,
    Path(domain_id): Path<DomainId>,
) -> Result<(StatusCode, Json<Domain>), ProblemResponse> {
    let domain = state
        .services()
        .registry
        .request_check(domain_id)
        .await
        .map_err(registry_problem)?;
    Ok((StatusCode::ACCEPTED, Json(domain)))
}

async fn promote_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<DomainId>,
) -> Result<Json<Domain>, ProblemResponse> {
    let domain = state
        .services()
        .coordinator
        .promote(domain_id)
        .await
        .map_err(|err: PromoteError| registry_problem(err.into()))?;
    Ok(Json(domain))
}

#[derive(Debug, Serialize)]
struct SiteDomains {
    site_id: SiteId,
    primary: Option<Domain>,
    domains: Vec<Domain>,
}

async fn list_site_domains(
    State(state): State<AppState>,
    Path(site_id): Path<SiteId>,
) -> Result<Json<SiteDomains>, ProblemResponse> {
    let registry = &state.services().registry;
    let domains = registry.list_for_site(site_id).await.map_err(registry_problem)?;
    let primary = registry
        .primary_for_site(site_id)
        .await
        .map_err(registry_problem)?;
    Ok(Json(SiteDomains {
        site_id,
        primary,
        domains,
    }))
}

#[derive(Debug, Serialize)]
struct Removed {
    removed: u64,
}

async fn deregister_site(
    State(state): State<AppState>,
    Path(site_id): Path<SiteId>,
) -> Result<Json<Removed>, ProblemResponse> {
    let removed = state
        .services()
        .registry
        .deregister_site(site_id)
        .await
        .map_err(registry_problem)?;
    Ok(Json(Removed { removed }))
}

#[derive(Debug, Serialize)]
struct Changed {
    changed: bool,
}

#[derive(Debug, Deserialize)]
struct ToggleLockdown {
    enabled: bool,
}

async fn toggle_lockdown(
    State(state): State<AppState>,
    Json(body): Json<ToggleLockdown>,
) -> Result<Json<Changed>, ProblemResponse> {
    let changed = state
        .services()
        .lockdown
        .toggle(body.enabled)
        .await
        .map_err(lockdown_problem)?;
    Ok(Json(Changed { changed }))
}

#[derive(Debug, Serialize)]
struct EscapeKey {
    key: String,
}

async fn lockdown_key(State(state): State<AppState>) -> Result<Json<EscapeKey>, ProblemResponse> {
    let key = state
        .services()
        .lockdown
        .escape_key()
        .map_err(lockdown_problem)?;
    Ok(Json(EscapeKey { key }))
}

/// Host framework lifecycle callback: the module was activated or deactivated.
async fn tap(
    State(state): State<AppState>,
    Path(mode): Path<String>,
) -> Result<Json<Changed>, ProblemResponse> {
    let mode: TapMode = mode.parse().map_err(|err: UnknownTapMode| {
        ProblemResponse::new(StatusCode::BAD_REQUEST, "unknown_tap_mode", err.to_string())
    })?;
    let changed = state
        .services()
        .activation
        .tap(mode)
        .await
        .map_err(|err: ActivationError| {
            ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "activation_unavailable",
                err.to_string(),
            )
        })?;
    info!(stage = "admin", %mode, changed, "lifecycle tap received");
    Ok(Json(Changed { changed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use hostmap_core::DomainStage;

    use crate::jobs::Job;
    use crate::router::app_router;
    use crate::testing::{harness, ADMIN_TOKEN};

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("host", "admin.network.test");
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.oneshot(request).await.expect("handler should respond");
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
    async fn admin_routes_require_the_bearer_token() {
        let h = harness(true).await;
        let app = app_router(h.state);
        let body = json!({"domain": "shop.example.com", "site_id": 42});

        let (status, problem) = send(app.clone(), "POST", "/_admin/domains", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(problem["type"], "unauthorized");

        let (status, _) = send(app.clone(), "POST", "/_admin/domains", Some("wrong"), Some(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(app, "POST", "/_lifecycle/tap/deactivating", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn domain_lifecycle_over_http() {
        let h = harness(true).await;
        let app = app_router(h.state.clone());
        let token = Some(ADMIN_TOKEN);

        let (status, old) = send(
            app.clone(),
            "POST",
            "/_admin/domains",
            token,
            Some(json!({"domain": "Old.Example.com", "site_id": 42, "make_primary": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(old["domain"], "old.example.com");
        assert_eq!(old["stage"], "checking");

        let (status, new) = send(
            app.clone(),
            "POST",
            "/_admin/domains",
            token,
            Some(json!({"domain": "new.example.com", "site_id": 42})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let new_id = new["id"].as_i64().expect("id");

        let (status, conflict) = send(
            app.clone(),
            "POST",
            "/_admin/domains",
            token,
            Some(json!({"domain": "new.example.com", "site_id": 7})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(conflict["type"], "duplicate_domain");

        let (status, invalid) = send(
            app.clone(),
            "POST",
            "/_admin/domains",
            token,
            Some(json!({"domain": "not a host", "site_id": 42})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid["type"], "invalid_domain");

        let (status, promoted) = send(
            app.clone(),
            "POST",
            &format!("/_admin/domains/{new_id}/promote"),
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(promoted["is_primary"], true);
        assert!(h
            .queue
            .drain()
            .iter()
            .any(|job| matches!(job, Job::RemoveOldPrimaryDomains { .. })));

        let (status, listing) = send(app.clone(), "GET", "/_admin/sites/42/domains", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["primary"]["domain"], "new.example.com");
        assert_eq!(listing["domains"].as_array().map(Vec::len), Some(2));

        let (status, _) = send(
            app.clone(),
            "DELETE",
            &format!("/_admin/domains/{new_id}"),
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, missing) = send(
            app.clone(),
            "POST",
            &format!("/_admin/domains/{new_id}/check"),
            token,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["type"], "domain_not_found");

        let (status, removed) = send(app, "DELETE", "/_admin/sites/42/domains", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed["removed"], 1);
    }

    #[tokio::test]
    async fn check_request_schedules_verification() {
        let h = harness(true).await;
        let domain = h
            .state
            .services()
            .registry
            .register("shop.example.com", SiteId(42), false)
            .await
            .expect("register");
        h.db
            .domains()
            .transition_stage(domain.id, DomainStage::Checking, DomainStage::Error, Some(false), domain.updated_at)
            .await
            .expect("fail verification");
        h.queue.drain();

        let (status, body) = send(
            app_router(h.state),
            "POST",
            &format!("/_admin/domains/{}/check", domain.id),
            Some(ADMIN_TOKEN),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["stage"], "checking");
        assert_eq!(
            h.queue.drain(),
            vec![Job::ProcessDomainStage {
                domain_id: domain.id
            }]
        );
    }

    #[tokio::test]
    async fn lockdown_and_lifecycle_routes() {
        let h = harness(true).await;
        let app = app_router(h.state.clone());
        let token = Some(ADMIN_TOKEN);

        let (status, body) = send(app.clone(), "POST", "/_admin/lockdown", token, Some(json!({"enabled": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        assert!(h.state.services().lockdown.is_enabled().await.expect("flag"));

        let (status, body) = send(app.clone(), "GET", "/_admin/lockdown/key", token, None).await;
        assert_eq!(status, StatusCode::OK);
        let key = body["key"].as_str().expect("key").to_string();
        assert!(h.state.services().lockdown.try_escape(&key).await.expect("escape"));

        let (status, body) = send(app.clone(), "POST", "/_lifecycle/tap/deactivating", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        let record = h.state.services().activation.read().await.expect("record");
        assert!(!record.active);

        let (status, body) = send(app.clone(), "POST", "/_lifecycle/tap/deactivating", token, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], false);

        let (status, problem) = send(app, "POST", "/_lifecycle/tap/sideways", token, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(problem["type"], "unknown_tap_mode");
    }
}
