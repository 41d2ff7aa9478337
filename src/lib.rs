//! Dirgate is a small gateway putting audited guardrails in front of a
//! corporate directory.

#[forbid(unsafe_code)]
#[deny(missing_docs, unused_mut)]
mod audit;
mod credentials;
mod directory;
pub mod error;
mod gateway;
mod ldap;
mod router;
pub mod telemetry;
mod token;

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use error::ServerError;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    token: Option<&str>,
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use std::net::SocketAddr;

    use axum::extract::{ConnectInfo, Request};
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");

    if let Some(token) = token {
        request = request
            .header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    let mut request =
        request.body(axum::body::Body::from(body)).unwrap();
    // Stand-in for the peer address `axum::serve` injects in production.
    request.extensions_mut().insert(ConnectInfo(SocketAddr::from((
        [127, 0, 0, 1],
        1111,
    ))));

    app.oneshot(request).await.unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub credentials: Arc<credentials::CredentialStore>,
    pub token: token::TokenManager,
    pub gateway: gateway::Gateway,
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Prometheus exposition. Empty when no recorder is installed.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `POST /login` goes to `login`.
        .route("/login", post(router::login::handler))
        // `GET /verify` goes to `verify`. Authorization required.
        .route("/verify", get(router::verify::handler))
        // `GET /audit/logs` goes to `audit`. Authorization required.
        .route("/audit/logs", get(router::audit::handler))
        .nest("/users", router::users::router())
        // `GET /metrics` for Prometheus scraping.
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file. let it in memory.
    let config = config::Configuration::default().read();

    // initialize the directory backend.
    let Some(cfg) = &config.ldap else {
        // Without a directory there is nothing to administrate.
        tracing::error!("missing `ldap` entry on `config.yaml` file");
        std::process::exit(0);
    };
    let backend = Arc::new(ldap::LdapBackend::new(cfg));

    // initialize the audit store.
    let audit: Arc<dyn audit::AuditStore> = match &config.audit {
        Some(cfg) => Arc::new(audit::FileAuditLog::open(
            cfg.path.clone(),
            cfg.max_records,
        )),
        None => {
            // Privileged actions without a durable trail are not an option.
            tracing::error!("missing `audit` entry on `config.yaml` file");
            std::process::exit(0);
        },
    };

    // handle jwt.
    let secret = std::env::var("TOKEN_SECRET")
        .expect("missing `TOKEN_SECRET` environnement variable");
    let token = token::TokenManager::new(
        secret.as_bytes(),
        &config.name,
        config.token.as_ref().and_then(|token| token.ttl_secs),
    );

    // Bootstrap identity for first-run setups without provisioned admins.
    let admins = if config.admins.is_empty() {
        match std::env::var("BOOTSTRAP_PASSWORD") {
            Ok(password) => vec![config::Admin {
                username: "admin".into(),
                password_hash: credentials::hash_password(&password)?,
                display_name: "Administrator".into(),
                role: "admin".into(),
            }],
            Err(_) => {
                tracing::warn!(
                    "no `admins` provisioned, every login will fail"
                );
                vec![]
            },
        }
    } else {
        config.admins.clone()
    };
    let credentials = Arc::new(credentials::CredentialStore::new(&admins));

    let gateway = gateway::Gateway::new(backend, audit, token.clone());

    let metrics = match telemetry::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "metrics recorder not installed");
            None
        },
    };

    Ok(AppState {
        config,
        credentials,
        token,
        gateway,
        metrics,
    })
}
