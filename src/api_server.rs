/// HTTP API Server Module
///
/// The thin HTTP surface over the diagnostic engine:
/// - `GET /check?cid=<cid>[&multiaddr=<maddr>]` runs a peer check when
///   `multiaddr` is present, a CID check otherwise, and returns the report
///   as JSON. Parse failures are 400s; operational findings live inside
///   the report body.
/// - `GET /ready` reports readiness of the DHT client (meaningful with the
///   accelerated warm-up).
/// - `GET /metrics/libp2p` and `GET /metrics/http` serve Prometheus
///   scrapes, behind HTTP Basic Auth when credentials are configured.
///
/// Every response carries `Access-Control-Allow-Origin: *` so the endpoint
/// can be driven straight from a browser.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine as _;
use prometheus::Registry;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::check::Checker;
use crate::error::ProbeError;
use crate::metrics::Metrics;

pub struct AppState {
    pub checker: Checker,
    pub metrics: Arc<Metrics>,
    pub metrics_auth: Option<(String, String)>,
}

#[derive(Debug, Deserialize)]
pub struct CheckParams {
    cid: String,
    multiaddr: Option<String>,
}

/// Serve the HTTP surface until the process exits.
pub async fn run(state: Arc<AppState>, listen: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("HTTP surface listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/check", get(handle_check))
        .route("/ready", get(handle_ready))
        .route("/metrics/libp2p", get(handle_net_metrics))
        .route("/metrics/http", get(handle_http_metrics))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_check(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheckParams>,
) -> Response {
    let started = Instant::now();
    let cancel = CancellationToken::new();

    let result = match &params.multiaddr {
        Some(multiaddr) => state
            .checker
            .check_peer(&cancel, multiaddr, &params.cid)
            .await
            .and_then(|report| {
                serde_json::to_value(report)
                    .map_err(|e| ProbeError::Bootstrap(format!("report serialization: {}", e)))
            }),
        None => state
            .checker
            .check_cid(&cancel, &params.cid)
            .await
            .and_then(|reports| {
                serde_json::to_value(reports)
                    .map_err(|e| ProbeError::Bootstrap(format!("report serialization: {}", e)))
            }),
    };

    let response = match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e @ ProbeError::InputParse(_)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    state
        .metrics
        .http_requests_total
        .with_label_values(&["/check", response.status().as_str()])
        .inc();
    state
        .metrics
        .http_request_duration
        .with_label_values(&["/check"])
        .observe(started.elapsed().as_secs_f64());
    response
}

async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    if state.checker.host().ready() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "dht client warming up\n").into_response()
    }
}

async fn handle_net_metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    metrics_response(&state, &headers, &state.metrics.net_registry, "/metrics/libp2p")
}

async fn handle_http_metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    metrics_response(&state, &headers, &state.metrics.http_registry, "/metrics/http")
}

fn metrics_response(
    state: &AppState,
    headers: &HeaderMap,
    registry: &Registry,
    endpoint: &str,
) -> Response {
    let response = if authorized(state, headers) {
        (StatusCode::OK, Metrics::encode(registry)).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"meshprobe metrics\""),
            )],
            "unauthorized\n",
        )
            .into_response()
    };
    state
        .metrics
        .http_requests_total
        .with_label_values(&[endpoint, response.status().as_str()])
        .inc();
    response
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some((user, pass)) = &state.metrics_auth else {
        return true;
    };
    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
    );
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::network::HostConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn offline_host_config() -> HostConfig {
        HostConfig {
            listen_on: Vec::new(),
            bootstrap: Vec::new(),
            enable_dht: false,
            allow_non_global: true,
            ..HostConfig::default()
        }
    }

    fn test_state(metrics_auth: Option<(String, String)>) -> Arc<AppState> {
        let cfg = offline_host_config();
        let host = Host::new(cfg.clone()).unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        Arc::new(AppState {
            checker: Checker::new(host, cfg, metrics.clone()),
            metrics,
            metrics_auth,
        })
    }

    #[tokio::test]
    async fn bad_cid_is_a_400_with_cors() {
        let app = router(test_state(None));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/check?cid=garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn bad_multiaddr_is_a_400() {
        let app = router(test_state(None));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/check?cid=bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi&multiaddr=nonsense")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ready_endpoint_reports_ready_without_warm_up() {
        let app = router(test_state(None));
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_require_auth_when_configured() {
        let state = test_state(Some(("ops".into(), "secret".into())));

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/metrics/http")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let credentials = base64::engine::general_purpose::STANDARD.encode("ops:secret");
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/metrics/libp2p")
                    .header(header::AUTHORIZATION, format!("Basic {}", credentials))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_are_open_without_configured_auth() {
        let response = router(test_state(None))
            .oneshot(
                Request::builder()
                    .uri("/metrics/libp2p")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
