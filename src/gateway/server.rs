//! Gateway HTTP surface.
//!
//! # Endpoints
//! - `GET/HEAD /_health` → 204, handled before anything else
//! - `GET /.sys/status` → membership snapshot
//! - `GET /.sys/metrics` → Prometheus exposition
//! - `* /agents/{agentHost}/register` → control-channel upgrade
//! - `* /agents/{agentHost}/requests` → pull-back upgrade (local or proxied)
//! - `* /proxies/{agentHost}/...` → authorization-gated routed proxy

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tower_http::trace::TraceLayer;

use super::forward::MAX_BODY_BYTES;
use super::Gateway;
use crate::auth::is_non_auth_path;
use crate::error::StatusError;
use crate::observability::metrics;
use crate::tunnel::id::{RequestId, HTTP_KUBE_AGENT_REQUEST_ID};
use crate::tunnel::transit::RequestTransit;
use crate::tunnel::wire::{decode_response, WireResponse};
use crate::tunnel::WRITE_WAIT;

#[derive(Serialize)]
struct GatewayStatus {
    members: Vec<String>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/.sys/status", get(status_handler))
        .route("/.sys/metrics", get(metrics_handler))
        .route("/agents/{agent_host}/register", any(register_handler))
        .route("/agents/{agent_host}/requests", any(requests_handler))
        .route("/proxies/{agent_host}", any(proxy_root_handler))
        .route("/proxies/{agent_host}/{*path}", any(proxy_path_handler))
        .layer(middleware::from_fn(health_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Run the gateway HTTP server until shutdown; tunnels are closed as part of
/// the graceful drain so upgraded connections cannot hold the server open.
pub async fn serve(
    gateway: Arc<Gateway>,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", gateway.port())).await?;
    tracing::info!(addr = %gateway.addr(), "gateway listening");

    let app = router(gateway.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            gateway.close_all_tunnels();
        })
        .await
}

/// `/_health` short-circuits routing, auth, and tracing alike.
async fn health_middleware(req: Request, next: Next) -> Response {
    if req.uri().path() == "/_health"
        && (req.method() == Method::GET || req.method() == Method::HEAD)
    {
        return StatusCode::NO_CONTENT.into_response();
    }
    next.run(req).await
}

async fn status_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(GatewayStatus {
        members: gateway.members.members(),
    })
}

async fn metrics_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        gateway.metrics_handle().render(),
    )
}

/// Turn an authenticated agent connection into a registered tunnel.
async fn register_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(agent_host): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match gateway.gate.validate_token_if_needed(&headers).await {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = gateway.gate.check_agent_token(claims.as_ref(), &agent_host) {
        return e.into_response();
    }

    let tunnel = match gateway.register(&agent_host) {
        Ok(tunnel) => tunnel,
        Err(e) => {
            tracing::error!(agent = %agent_host, error = %e, "tunnel registration failed");
            return StatusError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| tunnel.serve(socket))
}

/// Pull-back endpoint: hand the pending request to the agent and collect its
/// response. Requests owned by another instance are proxied there verbatim.
async fn requests_handler(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let claims = match gateway.gate.validate_token_if_needed(req.headers()).await {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    let raw_id = req
        .headers()
        .get(HTTP_KUBE_AGENT_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let request_id: RequestId = match raw_id.parse() {
        Ok(id) => id,
        Err(e) => return StatusError::bad_request(e.to_string()).into_response(),
    };

    if let Some(claims) = &claims {
        if gateway
            .gate
            .check_agent_token(Some(claims), &request_id.meta.agent_host)
            .is_err()
        {
            return StatusError::forbidden(format!(
                "no access to pull requests of {}",
                request_id.meta.agent_host
            ))
            .into_response();
        }
    }

    // A load balancer may land the agent on any instance; only the one that
    // issued the id holds the transit.
    if request_id.meta.gateway_address != gateway.addr() {
        let target = request_id.meta.gateway_address.clone();
        return gateway.proxy_upgrade(target, req).await;
    }

    let transit = match gateway.resolve_transit(&request_id) {
        Ok(transit) => transit,
        Err(e) => return StatusError::bad_request(e.to_string()).into_response(),
    };

    let (mut parts, _body) = req.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(e) => return StatusError::bad_request(e.to_string()).into_response(),
    };

    let key = request_id.to_string();
    ws.on_upgrade(move |socket| pull_back(transit, socket, key))
}

/// Push the buffered request down, read one response back, settle the slot.
async fn pull_back(transit: Arc<RequestTransit>, mut socket: WebSocket, request_id: String) {
    let sent = timeout(
        WRITE_WAIT,
        socket.send(Message::Binary(transit.request_bytes())),
    )
    .await;
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(request_id = %request_id, error = %e, "dispatch request failed");
            return;
        }
        Err(_) => {
            tracing::warn!(request_id = %request_id, "dispatch request write deadline exceeded");
            return;
        }
    }

    loop {
        match socket.recv().await {
            Some(Ok(Message::Binary(data))) => {
                match decode_response(&data) {
                    Ok(response) => {
                        if !transit.resolve(response) {
                            tracing::debug!(request_id = %request_id, "late response discarded");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(request_id = %request_id, error = %e, "receive response failed");
                    }
                }
                return;
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(request_id = %request_id, error = %e, "pull-back read failed");
                return;
            }
        }
    }
}

async fn proxy_root_handler(
    State(gateway): State<Arc<Gateway>>,
    Path(agent_host): Path<String>,
    req: Request,
) -> Response {
    proxy_request(gateway, agent_host, req).await
}

async fn proxy_path_handler(
    State(gateway): State<Arc<Gateway>>,
    Path((agent_host, _path)): Path<(String, String)>,
    req: Request,
) -> Response {
    proxy_request(gateway, agent_host, req).await
}

/// The authorization-gated, routed proxy entry point.
async fn proxy_request(gateway: Arc<Gateway>, agent_host: String, req: Request) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let prefix = format!("/proxies/{agent_host}");

    let result = handle_proxy(&gateway, &agent_host, &prefix, &method, &path_and_query, req).await;

    let status = match &result {
        Ok(resp) => resp.status.as_u16(),
        Err(e) => e.code,
    };
    metrics::record_proxy_request(method.as_str(), status, &agent_host, started);

    let cost = started.elapsed();
    match result {
        Ok(wire) => {
            tracing::info!(
                status = status,
                cost = ?cost,
                request = %format!("{method} {path_and_query}"),
                "proxied"
            );
            let mut response = http::Response::builder().status(wire.status);
            if let Some(h) = response.headers_mut() {
                *h = wire.headers;
            }
            response
                .body(Body::from(wire.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            tracing::error!(
                status = status,
                cost = ?cost,
                request = %format!("{method} {path_and_query}"),
                error = %e,
                "proxy failed"
            );
            e.into_response()
        }
    }
}

async fn handle_proxy(
    gateway: &Arc<Gateway>,
    agent_host: &str,
    prefix: &str,
    method: &Method,
    path_and_query: &str,
    req: Request,
) -> Result<WireResponse, StatusError> {
    let attrs =
        crate::auth::request_info::RequestAttributes::parse(method, path_and_query, prefix);

    if !is_non_auth_path(&attrs.path, prefix) {
        let claims = gateway.gate.validate_token_if_needed(req.headers()).await?;
        if let Some(claims) = &claims {
            gateway.gate.authorize(claims, agent_host, &attrs)?;
        }
    }

    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| StatusError::bad_request(format!("read body: {e}")))?;

    let mut headers = parts.headers;
    headers.remove(http::header::HOST);
    // Authorization survives peer hops so the owning gateway can re-check it;
    // the tunnel path drops it before the agent sees the request.

    timeout(
        gateway.proxy_timeout(),
        gateway.do_request(agent_host, method, path_and_query, headers, body),
    )
    .await
    .map_err(|_| {
        StatusError::bad_gateway(format!("round trip to {agent_host} timed out"))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use tower::ServiceExt;

    fn test_router() -> Router {
        router(Gateway::new(GatewayConfig {
            port: 18090,
            service_name: None,
            jwks_endpoint: None,
            ip: Some("127.0.0.1".parse().unwrap()),
            proxy_timeout_secs: 1,
        }))
    }

    #[tokio::test]
    async fn test_health_bypasses_routing() {
        let resp = test_router()
            .oneshot(
                http::Request::builder()
                    .uri("/_health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_status_lists_members() {
        let resp = test_router()
            .oneshot(
                http::Request::builder()
                    .uri("/.sys/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            status["members"],
            serde_json::json!(["127.0.0.1:18090"])
        );
    }

    #[tokio::test]
    async fn test_requests_endpoint_rejects_malformed_id() {
        for raw in ["", "a@b", "0@a@b"] {
            let mut builder = http::Request::builder().uri("/agents/local/requests");
            if !raw.is_empty() {
                builder = builder.header(HTTP_KUBE_AGENT_REQUEST_ID, raw);
            }
            let resp = test_router()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "id {raw:?}");
        }
    }

    #[tokio::test]
    async fn test_proxy_without_tunnel_is_bad_gateway() {
        let resp = test_router()
            .oneshot(
                http::Request::builder()
                    .uri("/proxies/ghost/version")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["code"], 502);
    }
}
