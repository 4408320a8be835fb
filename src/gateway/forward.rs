//! Request routing: local tunnel first, then peer gateways.
//!
//! # Design Decisions
//! - `X-Visited-Members` records every gateway a request has passed through;
//!   forwarding only targets unvisited members, so a request cannot loop
//! - A connection-refused peer is presumed dead: it joins the visited set
//!   and routing restarts from the top, at most once
//! - `Authorization` is stripped on the tunnel path only; peer hops re-run
//!   the receiving gateway's own auth gate

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rand::Rng;

use super::Gateway;
use crate::error::{StatusError, TunnelError};
use crate::observability::metrics;
use crate::tunnel::wire::WireResponse;

/// Loop-prevention header: comma-separated gateway addresses already visited.
pub const HTTP_HEADER_VISITED_MEMBERS: &str = "X-Visited-Members";

/// Cap on buffered request/response bodies crossing the gateway.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

fn visited_members(headers: &HeaderMap) -> Vec<String> {
    headers
        .get(HTTP_HEADER_VISITED_MEMBERS)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn set_visited_members(headers: &mut HeaderMap, visited: &[String]) {
    if let Ok(value) = HeaderValue::from_str(&visited.join(",")) {
        headers.insert(HTTP_HEADER_VISITED_MEMBERS, value);
    }
}

fn is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = e.source();
    }
    false
}

enum ForwardError {
    /// The chosen peer refused the connection; it is already recorded in the
    /// visited header.
    Refused,
    Terminal(StatusError),
}

impl Gateway {
    /// Deliver one proxied request to `agent_host`: a locally registered
    /// tunnel when present, otherwise an unvisited peer gateway.
    pub async fn do_request(
        &self,
        agent_host: &str,
        method: &Method,
        uri: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<WireResponse, StatusError> {
        for attempt in 0..2 {
            match self.find_tunnel(agent_host) {
                Ok(tunnel) => {
                    // The agent must see the cluster's own credentials only.
                    let mut tunnel_headers = headers.clone();
                    tunnel_headers.remove(AUTHORIZATION);

                    return tunnel
                        .round_trip(method, uri, &tunnel_headers, &body)
                        .await
                        .map_err(|e| StatusError::bad_gateway(e.to_string()));
                }
                Err(TunnelError::NotFound) => {}
                Err(e) => return Err(StatusError::bad_gateway(e.to_string())),
            }

            match self
                .forward_once(agent_host, method, uri, &mut headers, &body)
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(ForwardError::Refused) if attempt == 0 => continue,
                Err(ForwardError::Refused) => break,
                Err(ForwardError::Terminal(e)) => return Err(e),
            }
        }

        Err(StatusError::bad_gateway(format!(
            "tunnel for {agent_host} is closed or not registered"
        )))
    }

    async fn forward_once(
        &self,
        agent_host: &str,
        method: &Method,
        uri: &str,
        headers: &mut HeaderMap,
        body: &Bytes,
    ) -> Result<WireResponse, ForwardError> {
        let mut visited = visited_members(headers);
        if !visited.contains(&self.addr().to_string()) {
            visited.push(self.addr().to_string());
        }
        set_visited_members(headers, &visited);

        let unvisited: Vec<String> = self
            .members
            .members()
            .into_iter()
            .filter(|m| !visited.contains(m))
            .collect();

        if unvisited.is_empty() {
            return Err(ForwardError::Terminal(StatusError::bad_gateway(format!(
                "tunnel for {agent_host} is closed or not registered"
            ))));
        }

        let peer = unvisited[rand::thread_rng().gen_range(0..unvisited.len())].clone();
        metrics::record_peer_forward(&peer);
        tracing::debug!(peer = %peer, agent = %agent_host, "forwarding to peer");

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(format!("http://{peer}{uri}"));
        if let Some(h) = builder.headers_mut() {
            for (name, value) in headers.iter() {
                if name != http::header::HOST {
                    h.insert(name.clone(), value.clone());
                }
            }
        }
        let request = builder
            .body(Body::from(body.clone()))
            .map_err(|e| ForwardError::Terminal(StatusError::bad_gateway(e.to_string())))?;

        match self.http_client().request(request).await {
            Ok(response) => {
                let (mut parts, incoming) = response.into_parts();
                let body = axum::body::to_bytes(Body::new(incoming), MAX_BODY_BYTES)
                    .await
                    .map_err(|e| {
                        ForwardError::Terminal(StatusError::bad_gateway(e.to_string()))
                    })?;
                // The body is buffered now; stale framing must not survive.
                parts.headers.remove(http::header::TRANSFER_ENCODING);
                Ok(WireResponse {
                    status: parts.status,
                    headers: parts.headers,
                    body,
                })
            }
            Err(e) if is_connection_refused(&e) => {
                tracing::warn!(peer = %peer, "peer refused connection, presumed dead");
                visited.push(peer);
                set_visited_members(headers, &visited);
                Err(ForwardError::Refused)
            }
            Err(e) => Err(ForwardError::Terminal(StatusError::bad_gateway(
                e.to_string(),
            ))),
        }
    }

    /// Reverse-proxy an upgrade request verbatim to the gateway that owns the
    /// pending transit, then splice the two upgraded connections together.
    pub async fn proxy_upgrade(&self, target: String, mut req: Request<Body>) -> Response {
        let client_upgrade = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut builder = Request::builder()
            .method(req.method().clone())
            .uri(format!("http://{target}{path_and_query}"));
        if let Some(h) = builder.headers_mut() {
            for (name, value) in req.headers() {
                if name != http::header::HOST {
                    h.insert(name.clone(), value.clone());
                }
            }
        }
        let outbound = match builder.body(Body::empty()) {
            Ok(r) => r,
            Err(e) => return StatusError::bad_gateway(e.to_string()).into_response(),
        };

        let mut response = match self.http_client().request(outbound).await {
            Ok(r) => r,
            Err(e) => return StatusError::bad_gateway(e.to_string()).into_response(),
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (parts, incoming) = response.into_parts();
            return Response::from_parts(parts, Body::new(incoming));
        }

        let Some(client_upgrade) = client_upgrade else {
            return StatusError::bad_request("connection is not upgradable").into_response();
        };
        let server_upgrade = hyper::upgrade::on(&mut response);

        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, server_upgrade) {
                Ok((client_io, server_io)) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut server_io = TokioIo::new(server_io);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await
                    {
                        tracing::debug!(error = %e, "upgrade splice ended");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upgrade handshake failed");
                }
            }
        });

        let (parts, _) = response.into_parts();
        Response::from_parts(parts, Body::empty())
    }
}
