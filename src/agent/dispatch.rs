//! Pull-back dispatch.
//!
//! One dispatch handles one request id: open a dedicated connection to the
//! gateway's pull-back endpoint, read the serialized request, execute it
//! against the upstream API, stream the response back, close. No retries;
//! the gateway-side caller owns the timeout.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;

use super::Agent;
use crate::observability::metrics;
use crate::tunnel::id::HTTP_KUBE_AGENT_REQUEST_ID;
use crate::tunnel::wire::{decode_request, encode_response};

pub(crate) async fn dispatch(agent: Arc<Agent>, request_id: String) {
    let started = Instant::now();

    let pull_path = format!("/agents/{}/requests", agent.host());
    let ws = match agent
        .connect(&pull_path, &[(HTTP_KUBE_AGENT_REQUEST_ID, request_id.as_str())])
        .await
    {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "pull-back connect failed");
            return;
        }
    };

    if let Err(e) = run(&agent, ws, &request_id, started).await {
        tracing::error!(request_id = %request_id, error = %e, "dispatch failed");
    }
}

async fn run(
    agent: &Agent,
    ws: super::WsStream,
    request_id: &str,
    started: Instant,
) -> Result<(), String> {
    let (mut sink, mut stream) = ws.split();

    let data = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => break data,
            Some(Ok(Message::Close(_))) | None => {
                return Err("connection closed before request arrived".into());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.to_string()),
        }
    };

    let mut request = decode_request(&data).map_err(|e| e.to_string())?;

    // The local handler sees a clean local path and the cluster's own
    // credentials only.
    let prefix = format!("/proxies/{}", agent.host());
    if let Some(stripped) = request.uri.strip_prefix(&prefix) {
        request.uri = if stripped.is_empty() {
            "/".to_string()
        } else {
            stripped.to_string()
        };
    }
    request.headers.remove(AUTHORIZATION);

    let method = request.method.clone();
    let uri = request.uri.clone();

    let response = agent.kube().execute(request).await;
    let status = response.status;

    let encoded = encode_response(response.status, &response.headers, &response.body);
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| e.to_string())?;
    let _ = sink.close().await;

    metrics::record_agent_dispatch(status.as_u16(), started);
    tracing::info!(
        request_id = %request_id,
        method = %method,
        status = status.as_u16(),
        url = %uri,
        cost = ?started.elapsed(),
        "dispatched"
    );

    Ok(())
}
