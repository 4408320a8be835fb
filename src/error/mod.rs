//! Error taxonomy for the gateway and agent.
//!
//! # Responsibilities
//! - Define the tunnel/routing protocol errors
//! - Map errors to HTTP status responses with a small JSON body
//!
//! # Design Decisions
//! - Protocol errors (bad request ID, missing token, bad scope) are never
//!   retried; they surface as 400/401/403
//! - Routing errors surface as 502/400 depending on context
//! - Transport errors close the tunnel; pending callers time out on their own

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the tunnel and routing layers.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel closed")]
    Closed,

    #[error("tunnel not found")]
    NotFound,

    #[error("invalid request id, expect ID@AGENT_HOST@GATEWAY_ADDRESS, but got {0:?}")]
    InvalidRequestId(String),

    #[error("request not found")]
    RequestNotFound,

    #[error("id generation failed: {0}")]
    IdGen(String),

    #[error("malformed http payload: {0}")]
    Wire(String),
}

/// HTTP-facing error with a JSON `{code, msg}` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusError {
    pub code: u16,
    pub msg: String,
}

impl StatusError {
    pub fn new(code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, msg)
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.msg)
    }
}

impl std::error::Error for StatusError {}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self).unwrap_or_else(|_| "{}".into());
        (
            self.status(),
            [("content-type", "application/json; charset=utf-8")],
            body,
        )
            .into_response()
    }
}
