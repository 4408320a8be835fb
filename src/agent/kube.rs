//! Upstream Kubernetes API proxy.
//!
//! The narrow interface to the cluster: execute one buffered request against
//! the locally reachable API server and return one buffered response.
//! Upstream failures become the 502 response shipped back over the tunnel;
//! they are payload, not protocol errors.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};

use crate::tunnel::wire::{WireRequest, WireResponse};

pub struct KubeProxy {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl KubeProxy {
    pub fn new(
        base: impl Into<String>,
        token: Option<String>,
        insecure_skip_tls_verify: bool,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_tls_verify)
            .build()?;

        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Execute one request against the upstream API server.
    pub async fn execute(&self, request: WireRequest) -> WireResponse {
        let url = format!("{}{}", self.base, request.uri);

        let mut upstream = self
            .client
            .request(request.method.clone(), &url)
            .body(request.body.to_vec());

        for (name, value) in &request.headers {
            // Framing and identity headers are the transport's business.
            if name == HOST || name == CONTENT_LENGTH || name == AUTHORIZATION {
                continue;
            }
            upstream = upstream.header(name, value);
        }
        if let Some(token) = &self.token {
            upstream = upstream.bearer_auth(token);
        }

        match self.execute_inner(upstream).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "upstream request failed");
                error_response(&e.to_string())
            }
        }
    }

    async fn execute_inner(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<WireResponse, reqwest::Error> {
        let response = request.send().await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        headers.remove(TRANSFER_ENCODING);
        headers.remove(http::header::CONNECTION);

        let body = response.bytes().await?;

        Ok(WireResponse {
            status,
            headers,
            body,
        })
    }
}

fn error_response(msg: &str) -> WireResponse {
    WireResponse {
        status: StatusCode::BAD_GATEWAY,
        headers: HeaderMap::new(),
        body: Bytes::from(format!("{{\"code\":502,\"msg\":{}}}", serde_json::json!(msg))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let proxy = KubeProxy::new("http://127.0.0.1:8001/", None, false).unwrap();
        assert_eq!(proxy.base, "http://127.0.0.1:8001");
    }

    #[test]
    fn test_error_response_shape() {
        let resp = error_response("connect refused");
        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        let v: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(v["code"], 502);
        assert_eq!(v["msg"], "connect refused");
    }
}
