//! HTTP/1.1 wire codec for the pull-back path.
//!
//! The gateway pushes the original request down the pull-back connection in
//! HTTP/1.1 wire form, and the agent answers with an HTTP/1.1 response.
//! Each direction is one buffered payload; bodies are carried verbatim with
//! an explicit `Content-Length`.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, StatusCode};

use crate::error::TunnelError;

const MAX_HEADERS: usize = 100;

/// A decoded request as seen by the agent.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: Method,
    /// Path and query, e.g. `/proxies/local/api/v1/pods?limit=1`.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A decoded response as seen by the gateway.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Encode a request into HTTP/1.1 wire form.
pub fn encode_request(method: &Method, uri: &str, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("{method} {uri} HTTP/1.1\r\n").as_bytes());
    write_headers(&mut out, headers, body.len());
    out.extend_from_slice(body);
    out
}

/// Encode a response into HTTP/1.1 wire form.
pub fn encode_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("status");
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("HTTP/1.1 {:03} {}\r\n", status.as_u16(), reason).as_bytes());
    write_headers(&mut out, headers, body.len());
    out.extend_from_slice(body);
    out
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, body_len: usize) {
    for (name, value) in headers {
        // The body is buffered; framing headers are rewritten below.
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("content-length: {body_len}\r\n\r\n").as_bytes());
}

/// Decode an HTTP/1.1 request from a complete buffer.
pub fn decode_request(buf: &[u8]) -> Result<WireRequest, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let offset = match req
        .parse(buf)
        .map_err(|e| TunnelError::Wire(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(TunnelError::Wire("truncated request head".into()))
        }
    };

    let method: Method = req
        .method
        .ok_or_else(|| TunnelError::Wire("missing method".into()))?
        .parse()
        .map_err(|_| TunnelError::Wire("bad method".into()))?;
    let uri = req
        .path
        .ok_or_else(|| TunnelError::Wire("missing path".into()))?
        .to_string();

    Ok(WireRequest {
        method,
        uri,
        headers: collect_headers(req.headers)?,
        body: Bytes::copy_from_slice(&buf[offset..]),
    })
}

/// Decode an HTTP/1.1 response from a complete buffer.
pub fn decode_response(buf: &[u8]) -> Result<WireResponse, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let offset = match resp
        .parse(buf)
        .map_err(|e| TunnelError::Wire(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(TunnelError::Wire("truncated response head".into()))
        }
    };

    let status = StatusCode::from_u16(
        resp.code
            .ok_or_else(|| TunnelError::Wire("missing status".into()))?,
    )
    .map_err(|_| TunnelError::Wire("bad status".into()))?;

    Ok(WireResponse {
        status,
        headers: collect_headers(resp.headers)?,
        body: Bytes::copy_from_slice(&buf[offset..]),
    })
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, TunnelError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name: HeaderName = h
            .name
            .parse()
            .map_err(|_| TunnelError::Wire(format!("bad header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| TunnelError::Wire(format!("bad header value for {}", h.name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}
