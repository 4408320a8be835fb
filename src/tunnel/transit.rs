//! Request correlator.
//!
//! A `RequestTransit` pairs one outbound request with its eventual response.
//! It lives in the tunnel's transit table for the duration of one round trip.
//! The response slot settles at most once; if the caller is gone by the time
//! the response arrives, the delivery is silently discarded.

use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::wire::WireResponse;

pub struct RequestTransit {
    /// The original request in HTTP/1.1 wire form, ready to push down the
    /// pull-back connection.
    request: Bytes,
    response_tx: Mutex<Option<oneshot::Sender<WireResponse>>>,
}

impl RequestTransit {
    pub fn new(request: Bytes) -> (Self, oneshot::Receiver<WireResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                response_tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn request_bytes(&self) -> Bytes {
        self.request.clone()
    }

    /// Settle the response slot. Returns false when the slot was already
    /// settled or the waiting caller has gone away.
    pub fn resolve(&self, response: WireResponse) -> bool {
        let tx = self.response_tx.lock().expect("transit lock poisoned").take();
        match tx {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};

    fn response(status: StatusCode) -> WireResponse {
        WireResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_resolves_once() {
        let (transit, rx) = RequestTransit::new(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"));
        assert!(transit.resolve(response(StatusCode::OK)));
        assert!(!transit.resolve(response(StatusCode::ACCEPTED)));
        assert_eq!(rx.await.unwrap().status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_late_delivery_discarded() {
        let (transit, rx) = RequestTransit::new(Bytes::new());
        drop(rx);
        assert!(!transit.resolve(response(StatusCode::OK)));
    }
}
