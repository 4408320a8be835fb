//! Tunnel subsystem.
//!
//! # Responsibilities
//! - Model one logical, authenticated agent connection (the control channel)
//! - Correlate outbound requests with asynchronously delivered responses
//! - Keep the control channel alive with periodic pings
//!
//! # Data Flow
//! ```text
//! round_trip(request)
//!     → encode to HTTP/1.1 wire form, tag with RequestId
//!     → store RequestTransit keyed by the serialized id
//!     → push the id onto the dispatcher (FIFO, order == call order)
//!     → serve loop forwards the id as a text frame to the agent
//!     → agent pulls the request on a dedicated connection, pushes response
//!     → transit slot settles → round_trip returns
//! ```
//!
//! # Design Decisions
//! - Closing the tunnel does not resolve pending transits; callers own their
//!   own timeout and unblock through it
//! - Every control-channel write carries a deadline so a stalled peer cannot
//!   block the serve loop

pub mod id;
pub mod transit;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, Method};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};

use crate::error::TunnelError;
use crate::idgen::IdGen;
use crate::tunnel::id::{TunnelMeta, HTTP_KUBE_AGENT_REQUEST_ID};
use crate::tunnel::transit::RequestTransit;
use crate::tunnel::wire::{encode_request, WireResponse};

/// Deadline for any single write on the control channel.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// How long the agent side tolerates silence before giving up on the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping interval; must stay below [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

type OnClose = Box<dyn FnOnce() + Send>;

/// One registered agent connection, owned by the gateway's registry.
pub struct Tunnel {
    pub id: u64,
    pub meta: TunnelMeta,

    idgen: Arc<IdGen>,
    transits: DashMap<String, Arc<RequestTransit>>,

    dispatcher_tx: mpsc::UnboundedSender<String>,
    dispatcher_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,

    closed_tx: watch::Sender<bool>,
    close_once: AtomicBool,
    on_close: Mutex<Option<OnClose>>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(idgen: Arc<IdGen>, meta: TunnelMeta) -> Result<Arc<Self>, TunnelError> {
        let id = idgen.next()?;
        let (dispatcher_tx, dispatcher_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            id,
            meta,
            idgen,
            transits: DashMap::new(),
            dispatcher_tx,
            dispatcher_rx: Mutex::new(Some(dispatcher_rx)),
            closed_tx,
            close_once: AtomicBool::new(false),
            on_close: Mutex::new(None),
        }))
    }

    /// Register a callback run exactly once when the tunnel closes, so the
    /// owner can deregister it.
    pub fn set_on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().expect("on_close lock poisoned") = Some(Box::new(f));
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Idempotent-by-call close: signals the serve loop, runs the on-close
    /// callback. Pending transits stay untouched; their callers unblock via
    /// their own timeout.
    pub fn close(&self) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.on_close.lock().expect("on_close lock poisoned").take() {
            f();
        }
        let _ = self.closed_tx.send(true);
        tracing::debug!(tunnel_id = self.id, agent = %self.meta.agent_host, "tunnel closed");
    }

    /// Look up a pending transit by its serialized request id.
    pub fn find_transit(&self, request_id: &str) -> Option<Arc<RequestTransit>> {
        self.transits.get(request_id).map(|t| t.clone())
    }

    /// Send one request through the tunnel and wait for its response.
    ///
    /// Callers wrap this in their own timeout; a canceled caller drops the
    /// future, which removes the transit entry, and any late response is
    /// silently discarded.
    pub async fn round_trip(
        &self,
        method: &Method,
        uri: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WireResponse, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let request_id = self.meta.request_id(self.idgen.next()?);
        let key = request_id.to_string();

        let mut tagged = headers.clone();
        tagged.insert(
            HTTP_KUBE_AGENT_REQUEST_ID,
            key.parse().map_err(|_| TunnelError::Wire("unencodable request id".into()))?,
        );

        let wire = encode_request(method, uri, &tagged, body);
        let (transit, response_rx) = RequestTransit::new(Bytes::from(wire));

        self.transits.insert(key.clone(), Arc::new(transit));
        let _guard = TransitGuard {
            transits: &self.transits,
            key: key.clone(),
        };

        if self.dispatcher_tx.send(key).is_err() {
            return Err(TunnelError::Closed);
        }

        response_rx.await.map_err(|_| TunnelError::Closed)
    }

    fn take_dispatcher(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.dispatcher_rx
            .lock()
            .expect("dispatcher lock poisoned")
            .take()
    }

    /// Drive the control channel: forward dispatched request ids as text
    /// frames, ping on a fixed interval, and terminate on close or on any
    /// failed write.
    pub async fn serve(self: Arc<Self>, socket: WebSocket) {
        let mut dispatcher = match self.take_dispatcher() {
            Some(rx) => rx,
            None => {
                tracing::warn!(tunnel_id = self.id, "tunnel served twice");
                return;
            }
        };

        let (mut sink, mut stream) = socket.split();

        // Drain the read side so close frames and pongs are processed; a
        // close or error from the peer tears the tunnel down.
        let reader = {
            let tunnel = self.clone();
            tokio::spawn(async move {
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                tunnel.close();
            })
        };

        let mut ping = interval(PING_PERIOD);
        ping.reset();
        let mut closed_rx = self.closed_tx.subscribe();

        // Closed before the upgrade completed: tell the peer and stop.
        if *closed_rx.borrow_and_update() {
            let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
            reader.abort();
            return;
        }

        loop {
            tokio::select! {
                dispatched = dispatcher.recv() => {
                    let Some(request_id) = dispatched else { break };
                    match timeout(WRITE_WAIT, sink.send(Message::Text(request_id.clone().into()))).await {
                        Ok(Ok(())) => {
                            tracing::debug!(tunnel_id = self.id, request_id = %request_id, "dispatched");
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(tunnel_id = self.id, error = %e, "control write failed");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(tunnel_id = self.id, "control write deadline exceeded");
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    if timeout(WRITE_WAIT, sink.send(Message::Ping(Bytes::new())))
                        .await
                        .map(|r| r.is_err())
                        .unwrap_or(true)
                    {
                        break;
                    }
                }
                _ = closed_rx.changed() => {
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    break;
                }
            }
        }

        self.close();
        reader.abort();
    }
}

/// Removes the transit entry when the round trip finishes or its caller is
/// dropped mid-flight.
struct TransitGuard<'a> {
    transits: &'a DashMap<String, Arc<RequestTransit>>,
    key: String,
}

impl Drop for TransitGuard<'_> {
    fn drop(&mut self) {
        self.transits.remove(&self.key);
    }
}
