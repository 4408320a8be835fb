//! Agent subsystem.
//!
//! # Responsibilities
//! - Keep one persistent control connection registered against the gateway
//! - Spawn an independent dispatch per pushed request id
//! - Re-register after connection loss, indefinitely, until shut down
//!
//! # State machine
//! ```text
//! Connecting → Registered → Reading → (Dispatching | Closing)
//!      ↑                                     |
//!      └──────── retry-interval ─────────────┘
//! ```

mod dispatch;
pub mod kube;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http::header::AUTHORIZATION;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::AgentConfig;
use crate::lifecycle::SHUTDOWN_GRACE;
use kube::KubeProxy;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("websocket: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("invalid header value for {0}")]
    BadHeader(&'static str),

    #[error("upstream client: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// The agent process: one control connection, many concurrent dispatches.
pub struct Agent {
    config: AgentConfig,
    kube: KubeProxy,
    closed: AtomicBool,
    inflight: Arc<WaitGroup>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Arc<Self>, AgentError> {
        let kube = KubeProxy::new(
            config.kube_api.clone(),
            config.kube_token.clone(),
            config.kube_insecure_skip_tls_verify,
        )?;

        Ok(Arc::new(Self {
            config,
            kube,
            closed: AtomicBool::new(false),
            inflight: Arc::new(WaitGroup::new()),
        }))
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub(crate) fn kube(&self) -> &KubeProxy {
        &self.kube
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open a WebSocket towards the gateway, authenticating with the static
    /// bearer token.
    pub(crate) async fn connect(
        &self,
        path: &str,
        extra_headers: &[(&'static str, &str)],
    ) -> Result<WsStream, AgentError> {
        let scheme = if self.config.secure { "wss" } else { "ws" };
        let url = format!("{scheme}://{}{path}", self.config.gateway_address);

        let mut request = url.into_client_request()?;
        if !self.config.bearer_token.is_empty() {
            let bearer = format!("Bearer {}", self.config.bearer_token);
            request.headers_mut().insert(
                AUTHORIZATION,
                bearer
                    .parse()
                    .map_err(|_| AgentError::BadHeader("authorization"))?,
            );
        }
        for &(name, value) in extra_headers {
            request
                .headers_mut()
                .insert(name, value.parse().map_err(|_| AgentError::BadHeader(name))?);
        }

        match connect_async(request).await {
            Ok((ws, _)) => Ok(ws),
            Err(tungstenite::Error::Http(response)) => {
                tracing::warn!(
                    status = response.status().as_u16(),
                    path = %path,
                    "gateway rejected connection"
                );
                Err(tungstenite::Error::Http(response).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run the receiver loop until shutdown: register, read request ids,
    /// dispatch each concurrently, re-register on loss after the retry
    /// interval.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let register_path = format!("/agents/{}/register", self.config.host);
        let retry = Duration::from_secs(self.config.retry_interval_secs.max(1));

        loop {
            if self.is_closed() {
                return;
            }

            match self.connect(&register_path, &[]).await {
                Ok(ws) => {
                    tracing::info!(
                        host = %self.config.host,
                        gateway = %self.config.gateway_address,
                        "agent registered"
                    );
                    self.clone().read_control(ws, &mut shutdown).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "registration failed");
                }
            }

            if self.is_closed() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = shutdown.recv() => {
                    self.begin_shutdown();
                    return;
                }
            }
        }
    }

    /// Block on the control connection; each text frame is a request id to
    /// dispatch. Close or error falls back to the caller for re-registration.
    async fn read_control(self: Arc<Self>, ws: WsStream, shutdown: &mut broadcast::Receiver<()>) {
        let (_sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(id))) => {
                            let agent = self.clone();
                            let guard = self.inflight.enter();
                            tokio::spawn(async move {
                                let _guard = guard;
                                dispatch::dispatch(agent, id.to_string()).await;
                            });
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("control connection closed by gateway");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "control connection failed");
                            return;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    self.begin_shutdown();
                    return;
                }
            }
        }
    }

    fn begin_shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Stop accepting notifications and wait for in-flight dispatches up to
    /// the shutdown grace period.
    pub async fn shutdown(&self) {
        self.begin_shutdown();
        if timeout(SHUTDOWN_GRACE, self.inflight.wait()).await.is_err() {
            tracing::warn!("shutdown grace expired with dispatches in flight");
        }
    }
}

/// Counts in-flight dispatches so shutdown can drain them.
pub(crate) struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn enter(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard { wg: self.clone() }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct InflightGuard {
    wg: Arc<WaitGroup>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.wg.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.wg.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_group_drains() {
        let wg = Arc::new(WaitGroup::new());
        let g1 = wg.enter();
        let g2 = wg.enter();

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };

        drop(g1);
        assert!(!waiter.is_finished());
        drop(g2);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait group drained")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_with_no_inflight_returns_immediately() {
        let wg = Arc::new(WaitGroup::new());
        timeout(Duration::from_millis(10), wg.wait())
            .await
            .expect("immediate return");
    }
}
