//! Gateway subsystem.
//!
//! # Responsibilities
//! - Own the registry of currently registered tunnels
//! - Resolve pending request transits for the pull-back endpoint
//! - Route proxied requests to a local tunnel or a peer gateway
//!
//! # Data Flow
//! ```text
//! client → /proxies/{agentHost}/... → auth gate → do_request
//!     → local tunnel round_trip, or
//!     → peer gateway (X-Visited-Members loop prevention)
//! agent → /agents/{agentHost}/register   → control tunnel
//! agent → /agents/{agentHost}/requests   → pull-back (local or proxied to owner)
//! ```

pub mod forward;
pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use dashmap::DashMap;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::Gate;
use crate::config::GatewayConfig;
use crate::error::TunnelError;
use crate::idgen::IdGen;
use crate::membership::{Member, MemberList, GOSSIP_PORT_OFFSET};
use crate::observability::metrics;
use crate::tunnel::id::{RequestId, TunnelMeta};
use crate::tunnel::transit::RequestTransit;
use crate::tunnel::Tunnel;

/// One gateway instance: registry, membership view, auth gate, peer client.
pub struct Gateway {
    addr: String,
    idgen: Arc<IdGen>,
    tunnels: Arc<DashMap<u64, Arc<Tunnel>>>,
    pub members: Arc<MemberList>,
    pub gate: Gate,
    client: Client<HttpConnector, Body>,
    metrics_handle: PrometheusHandle,
    proxy_timeout: Duration,
    port: u16,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let ip = config.ip.unwrap_or_else(crate::net::exposed_ip);
        let addr = format!("{ip}:{}", config.port);

        let local = Member {
            name: addr.clone(),
            gossip_addr: SocketAddr::new(ip, config.port + GOSSIP_PORT_OFFSET),
        };
        let members = Arc::new(MemberList::new(local, config.service_name.clone()));

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Arc::new(Self {
            idgen: Arc::new(IdGen::from_ip(ip)),
            tunnels: Arc::new(DashMap::new()),
            members,
            gate: Gate::new(config.jwks_endpoint.clone()),
            client,
            metrics_handle: metrics::install(),
            proxy_timeout: Duration::from_secs(config.proxy_timeout_secs),
            addr,
            port: config.port,
        })
    }

    /// Advertised `ip:port` of this instance; embedded into every RequestId
    /// it issues.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy_timeout(&self) -> Duration {
        self.proxy_timeout
    }

    /// Create and register a tunnel for an authenticated agent connection.
    /// The on-close hook removes it from the registry again.
    pub fn register(&self, agent_host: &str) -> Result<Arc<Tunnel>, TunnelError> {
        let tunnel = Tunnel::new(
            self.idgen.clone(),
            TunnelMeta {
                gateway_address: self.addr.clone(),
                agent_host: agent_host.to_string(),
            },
        )?;

        let id = tunnel.id;
        let tunnels = self.tunnels.clone();
        tunnel.set_on_close(move || {
            tunnels.remove(&id);
            metrics::tunnel_closed();
        });

        self.tunnels.insert(id, tunnel.clone());
        metrics::tunnel_opened();

        tracing::info!(tunnel_id = id, agent = %agent_host, "tunnel registered");
        Ok(tunnel)
    }

    /// Any registered tunnel serving `agent_host`; with several replicas the
    /// pick is arbitrary.
    pub fn find_tunnel(&self, agent_host: &str) -> Result<Arc<Tunnel>, TunnelError> {
        self.tunnels
            .iter()
            .find(|t| t.meta.agent_host == agent_host)
            .map(|t| t.value().clone())
            .ok_or(TunnelError::NotFound)
    }

    /// Locate the pending transit for a request id issued by this instance.
    pub fn resolve_transit(&self, id: &RequestId) -> Result<Arc<RequestTransit>, TunnelError> {
        let key = id.to_string();
        for tunnel in self.tunnels.iter() {
            if tunnel.meta.agent_host == id.meta.agent_host {
                if let Some(transit) = tunnel.find_transit(&key) {
                    return Ok(transit);
                }
            }
        }
        Err(TunnelError::RequestNotFound)
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Close every registered tunnel (shutdown path). Collected first so the
    /// on-close deregistration does not race the iteration.
    pub fn close_all_tunnels(&self) {
        let open: Vec<Arc<Tunnel>> = self.tunnels.iter().map(|t| t.value().clone()).collect();
        for tunnel in open {
            tunnel.close();
        }
    }

    pub(crate) fn metrics_handle(&self) -> &PrometheusHandle {
        &self.metrics_handle
    }

    pub(crate) fn http_client(&self) -> &Client<HttpConnector, Body> {
        &self.client
    }
}
