//! Configuration for both binaries.
//!
//! Options come from command-line flags with environment-variable fallbacks
//! (the flag name upper-snake-cased). Both structs double as plain value
//! types so tests can construct them directly.

use std::net::IpAddr;

use clap::Parser;

/// Gateway process options.
#[derive(Parser, Debug, Clone)]
#[command(name = "kube-gateway", about = "Cluster-aware gateway for kube agents")]
pub struct GatewayConfig {
    /// HTTP listen port; the gossip socket binds to this port + 1000.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Seed for cluster membership: service name or gossip address of any
    /// existing member. Empty means a single-node cluster.
    #[arg(long = "service-name", env = "SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Remote JWKS endpoint; when unset the gateway runs unauthenticated.
    #[arg(long = "jwks-endpoint", env = "JWKS_ENDPOINT")]
    pub jwks_endpoint: Option<String>,

    /// Advertised IP; discovered from the default route when unset.
    #[arg(long, env = "IP")]
    pub ip: Option<IpAddr>,

    /// Upper bound on one proxied round trip, in seconds.
    #[arg(long = "proxy-timeout", env = "PROXY_TIMEOUT", default_value_t = 60)]
    pub proxy_timeout_secs: u64,
}

/// Agent process options.
#[derive(Parser, Debug, Clone)]
#[command(name = "kube-agent", about = "Outbound-only agent fronting one cluster")]
pub struct AgentConfig {
    /// Logical cluster name this agent serves.
    #[arg(long, env = "HOST")]
    pub host: String,

    /// Address of the kube agent gateway.
    #[arg(long = "gateway-address", env = "GATEWAY_ADDRESS")]
    pub gateway_address: String,

    /// Bearer token presented when registering; empty disables the header.
    #[arg(long = "bearer-token", env = "BEARER_TOKEN", default_value = "")]
    pub bearer_token: String,

    /// Use wss:// instead of ws:// towards the gateway.
    #[arg(long, env = "SECURE", default_value_t = false)]
    pub secure: bool,

    /// Seconds to wait before re-registering after the control connection
    /// drops.
    #[arg(long = "retry-interval", env = "RETRY_INTERVAL", default_value_t = 1)]
    pub retry_interval_secs: u64,

    /// Base URL of the locally reachable Kubernetes API.
    #[arg(long = "kube-api", env = "KUBE_API", default_value = "http://127.0.0.1:8001")]
    pub kube_api: String,

    /// Bearer token attached to upstream Kubernetes API calls.
    #[arg(long = "kube-token", env = "KUBE_TOKEN")]
    pub kube_token: Option<String>,

    /// Skip TLS verification towards the upstream API server.
    #[arg(long = "kube-insecure-skip-tls-verify", env = "KUBE_INSECURE_SKIP_TLS_VERIFY", default_value_t = false)]
    pub kube_insecure_skip_tls_verify: bool,
}
