//! Cluster-aware gateway for NAT-isolated Kubernetes agents.
//!
//! # Architecture Overview
//!
//! ```text
//!  client ──▶ gateway (/proxies/{agentHost}/...)
//!                │ auth gate → router
//!                ├─ local tunnel ──▶ notify agent (control ws)
//!                │                     agent pulls request, pushes response
//!                └─ peer gateway (gossip membership, X-Visited-Members)
//!
//!  agent ──▶ gateway (/agents/{agentHost}/register)   outbound-only control ws
//!  agent ──▶ gateway (/agents/{agentHost}/requests)   per-request pull-back ws
//! ```

// Core subsystems
pub mod config;
pub mod error;
pub mod gateway;
pub mod tunnel;

// Cluster awareness
pub mod membership;

// Agent side
pub mod agent;
pub mod auth;

// Cross-cutting concerns
pub mod idgen;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::{AgentConfig, GatewayConfig};
pub use gateway::Gateway;
pub use lifecycle::Shutdown;
