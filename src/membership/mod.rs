//! Gossip-based cluster membership.
//!
//! # Responsibilities
//! - Maintain an eventually-consistent view of live gateway peers
//! - Join the cluster through a seed address and keep gossiping from there
//!
//! # Data Flow
//! ```text
//! tick (1s) → heartbeat {self, known members} → UDP to every known peer + seeds
//! recv      → merge sender (fresh) and rumored members (probed next tick)
//! expire    → drop members silent for FAILURE_TIMEOUT
//! ```
//!
//! # Design Decisions
//! - Member name is the peer's HTTP address; the gossip socket sits on
//!   HTTP port + 1000
//! - The view may transiently contain dead members or miss new ones; the
//!   router tolerates both (visited-list subtraction plus one retry)

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};

/// Gossip heartbeat interval.
const GOSSIP_INTERVAL: Duration = Duration::from_secs(1);
/// A member silent for this long is considered gone.
const FAILURE_TIMEOUT: Duration = Duration::from_secs(5);
/// Gossip port offset relative to the HTTP port.
pub const GOSSIP_PORT_OFFSET: u16 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    /// The member's HTTP address, e.g. `10.0.0.7:8080`.
    pub name: String,
    /// The member's gossip socket address.
    pub gossip_addr: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    from: Member,
    members: Vec<Member>,
}

#[derive(Debug, Clone)]
struct PeerState {
    member: Member,
    last_seen: Instant,
}

/// Shared membership view; cheap to clone behind an `Arc`.
pub struct MemberList {
    local: Member,
    seeds: Vec<String>,
    peers: DashMap<String, PeerState>,
}

impl MemberList {
    /// `seed` is the service name or address of any existing member's gossip
    /// socket; a missing port defaults to the local gossip port (uniform
    /// deployments).
    pub fn new(local: Member, seed: Option<String>) -> Self {
        let gossip_port = local.gossip_addr.port();
        let seeds = seed
            .into_iter()
            .map(|s| {
                if s.contains(':') {
                    s
                } else {
                    format!("{s}:{gossip_port}")
                }
            })
            .collect();

        Self {
            local,
            seeds,
            peers: DashMap::new(),
        }
    }

    /// Current view of member names, self included, sorted for stable output.
    pub fn members(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .iter()
            .map(|p| p.value().member.name.clone())
            .collect();
        names.push(self.local.name.clone());
        names.sort();
        names.dedup();
        names
    }

    fn merge(&self, beat: Heartbeat) {
        let now = Instant::now();

        if beat.from.name != self.local.name {
            self.peers.insert(
                beat.from.name.clone(),
                PeerState {
                    member: beat.from,
                    last_seen: now,
                },
            );
        }

        // Rumored members are inserted but not refreshed: they must answer
        // our own heartbeats to stay in the view.
        for member in beat.members {
            if member.name != self.local.name {
                self.peers.entry(member.name.clone()).or_insert(PeerState {
                    member,
                    last_seen: now,
                });
            }
        }
    }

    fn expire(&self) {
        self.peers
            .retain(|_, state| state.last_seen.elapsed() < FAILURE_TIMEOUT);
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            from: self.local.clone(),
            members: self
                .peers
                .iter()
                .map(|p| p.value().member.clone())
                .collect(),
        }
    }

    async fn gossip_targets(&self) -> Vec<SocketAddr> {
        let mut targets: Vec<SocketAddr> = self
            .peers
            .iter()
            .map(|p| p.value().member.gossip_addr)
            .collect();

        for seed in &self.seeds {
            if let Ok(resolved) = lookup_host(seed.as_str()).await {
                targets.extend(resolved);
            }
        }

        targets.sort();
        targets.dedup();
        targets.retain(|a| *a != self.local.gossip_addr);
        targets
    }

    /// Run the gossip loop until shutdown. Binding the gossip socket is a
    /// startup requirement; failure is fatal for the caller.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let socket = UdpSocket::bind(self.local.gossip_addr).await?;
        tracing::info!(addr = %self.local.gossip_addr, name = %self.local.name, "membership gossip started");

        let mut ticker = interval(GOSSIP_INTERVAL);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.expire();
                    let beat = self.heartbeat();
                    let payload = match serde_json::to_vec(&beat) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::error!(error = %e, "heartbeat encode failed");
                            continue;
                        }
                    };
                    for target in self.gossip_targets().await {
                        let _ = socket.send_to(&payload, target).await;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, _)) => {
                            match serde_json::from_slice::<Heartbeat>(&buf[..n]) {
                                Ok(beat) => self.merge(beat),
                                Err(e) => tracing::debug!(error = %e, "dropping malformed heartbeat"),
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "gossip socket read failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("membership gossip stopped");
                    return Ok(());
                }
            }
        }
    }
}
