//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use kube_agent_gateway::agent::Agent;
use kube_agent_gateway::{AgentConfig, Gateway, GatewayConfig, Shutdown};

/// Start a minimal HTTP backend returning a fixed body with status 200.
/// Stands in for the agent-local Kubernetes API server.
pub async fn start_mock_backend(addr: SocketAddr, response: &'static str) {
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        // Drain the request head before answering.
                        let mut buf = [0u8; 4096];
                        let mut head = Vec::new();
                        loop {
                            match socket.read(&mut buf).await {
                                Ok(0) => return,
                                Ok(n) => {
                                    head.extend_from_slice(&buf[..n]);
                                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                                        break;
                                    }
                                }
                                Err(_) => return,
                            }
                        }

                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
}

pub fn gateway_config(port: u16, seed: Option<&str>) -> GatewayConfig {
    GatewayConfig {
        port,
        service_name: seed.map(str::to_string),
        jwks_endpoint: None,
        ip: Some("127.0.0.1".parse().unwrap()),
        proxy_timeout_secs: 5,
    }
}

/// Spawn a full gateway (gossip + HTTP server) and wait until it answers.
pub async fn spawn_gateway(port: u16, seed: Option<&str>, shutdown: &Shutdown) -> Arc<Gateway> {
    let gateway = Gateway::new(gateway_config(port, seed));

    {
        let gateway = gateway.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = gateway.members.serve(rx).await;
        });
    }
    {
        let gateway = gateway.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = kube_agent_gateway::gateway::server::serve(gateway, rx).await;
        });
    }

    let health = format!("http://127.0.0.1:{port}/_health");
    wait_until(Duration::from_secs(5), || {
        let health = health.clone();
        async move {
            reqwest::get(&health)
                .await
                .map(|r| r.status().as_u16() == 204)
                .unwrap_or(false)
        }
    })
    .await;

    gateway
}

/// Spawn an agent registered against `gateway_addr`, proxying to `kube_api`.
pub async fn spawn_agent(
    host: &str,
    gateway_addr: &str,
    kube_api: &str,
    shutdown: &Shutdown,
) -> Arc<Agent> {
    let agent = Agent::new(AgentConfig {
        host: host.to_string(),
        gateway_address: gateway_addr.to_string(),
        bearer_token: String::new(),
        secure: false,
        retry_interval_secs: 1,
        kube_api: kube_api.to_string(),
        kube_token: None,
        kube_insecure_skip_tls_verify: false,
    })
    .unwrap();

    {
        let agent = agent.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { agent.serve(rx).await });
    }

    agent
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if cond().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
