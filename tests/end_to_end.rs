//! End-to-end delivery through a gateway cluster.
//!
//! Three gateways share membership; one agent registers against the first.
//! Proxied requests must reach the agent's local handler no matter which
//! instance receives them.

use std::time::Duration;

use kube_agent_gateway::Shutdown;

mod common;

#[tokio::test]
async fn test_round_robin_delivery_across_members() {
    let backend_addr = "127.0.0.1:28100".parse().unwrap();
    common::start_mock_backend(backend_addr, "ok").await;

    let shutdown = Shutdown::new();
    let gateway_ports = [28101u16, 28102, 28103];
    // Gossip sits at HTTP port + 1000; everyone seeds at the first instance.
    let seed = "127.0.0.1:29101";

    let mut gateways = Vec::new();
    for port in gateway_ports {
        gateways.push(common::spawn_gateway(port, Some(seed), &shutdown).await);
    }

    common::wait_until(Duration::from_secs(10), || {
        let gateways = gateways.clone();
        async move { gateways.iter().all(|g| g.members.members().len() == 3) }
    })
    .await;

    let _agent = common::spawn_agent(
        "local",
        "127.0.0.1:28101",
        "http://127.0.0.1:28100",
        &shutdown,
    )
    .await;

    // Wait for registration to land.
    common::wait_until(Duration::from_secs(10), || {
        let gateway = gateways[0].clone();
        async move { gateway.tunnel_count() == 1 }
    })
    .await;

    let client = reqwest::Client::new();
    for i in 0..20 {
        let port = gateway_ports[i % gateway_ports.len()];
        let url = format!("http://127.0.0.1:{port}/proxies/local/version");

        let response = client.get(&url).send().await.unwrap();
        assert_eq!(
            response.status().as_u16(),
            200,
            "request {i} via gateway {port}"
        );
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    shutdown.trigger();
}

#[tokio::test]
async fn test_status_reports_membership() {
    let shutdown = Shutdown::new();
    let seed = "127.0.0.1:29111";
    let a = common::spawn_gateway(28111, Some(seed), &shutdown).await;
    let _b = common::spawn_gateway(28112, Some(seed), &shutdown).await;

    common::wait_until(Duration::from_secs(10), || {
        let a = a.clone();
        async move { a.members.members().len() == 2 }
    })
    .await;

    let status: serde_json::Value = reqwest::get("http://127.0.0.1:28111/.sys/status")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let members = status["members"].as_array().unwrap();
    assert!(members.contains(&serde_json::json!("127.0.0.1:28111")));
    assert!(members.contains(&serde_json::json!("127.0.0.1:28112")));

    let metrics = reqwest::get("http://127.0.0.1:28111/.sys/metrics")
        .await
        .unwrap();
    assert_eq!(metrics.status().as_u16(), 200);

    shutdown.trigger();
}
