//! Peer-forwarding edge cases: loop prevention and terminal failures.

use std::time::Duration;

use kube_agent_gateway::Shutdown;

mod common;

#[tokio::test]
async fn test_exhausted_visited_members_is_terminal() {
    let shutdown = Shutdown::new();
    let seed = "127.0.0.1:29201";
    let a = common::spawn_gateway(28201, Some(seed), &shutdown).await;
    let _b = common::spawn_gateway(28202, Some(seed), &shutdown).await;

    common::wait_until(Duration::from_secs(10), || {
        let a = a.clone();
        async move { a.members.members().len() == 2 }
    })
    .await;

    // Every known member already visited: no candidate remains, so the
    // gateway must fail terminally instead of looping.
    let response = reqwest::Client::new()
        .get("http://127.0.0.1:28201/proxies/ghost/version")
        .header("X-Visited-Members", "127.0.0.1:28201,127.0.0.1:28202")
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], 502);
    assert!(body["msg"]
        .as_str()
        .unwrap()
        .contains("closed or not registered"));

    shutdown.trigger();
}

#[tokio::test]
async fn test_unregistered_host_fails_without_agent() {
    let shutdown = Shutdown::new();
    let a = common::spawn_gateway(28211, None, &shutdown).await;
    assert_eq!(a.members.members().len(), 1);

    // Single-member cluster, no tunnel: the request crosses both gateways'
    // worth of routing (self only) and fails terminally.
    let response = reqwest::Client::new()
        .get("http://127.0.0.1:28211/proxies/ghost/api/v1/pods")
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);

    shutdown.trigger();
}

#[tokio::test]
async fn test_malformed_request_id_is_bad_request() {
    let shutdown = Shutdown::new();
    let _a = common::spawn_gateway(28221, None, &shutdown).await;

    for raw in ["nonsense", "a@b", "0@ghost@127.0.0.1:28221"] {
        let response = reqwest::Client::new()
            .get("http://127.0.0.1:28221/agents/ghost/requests")
            .header("X-Kube-Agent-Request-ID", raw)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400, "id {raw:?}");
    }

    shutdown.trigger();
}
