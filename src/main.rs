//! Gateway binary.

use clap::Parser;
use kube_agent_gateway::lifecycle::{signals, SHUTDOWN_GRACE};
use kube_agent_gateway::observability::logging;
use kube_agent_gateway::{Gateway, GatewayConfig, Shutdown};

#[tokio::main]
async fn main() {
    let config = GatewayConfig::parse();

    logging::init("kube_agent_gateway=debug,tower_http=info");

    let gateway = Gateway::new(config);
    tracing::info!(
        addr = %gateway.addr(),
        auth = gateway.gate.enabled(),
        "kube-agent-gateway starting"
    );

    let shutdown = Shutdown::new();

    let mut gossip = {
        let gateway = gateway.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { gateway.members.serve(rx).await })
    };

    let mut server = {
        let gateway = gateway.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { kube_agent_gateway::gateway::server::serve(gateway, rx).await })
    };

    // A serve loop ending before the signal means startup failed or the
    // listener died; both are fatal.
    tokio::select! {
        _ = signals::shutdown_signal() => {}
        result = &mut server => {
            tracing::error!(result = ?result, "http server terminated");
            std::process::exit(1);
        }
        result = &mut gossip => {
            tracing::error!(result = ?result, "gossip terminated");
            std::process::exit(1);
        }
    }

    tracing::info!(grace = ?SHUTDOWN_GRACE, "shutting down");
    shutdown.trigger();

    for task in [server, gossip] {
        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "task failed during shutdown"),
            Ok(Err(e)) => tracing::error!(error = %e, "task panicked"),
            Err(_) => tracing::warn!("shutdown grace expired"),
        }
    }

    tracing::info!("shutdown complete");
}
