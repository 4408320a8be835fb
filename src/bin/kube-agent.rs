//! Agent binary.

use clap::Parser;
use kube_agent_gateway::agent::Agent;
use kube_agent_gateway::lifecycle::signals;
use kube_agent_gateway::observability::logging;
use kube_agent_gateway::{AgentConfig, Shutdown};

#[tokio::main]
async fn main() {
    let config = AgentConfig::parse();

    logging::init("kube_agent_gateway=debug");

    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "agent startup failed");
            std::process::exit(1);
        }
    };

    let shutdown = Shutdown::new();

    let receiver = {
        let agent = agent.clone();
        let rx = shutdown.subscribe();
        tokio::spawn(async move { agent.serve(rx).await })
    };

    signals::shutdown_signal().await;
    shutdown.trigger();

    // Drain in-flight dispatches up to the grace period, then go.
    agent.shutdown().await;
    receiver.abort();

    tracing::info!("shutdown complete");
}
