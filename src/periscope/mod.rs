pub mod config;
pub mod logging;
pub mod net;
pub mod tunnel;

use std::sync::Arc;

/// Runs the publicly reachable side until a fatal condition.
pub async fn run_edge(cfg: config::EdgeConfig) -> anyhow::Result<()> {
    let edge = Arc::new(tunnel::edge::Edge::bind(cfg).await?);
    tracing::info!(
        control = %edge.control_addr(),
        users = %edge.user_addr(),
        "edge: ready"
    );
    edge.serve().await
}

/// Runs the service-side peer until a fatal condition.
pub async fn run_proxy(cfg: config::ProxyConfig) -> anyhow::Result<()> {
    tunnel::proxy::run(cfg).await
}
