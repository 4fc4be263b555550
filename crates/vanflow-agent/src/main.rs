//! # vanflow agent
//!
//! Event source runtime speaking the vanflow protocol over MQTT.
//!
//! ## Architecture
//!
//! The agent runs three concurrent parts on one container:
//! 1. **Container**: keeps an MQTT session alive and rebuilds it on failure
//! 2. **Manager**: beacons and heartbeats for the agent's own source and
//!    answers flush requests with its controller and site records
//! 3. **Collector** (optional): discovers other sources, watches them and
//!    merges their records into a local store

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting vanflow agent");

    let config = AgentConfig::from_env()?;
    tracing::info!(
        source = %config.source_id,
        source_type = %config.source_type,
        broker = %config.broker,
        collect = config.collect,
        "Agent configured"
    );

    let agent = Agent::new(config)?;
    agent.run().await?;

    Ok(())
}
