//! Registry node binary
//!
//! Runs the registry against an in-process `LocalChain` that mines one empty
//! block per second, with the synchronizer loop in the background.

use anyhow::Context;
use registry_core::{Config, LocalChain, Registry, StaticVerifier};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting membership registry node");

    let config = match std::env::var("REGISTRY_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };

    let genesis = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
    let chain = Arc::new(LocalChain::new(genesis));
    // No prover is attached to a standalone node
    let verifier = Arc::new(StaticVerifier::rejecting());

    let registry = Registry::open(config, chain.clone(), verifier)
        .await
        .context("opening registry")?;
    registry.spawn_sync();
    tracing::info!("Registry opened successfully");

    let producer = {
        let chain = chain.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                chain.advance_time(1);
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    producer.abort();

    let snapshot = registry.snapshot();
    let summary = serde_json::json!({
        "head": chain.head_number(),
        "members": snapshot.members().count(),
        "active": snapshot.active_count(),
        "bonded_pool": snapshot.bonded_pool().to_string(),
        "cursor": snapshot.cursor().map(|c| c.to_string()),
    });
    tracing::info!(summary = %summary, "Shutting down registry node");

    registry.shutdown().await?;
    Ok(())
}
