use std::sync::Arc;

use clap::Parser;
use pilot_server::{Config, MemStore, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Config::parse();
    if !cfg.store_endpoints.is_empty() {
        tracing::warn!(
            endpoints = ?cfg.store_endpoints,
            "external meta store endpoints are configured but this build runs the embedded store"
        );
    }

    let server = Server::new(cfg, Arc::new(MemStore::new()));
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.close();
    runner.await??;
    Ok(())
}
