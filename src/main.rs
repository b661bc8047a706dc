use anyhow::Context;
use clap::{Parser, Subcommand};
use hybrid_vectors::{
    api::{self, AppState},
    config::Config,
    ingest::Pipeline,
    source::SqliteSource,
    Indexes, QueryOrchestrator,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Hybrid exact/HNSW vector search over a growing document corpus")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Ingest documents from the database and serve searches
    Serve(Config),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().cmd {
        Cmd::Serve(config) => serve(config.validated()?).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        version = hybrid_vectors::VERSION,
        dim = config.index.dim,
        approximate = config.index.approximate_enabled,
        "Hybrid vector search starting"
    );

    let source = Arc::new(
        SqliteSource::open(&config.database).context("Failed to open document source")?,
    );
    let indexes = Indexes::new(&config.index);
    let pipeline = Pipeline::new(source, indexes.clone(), config.pipeline.clone());
    let state = AppState::new(
        QueryOrchestrator::new(indexes),
        pipeline.stats(),
        config.server.query_timeout(),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let ingest = tokio::spawn(pipeline.run(stopped(stop_rx.clone())));
    let mut server = tokio::spawn({
        let listen = config.server.listen.clone();
        let shutdown = stopped(stop_rx);
        async move { api::run(&listen, state, shutdown).await }
    });

    let run_for = config.server.run_for();
    let mut server_result = None;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Received Ctrl-C, shutting down");
        }
        _ = async {
            match run_for {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        } => {
            tracing::info!("Run duration elapsed, shutting down");
        }
        result = &mut server => {
            tracing::error!("API server stopped unexpectedly");
            server_result = Some(result);
        }
    }

    let _ = stop_tx.send(true);
    let snapshot = ingest.await.context("Ingestion pipeline panicked")?;
    tracing::info!(processed = snapshot.processed, "Ingestion stopped");

    let result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    result.context("API server panicked")??;
    Ok(())
}
