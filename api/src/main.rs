/// Fetchgate API Server
///
/// Download proxy over a set of upstream mirrors, plus range downloads and
/// resumable chunked uploads against a local uploads directory.
mod assembler;
mod error;
mod orchestrator;
mod range;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fetchgate_downloader::{HttpClient, ReqwestClient};
use fetchgate_shared::config::ProxyConfig;
use fetchgate_shared::transfer_registry::TransferRegistry;

use crate::assembler::ChunkAssembler;
use crate::orchestrator::ProxyOrchestrator;
use crate::range::RangeServer;

/// Shared application state for all handlers.
pub struct AppState<C> {
    pub config: Arc<ProxyConfig>,
    pub orchestrator: ProxyOrchestrator<C>,
    pub range: RangeServer,
    pub assembler: ChunkAssembler,
    /// Cancelled on shutdown; in-flight proxy runs stop with it.
    pub shutdown: CancellationToken,
}

impl<C: HttpClient> AppState<C> {
    /// Wire every component from one configuration. Creates the uploads
    /// directory if needed.
    pub fn new(config: ProxyConfig, client: Arc<C>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.upload_dir)?;
        let range = RangeServer::new(&config.upload_dir, config.range_block_size)?;
        let assembler = ChunkAssembler::new(range.root(), TransferRegistry::new());

        Ok(Self {
            orchestrator: ProxyOrchestrator::new(client, &config),
            config: Arc::new(config),
            range,
            assembler,
            shutdown: CancellationToken::new(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fetchgate_api=info,fetchgate_downloader=info,fetchgate_shared=info,tower_http=info".into()
            }),
        )
        .init();

    // Config
    let config = ProxyConfig::from_env()?;
    info!(
        "{} upstream candidates, {} mode, uploads in {}",
        config.candidates.len(),
        config.fetch_mode,
        config.upload_dir.display()
    );

    let client = Arc::new(ReqwestClient::new(config.probe_timeout)?);
    let state = Arc::new(AppState::new(config, client)?);

    // Background purge of idle transfers
    let purge_assembler = state.assembler.clone();
    let ttl = state.config.transfer_ttl;
    let cleanup_interval = state.config.cleanup_interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            match purge_assembler.purge_stale(ttl).await {
                Ok(n) if n > 0 => info!("Purged {} stale transfers", n),
                Err(e) => warn!("Transfer purge error: {}", e),
                _ => {}
            }
            let stats = purge_assembler.registry().stats().await;
            debug!(
                "Transfers: {} active, {} complete, {} chunks held",
                stats.active, stats.complete, stats.chunks_received
            );
        }
    });

    let addr = state.config.listen_addr();
    let shutdown = state.shutdown.clone();
    let app = routes::router(state);

    // Bind
    info!("Fetchgate listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
    shutdown.cancel();
}
