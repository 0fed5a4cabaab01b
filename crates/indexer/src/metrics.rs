use std::net::SocketAddr;

use axum::{Router, extract::State, http::StatusCode, routing::get};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pipeline counters, registered under the registry's `ammlook` prefix.
#[derive(Clone)]
pub struct IndexerMetrics {
    pub blocks_applied: IntCounter,
    pub trades_derived: IntCounter,
    pub candles_written: IntCounter,
    pub source_errors: IntCounter,
    pub halted_contracts: IntCounter,
    pub cursor: IntGauge,
}

impl IndexerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            blocks_applied: IntCounter::new("blocks_applied", "Blocks fully applied")?,
            trades_derived: IntCounter::new("trades_derived", "Trades derived from state changes")?,
            candles_written: IntCounter::new("candles_written", "Candle rows upserted")?,
            source_errors: IntCounter::new("source_errors", "Failed block source calls")?,
            halted_contracts: IntCounter::new(
                "halted_contracts",
                "Contracts halted on inconsistent or malformed data",
            )?,
            cursor: IntGauge::new("sync_cursor", "Highest fully processed block")?,
        };

        registry.register(Box::new(metrics.blocks_applied.clone()))?;
        registry.register(Box::new(metrics.trades_derived.clone()))?;
        registry.register(Box::new(metrics.candles_written.clone()))?;
        registry.register(Box::new(metrics.source_errors.clone()))?;
        registry.register(Box::new(metrics.halted_contracts.clone()))?;
        registry.register(Box::new(metrics.cursor.clone()))?;
        Ok(metrics)
    }

    /// Counters backed by a throwaway registry.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::new(&Registry::new())
    }
}

async fn render(State(registry): State<Registry>) -> Result<String, StatusCode> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| {
            warn!("failed to encode metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Serves `/metrics` until `cancel` fires.
pub async fn serve_metrics(
    metrics_address: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(metrics_address).await?;
    let app = Router::new()
        .route("/metrics", get(render))
        .with_state(registry);

    info!("metrics listening on {}", metrics_address);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            warn!("metrics service stopped: {e}");
        }
    }))
}
