use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use ammlook_indexer::{resolution::ResolutionSet, store::Store};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{aggregations::get_chart, error::ChartError};

pub const CHART_PATH: &str = "/chart/:contract_name/:resolution";
pub const HEALTH_PATH: &str = "/";

pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Resolutions the indexer is configured to maintain.
    pub resolutions: ResolutionSet,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route(HEALTH_PATH, get(health_check))
        .route(CHART_PATH, get(get_chart))
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

pub async fn run_server(
    server_address: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(server_address).await?;
    info!("chart API listening on {}", server_address);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Typed access to the query-string bounds shared by the chart endpoints.
pub trait ParameterUtil {
    fn time_param(&self, name: &str) -> Result<Option<i64>, ChartError>;

    /// Inclusive lower bound on bucket start, unix seconds.
    fn from_time(&self) -> Result<Option<i64>, ChartError> {
        self.time_param("from")
    }

    /// Inclusive upper bound on bucket start, unix seconds.
    fn to_time(&self) -> Result<Option<i64>, ChartError> {
        self.time_param("to")
    }
}

impl ParameterUtil for HashMap<String, String> {
    fn time_param(&self, name: &str) -> Result<Option<i64>, ChartError> {
        self.get(name)
            .map(|v| {
                v.parse::<i64>().map_err(|_| {
                    ChartError::BadRequest(format!("'{name}' must be unix seconds, got '{v}'"))
                })
            })
            .transpose()
    }
}
