//! Candle aggregation: bulk backfill, incremental updates, downtime gap-fill
//! and epoch rollover. The engine is the only writer of candle rows.

use std::sync::Arc;

use crate::{
    clock::Clock, error::IndexerResult, metrics::IndexerMetrics, models::Candle,
    resolution::ResolutionSet, store::Store,
};

pub mod backfill;
pub mod bucket;
pub mod gap_fill;
pub mod incremental;
pub mod rollover;

pub use bucket::Bucket;
pub use rollover::RolloverScheduler;

pub const DEFAULT_MAX_PRECISION: i32 = 10;

pub struct CandleEngine {
    store: Arc<dyn Store>,
    resolutions: ResolutionSet,
    max_precision: i32,
    clock: Arc<dyn Clock>,
    metrics: IndexerMetrics,
}

impl CandleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        resolutions: ResolutionSet,
        max_precision: i32,
        clock: Arc<dyn Clock>,
        metrics: IndexerMetrics,
    ) -> Self {
        Self {
            store,
            resolutions,
            max_precision,
            clock,
            metrics,
        }
    }

    pub fn resolutions(&self) -> &ResolutionSet {
        &self.resolutions
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    async fn write(&self, candles: &[Candle]) -> IndexerResult<()> {
        if candles.is_empty() {
            return Ok(());
        }
        self.store.upsert_candles(candles).await?;
        self.metrics.candles_written.inc_by(candles.len() as u64);
        Ok(())
    }
}
