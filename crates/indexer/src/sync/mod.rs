//! Drives the pipeline through `COLD_START → BOOTSTRAP → CATCHUP → LIVE`.
//!
//! The orchestrator owns the pair registry, the deriver and the candle
//! engine. Blocks are applied one at a time and the cursor only moves after
//! a block's pairs, trades and candle updates are persisted.

use std::{future::Future, sync::Arc};

use strum_macros::Display;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    candles::{CandleEngine, RolloverScheduler},
    clock::Clock,
    config::IndexerConfig,
    deriver::{BlockContext, BlockOutcome, TradeDeriver},
    error::{IndexerError, IndexerResult},
    metrics::IndexerMetrics,
    models::Block,
    registry::PairRegistry,
    source::{BlockSource, RetryConfig, sleep_or_cancel},
    store::Store,
};

mod bootstrap;
mod catch_up;
mod keep_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    ColdStart,
    Bootstrap,
    CatchUp,
    Live,
}

pub struct SyncOrchestrator {
    config: IndexerConfig,
    store: Arc<dyn Store>,
    source: Arc<dyn BlockSource>,
    deriver: TradeDeriver,
    engine: Arc<CandleEngine>,
    registry: Arc<PairRegistry>,
    metrics: IndexerMetrics,
    retry: RetryConfig,
}

impl SyncOrchestrator {
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn Store>,
        source: Arc<dyn BlockSource>,
        clock: Arc<dyn Clock>,
        metrics: IndexerMetrics,
    ) -> Self {
        let deriver = TradeDeriver::new(&config.amm_contract, store.clone(), source.clone());
        let engine = Arc::new(CandleEngine::new(
            store.clone(),
            config.resolutions.clone(),
            config.max_precision,
            clock,
            metrics.clone(),
        ));
        Self {
            config,
            store,
            source,
            deriver,
            engine,
            registry: Arc::new(PairRegistry::new()),
            metrics,
            retry: RetryConfig::unbounded(),
        }
    }

    /// Back-off between attempts of a failed source call or a dropped feed.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn engine(&self) -> &Arc<CandleEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<PairRegistry> {
        &self.registry
    }

    /// Runs until `cancel` fires or a non-transient error surfaces.
    pub async fn run(&self, cancel: CancellationToken) -> IndexerResult<()> {
        let (cursor, cold) = match self.store.last_processed_block().await? {
            Some(cursor) => {
                info!(state = %SyncState::CatchUp, cursor, "resuming from persisted cursor");
                (cursor, false)
            }
            None => {
                info!(state = %SyncState::ColdStart, "no cursor persisted");
                let Some(watermark) = self.bootstrap(&cancel).await? else {
                    return Ok(());
                };
                (watermark, true)
            }
        };
        self.metrics.cursor.set(cursor);

        let pairs = self.registry.refresh(self.store.as_ref()).await?;
        info!(state = %SyncState::CatchUp, cursor, pairs, "catching up");
        let Some(cursor) = self.catch_up(cursor, &cancel).await? else {
            return Ok(());
        };

        self.prepare_candles(cold).await?;

        let scheduler = RolloverScheduler::start(
            self.engine.clone(),
            self.registry.clone(),
            cancel.child_token(),
        );
        info!(state = %SyncState::Live, cursor, "following the live feed");
        let result = self.keep_up(cursor, &cancel).await;
        scheduler.shutdown().await;
        result
    }

    /// Candle work deferred during catch-up.
    async fn prepare_candles(&self, cold: bool) -> IndexerResult<()> {
        let contracts = self.registry.contracts().await;
        if cold {
            let rows = self.engine.backfill_all(&contracts).await?;
            info!(contracts = contracts.len(), rows, "bulk backfill complete");
            return Ok(());
        }

        let rows = self.engine.fill_gaps(&contracts).await?;
        let mut backfilled = 0;
        for contract in &contracts {
            // pairs first traded while the process was down
            if !self.store.has_candles(contract).await?
                && self.store.first_trade(contract).await?.is_some()
            {
                backfilled += self.engine.backfill_contract(contract).await?;
            }
        }
        info!(rows, backfilled, "downtime gap-fill complete");
        Ok(())
    }

    /// Re-runs `op` after transient failures until it succeeds or `cancel`
    /// fires. `None` means cancelled.
    async fn retry_until_cancelled<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> IndexerResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IndexerResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) if err.is_transient() => {
                    self.metrics.source_errors.inc();
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "{what} failed: {err}"
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(None);
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn halt(&self, contract_name: &str, err: &IndexerError) -> IndexerResult<()> {
        if self
            .registry
            .halt(self.store.as_ref(), contract_name, &err.to_string())
            .await?
        {
            self.metrics.halted_contracts.inc();
        }
        Ok(())
    }

    /// Derives and persists one block, then advances the cursor.
    ///
    /// Candle rows are only touched when `live`; catch-up leaves them to the
    /// backfill or gap-fill that runs before going live.
    async fn apply_block(&self, block: &Block, live: bool) -> IndexerResult<()> {
        let skip = self.registry.halted().await;
        let ctx = BlockContext {
            timestamp: block.timestamp,
            hash: block.hash.as_deref(),
        };
        let outcome = self.deriver.apply(ctx, &block.state, &skip).await?;

        for (contract_name, err) in &outcome.failures {
            self.halt(contract_name, err).await?;
        }
        if !outcome.new_pairs.is_empty() {
            self.registry.refresh(self.store.as_ref()).await?;
            info!(block = block.number, pairs = ?outcome.new_pairs, "new pairs");
        }
        self.metrics
            .trades_derived
            .inc_by(outcome.trades.len() as u64);

        if live {
            self.update_candles(&outcome).await?;
        }

        self.store.set_last_processed_block(block.number).await?;
        self.metrics.blocks_applied.inc();
        self.metrics.cursor.set(block.number);
        Ok(())
    }

    async fn update_candles(&self, outcome: &BlockOutcome) -> IndexerResult<()> {
        for listing in &outcome.listings {
            if self.registry.is_halted(&listing.contract_name).await {
                continue;
            }
            self.engine
                .seed_genesis(&listing.contract_name, &listing.price)
                .await?;
        }

        for trade in &outcome.trades {
            if self.registry.is_halted(&trade.contract_name).await {
                continue;
            }
            if !self.store.has_candles(&trade.contract_name).await? {
                self.engine
                    .seed_genesis(&trade.contract_name, &trade.price)
                    .await?;
            }
            match self.engine.apply_trade(trade).await {
                Ok(()) => {}
                Err(err) if err.halts_contract() => self.halt(&trade.contract_name, &err).await?,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
