//! Persistence seam for pairs, trades, candles and the sync cursor.

use async_trait::async_trait;

use crate::{
    error::IndexerResult,
    models::{Candle, CandleMeta, Pair, TradeRecord},
};

pub mod postgres;
pub mod runtime_store;

pub use postgres::PgStore;
pub use runtime_store::RuntimeStore;

/// Rows are written one at a time or in batches; only single-row writes are atomic.
#[async_trait]
pub trait Store: Send + Sync {
    async fn last_processed_block(&self) -> IndexerResult<Option<i64>>;

    async fn set_last_processed_block(&self, block_number: i64) -> IndexerResult<()>;

    async fn get_pair(&self, contract_name: &str) -> IndexerResult<Option<Pair>>;

    async fn list_pairs(&self) -> IndexerResult<Vec<Pair>>;

    async fn upsert_pairs(&self, pairs: &[Pair]) -> IndexerResult<()>;

    /// Appends trades, preserving slice order as insertion order.
    ///
    /// A trade whose `(hash, contract_name)` is already stored is skipped.
    /// Returns the trades actually appended.
    async fn insert_trades(&self, trades: &[TradeRecord]) -> IndexerResult<Vec<TradeRecord>>;

    async fn first_trade(&self, contract_name: &str) -> IndexerResult<Option<TradeRecord>>;

    /// Trades with `start <= time < end`, ordered by time then insertion.
    /// `None` selects every contract.
    async fn trades_in_window(
        &self,
        contract_name: Option<&str>,
        start: i64,
        end: i64,
    ) -> IndexerResult<Vec<TradeRecord>>;

    async fn upsert_candles(&self, candles: &[Candle]) -> IndexerResult<()>;

    /// The active (greatest epoch) candle of one contract.
    async fn latest_candle(
        &self,
        contract_name: &str,
        resolution: &str,
    ) -> IndexerResult<Option<Candle>>;

    /// The active candle of every contract that has one.
    async fn latest_candles(&self, resolution: &str) -> IndexerResult<Vec<Candle>>;

    /// Greatest epoch across all contracts.
    async fn latest_epoch(&self, resolution: &str) -> IndexerResult<Option<i64>>;

    /// Candles ordered by epoch, optionally bounded by bucket start time.
    async fn candles(
        &self,
        contract_name: &str,
        resolution: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> IndexerResult<Vec<Candle>>;

    async fn has_candles(&self, contract_name: &str) -> IndexerResult<bool>;

    async fn set_candle_meta(&self, meta: &CandleMeta) -> IndexerResult<()>;

    async fn candle_meta(&self, contract_name: &str) -> IndexerResult<Option<CandleMeta>>;

    /// Records a contract as halted. Halting an already halted contract keeps
    /// the first reason.
    async fn halt_contract(&self, contract_name: &str, reason: &str) -> IndexerResult<()>;

    async fn halted_contracts(&self) -> IndexerResult<Vec<String>>;

    /// Drops trades, candles, candle metadata and halts. Pairs and the cursor stay.
    async fn clear_derived(&self) -> IndexerResult<()>;
}
