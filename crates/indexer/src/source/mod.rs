//! Block data: fetch by number, live push and the contract-state endpoints.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::IndexerResult,
    models::{Block, HistoryEntry, StateChange},
};

pub mod http;
pub mod retry;
pub mod ws;

pub use http::HttpBlockSource;
pub use retry::{RetryConfig, sleep_or_cancel};

/// Blocks pushed by a live subscription. The channel closes when the feed ends.
pub type BlockStream = mpsc::Receiver<Block>;

#[async_trait]
pub trait BlockSource: Send + Sync {
    /// `IndexerError::NotFound` when the source does not have the block yet.
    async fn fetch_block(&self, number: i64) -> IndexerResult<Block>;

    async fn latest_known_block(&self) -> IndexerResult<i64>;

    /// Blocks in non-decreasing order, starting from whatever the source is producing now.
    async fn subscribe(&self) -> IndexerResult<BlockStream>;

    /// Every current key of `contract`.
    async fn contract_state(&self, contract: &str) -> IndexerResult<Vec<StateChange>>;

    /// Transactions that touched `contract` after `last_tx_uid`, oldest first.
    async fn history_page(
        &self,
        contract: &str,
        last_tx_uid: &str,
        limit: usize,
    ) -> IndexerResult<Vec<HistoryEntry>>;

    async fn token_symbol(&self, contract: &str) -> IndexerResult<String>;
}
