use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    error::IndexerResult,
    models::{Candle, CandleMeta, Pair, TradeRecord},
    store::Store,
};

type CandleKey = (String, String, i64);

#[derive(Default)]
struct RuntimeState {
    cursor: Option<i64>,
    pairs: BTreeMap<String, Pair>,
    trades: Vec<TradeRecord>,
    trade_keys: HashSet<(String, String)>,
    candles: BTreeMap<CandleKey, Candle>,
    meta: HashMap<String, CandleMeta>,
    halted: BTreeMap<String, String>,
}

/// In-process store. Clones share state, nothing survives the process.
#[derive(Clone, Default)]
pub struct RuntimeStore {
    state: Arc<Mutex<RuntimeState>>,
}

impl RuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trade_count(&self) -> usize {
        self.state.lock().await.trades.len()
    }

    pub async fn candle_count(&self) -> usize {
        self.state.lock().await.candles.len()
    }
}

#[async_trait]
impl Store for RuntimeStore {
    async fn last_processed_block(&self) -> IndexerResult<Option<i64>> {
        Ok(self.state.lock().await.cursor)
    }

    async fn set_last_processed_block(&self, block_number: i64) -> IndexerResult<()> {
        self.state.lock().await.cursor = Some(block_number);
        Ok(())
    }

    async fn get_pair(&self, contract_name: &str) -> IndexerResult<Option<Pair>> {
        Ok(self.state.lock().await.pairs.get(contract_name).cloned())
    }

    async fn list_pairs(&self) -> IndexerResult<Vec<Pair>> {
        Ok(self.state.lock().await.pairs.values().cloned().collect())
    }

    async fn upsert_pairs(&self, pairs: &[Pair]) -> IndexerResult<()> {
        let mut state = self.state.lock().await;
        for pair in pairs {
            state
                .pairs
                .insert(pair.contract_name.clone(), pair.clone());
        }
        Ok(())
    }

    async fn insert_trades(&self, trades: &[TradeRecord]) -> IndexerResult<Vec<TradeRecord>> {
        let mut state = self.state.lock().await;
        let mut appended = Vec::with_capacity(trades.len());
        for trade in trades {
            if let Some(hash) = &trade.hash {
                let key = (hash.clone(), trade.contract_name.clone());
                if !state.trade_keys.insert(key) {
                    continue;
                }
            }
            state.trades.push(trade.clone());
            appended.push(trade.clone());
        }
        Ok(appended)
    }

    async fn first_trade(&self, contract_name: &str) -> IndexerResult<Option<TradeRecord>> {
        let state = self.state.lock().await;
        // min_by_key keeps the first of equal keys, which is the earliest inserted
        Ok(state
            .trades
            .iter()
            .filter(|t| t.contract_name == contract_name)
            .min_by_key(|t| t.time)
            .cloned())
    }

    async fn trades_in_window(
        &self,
        contract_name: Option<&str>,
        start: i64,
        end: i64,
    ) -> IndexerResult<Vec<TradeRecord>> {
        let state = self.state.lock().await;
        let mut trades: Vec<TradeRecord> = state
            .trades
            .iter()
            .filter(|t| contract_name.is_none_or(|c| t.contract_name == c))
            .filter(|t| t.time >= start && t.time < end)
            .cloned()
            .collect();
        // stable sort keeps insertion order among equal timestamps
        trades.sort_by_key(|t| t.time);
        Ok(trades)
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> IndexerResult<()> {
        let mut state = self.state.lock().await;
        for candle in candles {
            state.candles.insert(
                (
                    candle.contract_name.clone(),
                    candle.resolution.clone(),
                    candle.epoch,
                ),
                candle.clone(),
            );
        }
        Ok(())
    }

    async fn latest_candle(
        &self,
        contract_name: &str,
        resolution: &str,
    ) -> IndexerResult<Option<Candle>> {
        let state = self.state.lock().await;
        Ok(state
            .candles
            .values()
            .filter(|c| c.contract_name == contract_name && c.resolution == resolution)
            .max_by_key(|c| c.epoch)
            .cloned())
    }

    async fn latest_candles(&self, resolution: &str) -> IndexerResult<Vec<Candle>> {
        let state = self.state.lock().await;
        let mut latest: BTreeMap<&str, &Candle> = BTreeMap::new();
        for candle in state.candles.values().filter(|c| c.resolution == resolution) {
            let entry = latest.entry(candle.contract_name.as_str()).or_insert(candle);
            if candle.epoch > entry.epoch {
                *entry = candle;
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn latest_epoch(&self, resolution: &str) -> IndexerResult<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state
            .candles
            .values()
            .filter(|c| c.resolution == resolution)
            .map(|c| c.epoch)
            .max())
    }

    async fn candles(
        &self,
        contract_name: &str,
        resolution: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> IndexerResult<Vec<Candle>> {
        let state = self.state.lock().await;
        let mut candles: Vec<Candle> = state
            .candles
            .values()
            .filter(|c| c.contract_name == contract_name && c.resolution == resolution)
            .filter(|c| from.is_none_or(|from| c.time >= from))
            .filter(|c| to.is_none_or(|to| c.time <= to))
            .cloned()
            .collect();
        candles.sort_by_key(|c| c.epoch);
        Ok(candles)
    }

    async fn has_candles(&self, contract_name: &str) -> IndexerResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .candles
            .keys()
            .any(|(contract, _, _)| contract == contract_name))
    }

    async fn set_candle_meta(&self, meta: &CandleMeta) -> IndexerResult<()> {
        self.state
            .lock()
            .await
            .meta
            .insert(meta.contract_name.clone(), meta.clone());
        Ok(())
    }

    async fn candle_meta(&self, contract_name: &str) -> IndexerResult<Option<CandleMeta>> {
        Ok(self.state.lock().await.meta.get(contract_name).cloned())
    }

    async fn halt_contract(&self, contract_name: &str, reason: &str) -> IndexerResult<()> {
        self.state
            .lock()
            .await
            .halted
            .entry(contract_name.to_string())
            .or_insert_with(|| reason.to_string());
        Ok(())
    }

    async fn halted_contracts(&self) -> IndexerResult<Vec<String>> {
        Ok(self.state.lock().await.halted.keys().cloned().collect())
    }

    async fn clear_derived(&self) -> IndexerResult<()> {
        let mut state = self.state.lock().await;
        state.trades.clear();
        state.trade_keys.clear();
        state.candles.clear();
        state.meta.clear();
        state.halted.clear();
        Ok(())
    }
}
