#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use ammlook_indexer::{
    IndexerError, IndexerResult,
    clock::ManualClock,
    config::IndexerConfig,
    metrics::IndexerMetrics,
    models::{Block, HistoryEntry, StateChange, TradeRecord, TradeType},
    source::{BlockSource, BlockStream, RetryConfig},
    store::RuntimeStore,
    sync::SyncOrchestrator,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const AMM: &str = "con_amm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Latest,
    Fetch(i64),
    Subscribe,
}

#[derive(Default)]
struct Script {
    /// Answers to successive latest-block queries; the last one sticks.
    latest: Vec<i64>,
    blocks: BTreeMap<i64, Block>,
    history: Vec<HistoryEntry>,
    state: Vec<StateChange>,
    symbols: HashMap<String, String>,
    feeds: Vec<mpsc::Receiver<Block>>,
    idle: Vec<mpsc::Sender<Block>>,
    events: Vec<Event>,
}

/// A block source that serves canned blocks and records what was asked of it.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn new(latest: i64) -> Self {
        let source = Self::default();
        source.script.lock().unwrap().latest = vec![latest];
        source
    }

    pub fn add_block(&self, block: Block) {
        let mut script = self.script.lock().unwrap();
        match script.latest.last_mut() {
            Some(latest) => *latest = (*latest).max(block.number),
            None => script.latest.push(block.number),
        }
        script.blocks.insert(block.number, block);
    }

    /// The latest block reported once the earlier answers are used up.
    pub fn then_latest(&self, latest: i64) {
        self.script.lock().unwrap().latest.push(latest);
    }

    /// Makes a block fetchable without announcing it as the latest.
    pub fn stash_block(&self, block: Block) {
        self.script.lock().unwrap().blocks.insert(block.number, block);
    }

    pub fn set_state(&self, state: Vec<StateChange>) {
        self.script.lock().unwrap().state = state;
    }

    pub fn push_history(&self, entry: HistoryEntry) {
        self.script.lock().unwrap().history.push(entry);
    }

    pub fn set_symbol(&self, contract: &str, symbol: &str) {
        self.script
            .lock()
            .unwrap()
            .symbols
            .insert(contract.to_string(), symbol.to_string());
    }

    /// Queues a live feed; the next subscription receives what is sent here.
    pub fn feed(&self) -> mpsc::Sender<Block> {
        let (tx, rx) = mpsc::channel(64);
        self.script.lock().unwrap().feeds.push(rx);
        tx
    }

    pub fn events(&self) -> Vec<Event> {
        self.script.lock().unwrap().events.clone()
    }

    pub fn fetched(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Fetch(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn subscribed(&self) -> bool {
        self.events().contains(&Event::Subscribe)
    }
}

#[async_trait]
impl BlockSource for ScriptedSource {
    async fn fetch_block(&self, number: i64) -> IndexerResult<Block> {
        let mut script = self.script.lock().unwrap();
        script.events.push(Event::Fetch(number));
        script
            .blocks
            .get(&number)
            .cloned()
            .ok_or_else(|| IndexerError::NotFound(format!("block {number}")))
    }

    async fn latest_known_block(&self) -> IndexerResult<i64> {
        let mut script = self.script.lock().unwrap();
        script.events.push(Event::Latest);
        let latest = if script.latest.len() > 1 {
            script.latest.remove(0)
        } else {
            script.latest.first().copied().unwrap_or(0)
        };
        Ok(latest)
    }

    async fn subscribe(&self) -> IndexerResult<BlockStream> {
        let mut script = self.script.lock().unwrap();
        script.events.push(Event::Subscribe);
        if script.feeds.is_empty() {
            // nothing scripted: a feed that stays open and silent
            let (tx, rx) = mpsc::channel(1);
            script.idle.push(tx);
            return Ok(rx);
        }
        Ok(script.feeds.remove(0))
    }

    async fn contract_state(&self, _contract: &str) -> IndexerResult<Vec<StateChange>> {
        Ok(self.script.lock().unwrap().state.clone())
    }

    async fn history_page(
        &self,
        _contract: &str,
        last_tx_uid: &str,
        limit: usize,
    ) -> IndexerResult<Vec<HistoryEntry>> {
        let after: u64 = last_tx_uid
            .parse()
            .map_err(|_| IndexerError::malformed(format!("bad tx uid {last_tx_uid}")))?;
        Ok(self
            .script
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|e| e.tx_uid.parse::<u64>().is_ok_and(|uid| uid > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn token_symbol(&self, contract: &str) -> IndexerResult<String> {
        Ok(self
            .script
            .lock()
            .unwrap()
            .symbols
            .get(contract)
            .cloned()
            .unwrap_or_else(|| contract.to_string()))
    }
}

pub fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

fn amm_change(variable: &str, contract: &str, value: Value) -> StateChange {
    StateChange::new(format!("{AMM}.{variable}:{contract}"), value)
}

pub fn pair_created(contract: &str) -> StateChange {
    amm_change("pairs", contract, json!(true))
}

pub fn reserves(contract: &str, base: &str, quote: &str) -> StateChange {
    amm_change(
        "reserves",
        contract,
        json!([{"__fixed__": base}, {"__fixed__": quote}]),
    )
}

pub fn price(contract: &str, price: &str) -> StateChange {
    amm_change("prices", contract, json!({"__fixed__": price}))
}

pub fn block(number: i64, timestamp: i64, state: Vec<StateChange>) -> Block {
    Block {
        number,
        hash: Some(format!("0x{number:04x}")),
        timestamp,
        state,
    }
}

pub fn history(tx_uid: u64, block_number: i64, timestamp: i64, state: Vec<StateChange>) -> HistoryEntry {
    HistoryEntry {
        tx_uid: tx_uid.to_string(),
        block_number,
        hash: None,
        timestamp,
        state,
    }
}

pub fn trade(contract: &str, price: &str, amount: &str, time: i64) -> TradeRecord {
    TradeRecord {
        contract_name: contract.into(),
        price: dec(price),
        amount: dec(amount),
        trade_type: TradeType::Buy,
        time,
        hash: None,
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: u32::MAX,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff_factor: 2.0,
        jitter: false,
    }
}

pub fn orchestrator(
    store: &RuntimeStore,
    source: &ScriptedSource,
    clock: &ManualClock,
    resolutions: &[&str],
    history_page_size: usize,
) -> Arc<SyncOrchestrator> {
    let config = IndexerConfig::new(AMM, resolutions, 10, history_page_size).unwrap();
    Arc::new(
        SyncOrchestrator::new(
            config,
            Arc::new(store.clone()),
            Arc::new(source.clone()),
            Arc::new(clock.clone()),
            IndexerMetrics::unregistered().unwrap(),
        )
        .with_retry(fast_retry()),
    )
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
