use std::collections::{BTreeSet, HashMap};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    deriver::{BlockContext, derive},
    error::IndexerResult,
    models::{HistoryEntry, Pair, Reserves, StateChange},
    sync::{SyncOrchestrator, SyncState},
};

const FIRST_TX_UID: &str = "0";

impl SyncOrchestrator {
    /// Seeds pairs and trades from the source's state and history endpoints.
    ///
    /// Every pair in the state scan is stored with its scanned reserves, then
    /// the history replay overwrites the reserves of the pairs it recreates
    /// with their snapshot as of the watermark.
    ///
    /// Returns the watermark, which is persisted as the cursor, or `None` when
    /// cancelled. Anything derived by an interrupted earlier run is dropped
    /// first since no cursor means none of it can be trusted.
    pub(crate) async fn bootstrap(&self, cancel: &CancellationToken) -> IndexerResult<Option<i64>> {
        self.store.clear_derived().await?;

        let Some(watermark) = self
            .retry_until_cancelled("latest block", cancel, || self.source.latest_known_block())
            .await?
        else {
            return Ok(None);
        };
        info!(state = %SyncState::Bootstrap, watermark, "bootstrapping");

        let amm = self.config.amm_contract.as_str();
        let Some(state) = self
            .retry_until_cancelled("AMM state scan", cancel, || self.source.contract_state(amm))
            .await?
        else {
            return Ok(None);
        };
        let scan = derive(
            amm,
            BlockContext {
                timestamp: 0,
                hash: None,
            },
            &state,
            &HashMap::new(),
        );
        for (contract_name, err) in &scan.failures {
            warn!(contract = %contract_name, "skipping scanned pair: {err}");
        }

        let mut symbols = HashMap::new();
        let mut scanned = Vec::with_capacity(scan.new_pairs.len());
        for (contract_name, reserves) in scan.new_pairs {
            let Some(symbol) = self.symbol_for(&contract_name, &mut symbols, cancel).await? else {
                return Ok(None);
            };
            scanned.push(Pair {
                contract_name,
                token_symbol: symbol,
                reserves,
            });
        }
        if !scanned.is_empty() {
            self.store.upsert_pairs(&scanned).await?;
        }
        info!(pairs = scanned.len(), "seeded pairs from AMM state");

        let Some(replayed) = self.replay_history(watermark, &mut symbols, cancel).await? else {
            return Ok(None);
        };

        let scan_only = scanned
            .iter()
            .filter(|pair| !replayed.contains(&pair.contract_name))
            .count();
        if scan_only > 0 {
            // reserves stay as scanned; a later creation block only resets them
            info!(scan_only, "pairs without replayed history");
        }

        self.store.set_last_processed_block(watermark).await?;
        info!(
            watermark,
            scanned = scanned.len(),
            replayed = replayed.len(),
            "bootstrap complete"
        );
        Ok(Some(watermark))
    }

    async fn symbol_for(
        &self,
        contract_name: &str,
        symbols: &mut HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> IndexerResult<Option<String>> {
        if let Some(symbol) = symbols.get(contract_name) {
            return Ok(Some(symbol.clone()));
        }
        let Some(symbol) = self
            .retry_until_cancelled("token symbol", cancel, || {
                self.source.token_symbol(contract_name)
            })
            .await?
        else {
            return Ok(None);
        };
        symbols.insert(contract_name.to_string(), symbol.clone());
        Ok(Some(symbol))
    }

    /// Pages through the AMM history up to `watermark`, persisting pairs with
    /// their running reserves before each page's trades.
    ///
    /// Returns the contracts the replay created.
    async fn replay_history(
        &self,
        watermark: i64,
        symbols: &mut HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> IndexerResult<Option<BTreeSet<String>>> {
        let amm = self.config.amm_contract.as_str();
        let page_size = self.config.history_page_size;
        let mut running: HashMap<String, Reserves> = HashMap::new();
        let mut last_tx_uid = FIRST_TX_UID.to_string();
        let mut entries_replayed = 0usize;
        let mut trades_replayed = 0usize;

        loop {
            let Some(page) = self
                .retry_until_cancelled("AMM history", cancel, || {
                    self.source.history_page(amm, &last_tx_uid, page_size)
                })
                .await?
            else {
                return Ok(None);
            };

            let mut touched = BTreeSet::new();
            let mut trades = Vec::new();
            let mut past_watermark = false;
            for entry in &page {
                if entry.block_number > watermark {
                    past_watermark = true;
                    continue;
                }
                let changes = self.replayable_changes(entry).await;
                let derivation = derive(
                    amm,
                    BlockContext {
                        timestamp: entry.timestamp,
                        hash: entry.hash.as_deref(),
                    },
                    &changes,
                    &running,
                );
                for (contract_name, err) in &derivation.failures {
                    self.halt(contract_name, err).await?;
                }
                for (contract_name, reserves) in derivation
                    .new_pairs
                    .into_iter()
                    .chain(derivation.reserve_updates)
                {
                    touched.insert(contract_name.clone());
                    running.insert(contract_name, reserves);
                }
                trades.extend(derivation.trades);
                entries_replayed += 1;
            }

            let mut pairs = Vec::with_capacity(touched.len());
            for contract_name in touched {
                let Some(token_symbol) = self.symbol_for(&contract_name, symbols, cancel).await?
                else {
                    return Ok(None);
                };
                pairs.push(Pair {
                    token_symbol,
                    reserves: running[&contract_name].clone(),
                    contract_name,
                });
            }
            if !pairs.is_empty() {
                self.store.upsert_pairs(&pairs).await?;
            }
            if !trades.is_empty() {
                trades_replayed += self.store.insert_trades(&trades).await?.len();
            }

            match page.last() {
                Some(last) if page.len() >= page_size && !past_watermark => {
                    last_tx_uid = last.tx_uid.clone();
                }
                _ => break,
            }
        }

        info!(
            entries = entries_replayed,
            trades = trades_replayed,
            pairs = running.len(),
            "replayed AMM history"
        );
        Ok(Some(running.into_keys().collect()))
    }

    /// The entry's changes minus those of halted contracts.
    async fn replayable_changes(&self, entry: &HistoryEntry) -> Vec<StateChange> {
        let halted = self.registry.halted().await;
        if halted.is_empty() {
            return entry.state.clone();
        }
        entry
            .state
            .iter()
            .filter(|change| {
                !halted
                    .iter()
                    .any(|contract| change.key.split(':').nth(1) == Some(contract.as_str()))
            })
            .cloned()
            .collect()
    }
}
