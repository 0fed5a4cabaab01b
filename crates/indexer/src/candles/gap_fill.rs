use std::collections::{BTreeMap, HashSet};

use bigdecimal::BigDecimal;
use tracing::info;

use crate::{
    candles::{Bucket, CandleEngine},
    error::IndexerResult,
};

struct Tail {
    epoch: i64,
    close: BigDecimal,
}

impl CandleEngine {
    /// Brings candles up to date after downtime.
    ///
    /// Each contract's active row is recomputed from its open and the trades
    /// stored for its window, so trades applied before the shutdown are not
    /// counted twice. A row holding more volume than its window's trades also
    /// absorbed live trades whose block time fell before the row opened, and
    /// is kept as stored. Missing epochs up to the current one are then synthesized
    /// from the carried close plus their historical trades.
    pub async fn fill_gaps(&self, contracts: &[String]) -> IndexerResult<usize> {
        let now = self.now();
        let wanted: HashSet<&str> = contracts.iter().map(String::as_str).collect();
        let mut written = 0;

        for resolution in &self.resolutions {
            let target = resolution.epoch_of(now);
            let mut rows = Vec::new();
            let mut tails: BTreeMap<String, Tail> = BTreeMap::new();

            for active in self.store.latest_candles(resolution.as_str()).await? {
                if !wanted.contains(active.contract_name.as_str()) {
                    continue;
                }
                let trades = self
                    .store
                    .trades_in_window(
                        Some(&active.contract_name),
                        resolution.bucket_start(active.epoch),
                        resolution.bucket_end(active.epoch),
                    )
                    .await?;
                let mut bucket = Bucket::carried(active.open.clone());
                for trade in &trades {
                    bucket.apply(&trade.price, &trade.amount);
                }
                if active.volume > bucket.volume {
                    // live trades stamped before the row opened were applied to it
                    tails.insert(
                        active.contract_name.clone(),
                        Tail {
                            epoch: active.epoch,
                            close: active.close.clone(),
                        },
                    );
                    continue;
                }
                tails.insert(
                    active.contract_name.clone(),
                    Tail {
                        epoch: active.epoch,
                        close: bucket.close.clone(),
                    },
                );
                rows.push(bucket.into_candle(&active.contract_name, resolution, active.epoch));
            }

            let Some(first_missing) = tails.values().map(|t| t.epoch + 1).min() else {
                continue;
            };
            for epoch in first_missing..=target {
                let trades = self
                    .store
                    .trades_in_window(
                        None,
                        resolution.bucket_start(epoch),
                        resolution.bucket_end(epoch),
                    )
                    .await?;
                for (contract_name, tail) in tails.iter_mut() {
                    if tail.epoch >= epoch {
                        continue;
                    }
                    let mut bucket = Bucket::carried(tail.close.clone());
                    for trade in trades.iter().filter(|t| &t.contract_name == contract_name) {
                        bucket.apply(&trade.price, &trade.amount);
                    }
                    tail.epoch = epoch;
                    tail.close = bucket.close.clone();
                    rows.push(bucket.into_candle(contract_name, resolution, epoch));
                }
            }

            self.write(&rows).await?;
            info!(%resolution, rows = rows.len(), up_to_epoch = target, "filled candle gaps");
            written += rows.len();
        }
        Ok(written)
    }
}
