use bigdecimal::BigDecimal;
use tracing::{debug, info};

use crate::{
    candles::{
        CandleEngine,
        bucket::{Bucket, candle_precision},
    },
    error::IndexerResult,
    models::{Candle, CandleMeta, TradeRecord},
    resolution::Resolution,
};

/// One resolution's series while it is being rebuilt.
struct Series<'a> {
    resolution: &'a Resolution,
    next_epoch: i64,
    carried: BigDecimal,
}

impl<'a> Series<'a> {
    fn starting_at(resolution: &'a Resolution, first: &TradeRecord) -> Self {
        Self {
            resolution,
            next_epoch: resolution.epoch_of(first.time),
            carried: first.price.clone(),
        }
    }

    /// Emits every bucket that starts before `window_end` and no later than `now`.
    /// `trades` must be sorted and lie inside the window.
    fn extend(
        &mut self,
        contract_name: &str,
        trades: &[TradeRecord],
        window_end: i64,
        now: i64,
        out: &mut Vec<Candle>,
    ) {
        let mut next_trade = 0;
        loop {
            let start = self.resolution.bucket_start(self.next_epoch);
            if start >= window_end || start > now {
                return;
            }
            let end = self.resolution.bucket_end(self.next_epoch);

            let mut bucket = Bucket::carried(self.carried.clone());
            while let Some(trade) = trades.get(next_trade).filter(|t| t.time < end) {
                if trade.time >= start {
                    bucket.apply(&trade.price, &trade.amount);
                }
                next_trade += 1;
            }

            self.carried = bucket.close.clone();
            out.push(bucket.into_candle(contract_name, self.resolution, self.next_epoch));
            self.next_epoch += 1;
        }
    }
}

impl CandleEngine {
    /// Rebuilds every candle of a contract from its full trade history.
    ///
    /// Trades are fetched once per coarsest-resolution epoch. A contract
    /// without trades is left untouched.
    pub async fn backfill_contract(&self, contract_name: &str) -> IndexerResult<usize> {
        let Some(first) = self.store.first_trade(contract_name).await? else {
            debug!(contract = contract_name, "no trades, skipping backfill");
            return Ok(0);
        };

        let now = self.now();
        let coarsest = self.resolutions.coarsest();
        let mut series: Vec<Series<'_>> = self
            .resolutions
            .iter()
            .map(|r| Series::starting_at(r, &first))
            .collect();

        let mut candles = Vec::new();
        for macro_epoch in coarsest.epoch_of(first.time)..=coarsest.epoch_of(now) {
            let start = coarsest.bucket_start(macro_epoch);
            let end = coarsest.bucket_end(macro_epoch);
            let trades = self
                .store
                .trades_in_window(Some(contract_name), start, end)
                .await?;
            for s in &mut series {
                s.extend(contract_name, &trades, end, now, &mut candles);
            }
        }

        let precision = candles
            .iter()
            .map(|c| candle_precision(c, self.max_precision))
            .max()
            .unwrap_or(0);

        self.write(&candles).await?;
        self.store
            .set_candle_meta(&CandleMeta {
                contract_name: contract_name.to_string(),
                precision,
            })
            .await?;

        info!(
            contract = contract_name,
            candles = candles.len(),
            precision,
            "backfilled candles"
        );
        Ok(candles.len())
    }

    pub async fn backfill_all(&self, contracts: &[String]) -> IndexerResult<usize> {
        let mut written = 0;
        for contract in contracts {
            written += self.backfill_contract(contract).await?;
        }
        Ok(written)
    }
}
