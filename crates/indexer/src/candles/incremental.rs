use bigdecimal::BigDecimal;
use tracing::{debug, info};

use crate::{
    candles::{
        CandleEngine,
        bucket::{Bucket, fractional_digits},
    },
    error::{IndexerError, IndexerResult},
    models::{CandleMeta, TradeRecord},
};

impl CandleEngine {
    /// Applies a live trade to the active candle of every resolution.
    ///
    /// Never creates rows: a missing active row for any resolution fails the
    /// whole update before anything is written.
    pub async fn apply_trade(&self, trade: &TradeRecord) -> IndexerResult<()> {
        let mut updated = Vec::with_capacity(self.resolutions.len());
        for resolution in &self.resolutions {
            let active = self
                .store
                .latest_candle(&trade.contract_name, resolution.as_str())
                .await?
                .ok_or_else(|| {
                    IndexerError::consistency(
                        &trade.contract_name,
                        format!("no active {resolution} candle"),
                    )
                })?;

            let mut bucket = Bucket::from_candle(&active);
            bucket.apply(&trade.price, &trade.amount);
            updated.push(bucket.into_candle(&active.contract_name, resolution, active.epoch));
        }

        self.write(&updated).await?;
        debug!(
            contract = %trade.contract_name,
            price = %trade.price,
            "applied trade to active candles"
        );
        Ok(())
    }

    /// Opens a contract's first candles at the current epoch, flat at `price`.
    ///
    /// Resolutions that already have rows are left alone.
    pub async fn seed_genesis(&self, contract_name: &str, price: &BigDecimal) -> IndexerResult<()> {
        let now = self.now();
        let mut rows = Vec::new();
        for resolution in &self.resolutions {
            if self
                .store
                .latest_candle(contract_name, resolution.as_str())
                .await?
                .is_some()
            {
                continue;
            }
            rows.push(Bucket::carried(price.clone()).into_candle(
                contract_name,
                resolution,
                resolution.epoch_of(now),
            ));
        }
        if rows.is_empty() {
            return Ok(());
        }

        self.write(&rows).await?;
        if self.store.candle_meta(contract_name).await?.is_none() {
            let precision = fractional_digits(price).min(i64::from(self.max_precision)) as i32;
            self.store
                .set_candle_meta(&CandleMeta {
                    contract_name: contract_name.to_string(),
                    precision,
                })
                .await?;
        }
        info!(contract = contract_name, %price, "seeded genesis candles");
        Ok(())
    }
}
