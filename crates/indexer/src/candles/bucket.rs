use bigdecimal::{BigDecimal, Zero};

use crate::{models::Candle, resolution::Resolution};

/// OHLC accumulator shared by every aggregation path.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub open: BigDecimal,
    pub high: BigDecimal,
    pub low: BigDecimal,
    pub close: BigDecimal,
    pub volume: BigDecimal,
}

impl Bucket {
    /// A bucket with no trades yet, flat at `price`.
    pub fn carried(price: BigDecimal) -> Self {
        Self {
            open: price.clone(),
            high: price.clone(),
            low: price.clone(),
            close: price,
            volume: BigDecimal::zero(),
        }
    }

    pub fn from_candle(candle: &Candle) -> Self {
        Self {
            open: candle.open.clone(),
            high: candle.high.clone(),
            low: candle.low.clone(),
            close: candle.close.clone(),
            volume: candle.volume.clone(),
        }
    }

    pub fn apply(&mut self, price: &BigDecimal, amount: &BigDecimal) {
        if *price < self.low {
            self.low = price.clone();
        }
        if *price > self.high {
            self.high = price.clone();
        }
        self.close = price.clone();
        self.volume += amount;
    }

    pub fn into_candle(self, contract_name: &str, resolution: &Resolution, epoch: i64) -> Candle {
        Candle {
            contract_name: contract_name.to_string(),
            resolution: resolution.to_string(),
            epoch,
            time: resolution.bucket_start(epoch),
            open: self.open,
            high: self.high,
            low: self.low,
            last: self.close.clone(),
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Significant fractional digits of `value`, ignoring trailing zeros.
pub fn fractional_digits(value: &BigDecimal) -> i64 {
    let (_, scale) = value.normalized().as_bigint_and_exponent();
    scale.max(0)
}

/// Display precision of one candle's OHLC values, capped at `max_precision`.
pub fn candle_precision(candle: &Candle, max_precision: i32) -> i32 {
    [&candle.open, &candle.high, &candle.low, &candle.close]
        .into_iter()
        .map(fractional_digits)
        .max()
        .unwrap_or(0)
        .min(i64::from(max_precision)) as i32
}
