use std::str::FromStr;

use ammlook_schema::models::{NewTradeRow, PairRow, TradeRow};
use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{IndexerError, IndexerResult};

pub use ammlook_schema::models::{Candle, CandleMeta, TradeType};

/// One contract-state write, `key` laid out as `<contract>.<variable>:<key>[:...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub key: String,
    pub value: Value,
}

impl StateChange {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(alias = "block_num", alias = "blockNum")]
    pub number: i64,
    #[serde(default)]
    pub hash: Option<String>,
    pub timestamp: i64,
    #[serde(default, alias = "state_changes")]
    pub state: Vec<StateChange>,
}

/// A transaction from the source's historical-changes endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub tx_uid: String,
    #[serde(alias = "block_num", alias = "blockNum")]
    pub block_number: i64,
    #[serde(default)]
    pub hash: Option<String>,
    pub timestamp: i64,
    #[serde(default, alias = "state_changes")]
    pub state: Vec<StateChange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Parses a decimal from a JSON number, a JSON string or `{"__fixed__": "<decimal>"}`.
pub fn parse_decimal(value: &Value) -> IndexerResult<BigDecimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("__fixed__") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(IndexerError::malformed(format!("not a decimal: {value}"))),
        },
        _ => return Err(IndexerError::malformed(format!("not a decimal: {value}"))),
    };
    BigDecimal::from_str(text.trim())
        .map_err(|e| IndexerError::malformed(format!("not a decimal '{text}': {e}")))
}

/// Base and quote reserves of a pair.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reserves {
    pub base: BigDecimal,
    pub quote: BigDecimal,
}

impl Reserves {
    pub fn new(base: BigDecimal, quote: BigDecimal) -> Self {
        Self { base, quote }
    }

    pub fn zero() -> Self {
        Self::new(BigDecimal::zero(), BigDecimal::zero())
    }

    /// Parses the `[base, quote]` array stored under a `reserves` key.
    pub fn parse(value: &Value) -> IndexerResult<Self> {
        match value.as_array().map(Vec::as_slice) {
            Some([base, quote]) => Ok(Self::new(parse_decimal(base)?, parse_decimal(quote)?)),
            _ => Err(IndexerError::malformed(format!(
                "reserves must be a two element array, got {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub contract_name: String,
    pub token_symbol: String,
    pub reserves: Reserves,
}

impl From<PairRow> for Pair {
    fn from(row: PairRow) -> Self {
        Self {
            contract_name: row.contract_name,
            token_symbol: row.token_symbol,
            reserves: Reserves::new(row.base_reserve, row.quote_reserve),
        }
    }
}

impl From<&Pair> for PairRow {
    fn from(pair: &Pair) -> Self {
        Self {
            contract_name: pair.contract_name.clone(),
            token_symbol: pair.token_symbol.clone(),
            base_reserve: pair.reserves.base.clone(),
            quote_reserve: pair.reserves.quote.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub contract_name: String,
    pub price: BigDecimal,
    pub amount: BigDecimal,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    pub time: i64,
    pub hash: Option<String>,
}

impl From<&TradeRecord> for NewTradeRow {
    fn from(trade: &TradeRecord) -> Self {
        Self {
            contract_name: trade.contract_name.clone(),
            price: trade.price.clone(),
            amount: trade.amount.clone(),
            trade_type: trade.trade_type.to_string(),
            time: trade.time,
            hash: trade.hash.clone(),
        }
    }
}

impl TryFrom<TradeRow> for TradeRecord {
    type Error = IndexerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let trade_type = TradeType::from_str(&row.trade_type).map_err(|_| {
            IndexerError::malformed(format!(
                "trade {} has unknown type '{}'",
                row.id, row.trade_type
            ))
        })?;
        Ok(Self {
            contract_name: row.contract_name,
            price: row.price,
            amount: row.amount,
            trade_type,
            time: row.time,
            hash: row.hash,
        })
    }
}
