// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use bigdecimal::BigDecimal;
use diesel::{AsChangeset, Identifiable, Insertable, Queryable, Selectable};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::schema::{candle_meta, candles, halted_contracts, pairs, sync_cursor, trades};

#[derive(Queryable, Selectable, Insertable, AsChangeset, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = pairs, primary_key(contract_name))]
pub struct PairRow {
    pub contract_name: String,
    pub token_symbol: String,
    pub base_reserve: BigDecimal,
    pub quote_reserve: BigDecimal,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = trades)]
pub struct TradeRow {
    pub id: i64,
    pub contract_name: String,
    pub price: BigDecimal,
    pub amount: BigDecimal,
    pub trade_type: String,
    pub time: i64,
    pub hash: Option<String>,
}

#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = trades)]
pub struct NewTradeRow {
    pub contract_name: String,
    pub price: BigDecimal,
    pub amount: BigDecimal,
    pub trade_type: String,
    pub time: i64,
    pub hash: Option<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
}

/// One OHLC bucket, keyed by `(contract_name, resolution, epoch)`.
#[derive(
    Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq, Serialize, Deserialize,
)]
#[diesel(table_name = candles)]
pub struct Candle {
    pub contract_name: String,
    pub resolution: String,
    pub epoch: i64,
    pub time: i64,
    pub open: BigDecimal,
    pub high: BigDecimal,
    pub low: BigDecimal,
    pub close: BigDecimal,
    pub last: BigDecimal,
    pub volume: BigDecimal,
}

#[derive(
    Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq, Eq, Serialize,
    Deserialize,
)]
#[diesel(table_name = candle_meta)]
pub struct CandleMeta {
    pub contract_name: String,
    pub precision: i32,
}

/// A contract the indexer stopped deriving after a consistency failure.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = halted_contracts)]
pub struct HaltedContractRow {
    pub contract_name: String,
    pub reason: String,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, Copy, PartialEq, Eq)]
#[diesel(table_name = sync_cursor)]
pub struct SyncCursorRow {
    pub id: i32,
    pub block_number: i64,
}
