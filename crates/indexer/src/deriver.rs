//! Turns AMM contract-state writes into pair reserve snapshots and trades.
//!
//! [`derive`] is pure and serves both live blocks and the cold-start history
//! replay. [`TradeDeriver`] wraps it with the store and token registry.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bigdecimal::BigDecimal;
use tracing::debug;

use crate::{
    error::{IndexerError, IndexerResult},
    models::{Pair, Reserves, StateChange, TradeRecord, TradeType, parse_decimal},
    source::BlockSource,
    store::Store,
};

const RESERVES: &str = "reserves";
const PRICES: &str = "prices";
const PAIRS: &str = "pairs";

/// Block-level facts every derived trade inherits.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub timestamp: i64,
    pub hash: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub contract_name: String,
    pub price: BigDecimal,
}

/// Everything one batch of state changes implies.
#[derive(Debug, Default)]
pub struct Derivation {
    /// Contracts seen for the first time, with their opening reserves.
    pub new_pairs: Vec<(String, Reserves)>,
    /// Reserve snapshots for contracts that were already known.
    pub reserve_updates: Vec<(String, Reserves)>,
    pub trades: Vec<TradeRecord>,
    pub listings: Vec<Listing>,
    pub failures: Vec<(String, IndexerError)>,
}

#[derive(Default)]
struct ContractChanges<'a> {
    reserves: Option<&'a serde_json::Value>,
    price: Option<&'a serde_json::Value>,
    marker: bool,
}

/// Splits `<amm>.<variable>:<contract>[:...]` into variable and contract.
fn split_key<'a>(amm_contract: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let (root, rest) = key.split_once('.')?;
    if root != amm_contract {
        return None;
    }
    let mut parts = rest.split(':');
    let variable = parts.next()?;
    let contract = parts.next().filter(|c| !c.is_empty())?;
    Some((variable, contract))
}

/// Whether a key belongs to the AMM contract.
pub fn is_amm_key(amm_contract: &str, key: &str) -> bool {
    key.split('.').next() == Some(amm_contract)
}

/// Contracts whose pair, reserve or price entries appear in `changes`.
pub fn touched_contracts<'a>(amm_contract: &str, changes: &'a [StateChange]) -> Vec<&'a str> {
    let mut contracts: Vec<&str> = changes
        .iter()
        .filter_map(|c| split_key(amm_contract, &c.key))
        .filter(|(variable, _)| matches!(*variable, RESERVES | PRICES | PAIRS))
        .map(|(_, contract)| contract)
        .collect();
    contracts.sort_unstable();
    contracts.dedup();
    contracts
}

/// Derives pairs, reserve snapshots and trades from one batch of changes.
///
/// `known` holds the reserves persisted before this batch. When a key is
/// written twice in a batch the later write wins. Failures are reported per
/// contract and never affect other contracts.
pub fn derive(
    amm_contract: &str,
    ctx: BlockContext<'_>,
    changes: &[StateChange],
    known: &HashMap<String, Reserves>,
) -> Derivation {
    let mut by_contract: BTreeMap<&str, ContractChanges<'_>> = BTreeMap::new();
    for change in changes {
        let Some((variable, contract)) = split_key(amm_contract, &change.key) else {
            continue;
        };
        let entry = by_contract.entry(contract).or_default();
        match variable {
            RESERVES => entry.reserves = Some(&change.value),
            PRICES => entry.price = Some(&change.value),
            PAIRS => entry.marker = true,
            _ => {}
        }
    }

    let mut out = Derivation::default();
    for (contract, changes) in by_contract {
        if changes.reserves.is_none() && changes.price.is_none() && !changes.marker {
            continue;
        }
        if let Err(err) = derive_contract(contract, &changes, ctx, known, &mut out) {
            out.failures.push((contract.to_string(), err));
        }
    }
    out
}

fn for_contract(contract: &str, field: &str, err: IndexerError) -> IndexerError {
    match err {
        IndexerError::Malformed(reason) => {
            IndexerError::malformed(format!("{contract} {field}: {reason}"))
        }
        other => other,
    }
}

fn derive_contract(
    contract: &str,
    changes: &ContractChanges<'_>,
    ctx: BlockContext<'_>,
    known: &HashMap<String, Reserves>,
    out: &mut Derivation,
) -> IndexerResult<()> {
    let new_reserves = changes
        .reserves
        .map(Reserves::parse)
        .transpose()
        .map_err(|e| for_contract(contract, "reserves", e))?;
    let price = changes
        .price
        .map(parse_decimal)
        .transpose()
        .map_err(|e| for_contract(contract, "price", e))?;

    let Some(old) = known.get(contract) else {
        if !changes.marker && new_reserves.is_none() {
            return Err(IndexerError::consistency(
                contract,
                "price change for a pair that was never created",
            ));
        }
        out.new_pairs.push((
            contract.to_string(),
            new_reserves.unwrap_or_else(Reserves::zero),
        ));
        if let Some(price) = price {
            out.listings.push(Listing {
                contract_name: contract.to_string(),
                price,
            });
        }
        return Ok(());
    };

    if changes.marker {
        // creation block of a pair already seeded from a state scan
        if let Some(new) = new_reserves {
            out.reserve_updates.push((contract.to_string(), new));
        }
        if let Some(price) = price {
            out.listings.push(Listing {
                contract_name: contract.to_string(),
                price,
            });
        }
        return Ok(());
    }

    match (price, new_reserves) {
        (Some(price), Some(new)) => {
            let trade_type = if new.base > old.base {
                TradeType::Buy
            } else {
                TradeType::Sell
            };
            let amount = (&old.quote - &new.quote).abs();
            out.trades.push(TradeRecord {
                contract_name: contract.to_string(),
                price,
                amount,
                trade_type,
                time: ctx.timestamp,
                hash: ctx.hash.map(str::to_string),
            });
            out.reserve_updates.push((contract.to_string(), new));
        }
        (Some(_), None) => {
            return Err(IndexerError::malformed(format!(
                "{contract} price changed without a matching reserve change"
            )));
        }
        (None, Some(new)) => out.reserve_updates.push((contract.to_string(), new)),
        (None, None) => {}
    }
    Ok(())
}

/// What applying one block produced.
#[derive(Debug, Default)]
pub struct BlockOutcome {
    pub new_pairs: Vec<String>,
    pub trades: Vec<TradeRecord>,
    pub listings: Vec<Listing>,
    pub failures: Vec<(String, IndexerError)>,
}

pub struct TradeDeriver {
    amm_contract: String,
    store: Arc<dyn Store>,
    source: Arc<dyn BlockSource>,
}

impl TradeDeriver {
    pub fn new(
        amm_contract: impl Into<String>,
        store: Arc<dyn Store>,
        source: Arc<dyn BlockSource>,
    ) -> Self {
        Self {
            amm_contract: amm_contract.into(),
            store,
            source,
        }
    }

    pub fn amm_contract(&self) -> &str {
        &self.amm_contract
    }

    /// Derives and persists one batch.
    ///
    /// New pairs are written first, then trades, then reserve moves. A block
    /// applied again after a crash re-derives from the reserves it started
    /// from, and trades already stored under the same hash are not appended
    /// twice. Changes for contracts in `skip` are ignored.
    pub async fn apply(
        &self,
        ctx: BlockContext<'_>,
        changes: &[StateChange],
        skip: &[String],
    ) -> IndexerResult<BlockOutcome> {
        let changes: Vec<StateChange> = changes
            .iter()
            .filter(|c| is_amm_key(&self.amm_contract, &c.key))
            .filter(|c| {
                split_key(&self.amm_contract, &c.key)
                    .is_none_or(|(_, contract)| !skip.iter().any(|s| s == contract))
            })
            .cloned()
            .collect();
        if changes.is_empty() {
            return Ok(BlockOutcome::default());
        }

        let mut existing: HashMap<String, Pair> = HashMap::new();
        for contract in touched_contracts(&self.amm_contract, &changes) {
            if let Some(pair) = self.store.get_pair(contract).await? {
                existing.insert(contract.to_string(), pair);
            }
        }
        let known: HashMap<String, Reserves> = existing
            .iter()
            .map(|(name, pair)| (name.clone(), pair.reserves.clone()))
            .collect();

        let derivation = derive(&self.amm_contract, ctx, &changes, &known);

        let mut created = Vec::with_capacity(derivation.new_pairs.len());
        for (contract_name, reserves) in &derivation.new_pairs {
            let token_symbol = self.source.token_symbol(contract_name).await?;
            created.push(Pair {
                contract_name: contract_name.clone(),
                token_symbol,
                reserves: reserves.clone(),
            });
        }
        if !created.is_empty() {
            self.store.upsert_pairs(&created).await?;
        }

        let trades = if derivation.trades.is_empty() {
            Vec::new()
        } else {
            self.store.insert_trades(&derivation.trades).await?
        };
        if trades.len() < derivation.trades.len() {
            debug!(
                skipped = derivation.trades.len() - trades.len(),
                "trades already stored"
            );
        }

        let moved: Vec<Pair> = derivation
            .reserve_updates
            .iter()
            .filter_map(|(contract_name, reserves)| {
                existing.get(contract_name).map(|pair| Pair {
                    reserves: reserves.clone(),
                    ..pair.clone()
                })
            })
            .collect();
        if !moved.is_empty() {
            self.store.upsert_pairs(&moved).await?;
        }

        for trade in &trades {
            debug!(
                contract = %trade.contract_name,
                price = %trade.price,
                amount = %trade.amount,
                "{} trade", trade.trade_type
            );
        }

        Ok(BlockOutcome {
            new_pairs: derivation.new_pairs.into_iter().map(|(c, _)| c).collect(),
            trades,
            listings: derivation.listings,
            failures: derivation.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use serde_json::{Value, json};

    use super::*;

    const AMM: &str = "con_amm";

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn change(key: &str, value: Value) -> StateChange {
        StateChange::new(format!("{AMM}.{key}"), value)
    }

    fn reserves(base: &str, quote: &str) -> Value {
        json!([{"__fixed__": base}, {"__fixed__": quote}])
    }

    fn ctx() -> BlockContext<'static> {
        BlockContext {
            timestamp: 7_250,
            hash: Some("0xabc"),
        }
    }

    fn known(contract: &str, base: &str, quote: &str) -> HashMap<String, Reserves> {
        HashMap::from([(contract.to_string(), Reserves::new(dec(base), dec(quote)))])
    }

    #[test]
    fn base_reserve_increase_is_a_buy() {
        let changes = vec![
            change("reserves:con_x", reserves("110", "900")),
            change("prices:con_x", json!({"__fixed__": "0.1222"})),
        ];
        let out = derive(AMM, ctx(), &changes, &known("con_x", "100", "1000"));

        assert!(out.failures.is_empty());
        assert_eq!(out.trades.len(), 1);
        let trade = &out.trades[0];
        assert_eq!(trade.trade_type, TradeType::Buy);
        assert_eq!(trade.amount, dec("100"));
        assert_eq!(trade.price, dec("0.1222"));
        assert_eq!(trade.time, 7_250);
        assert_eq!(trade.hash.as_deref(), Some("0xabc"));
        assert_eq!(
            out.reserve_updates,
            vec![("con_x".to_string(), Reserves::new(dec("110"), dec("900")))]
        );
    }

    #[test]
    fn base_reserve_decrease_is_a_sell_with_non_negative_amount() {
        let changes = vec![
            change("prices:con_x", json!("0.08")),
            change("reserves:con_x", reserves("90", "1125")),
        ];
        let out = derive(AMM, ctx(), &changes, &known("con_x", "100", "1000"));
        assert_eq!(out.trades[0].trade_type, TradeType::Sell);
        assert_eq!(out.trades[0].amount, dec("125"));
    }

    #[test]
    fn ignores_keys_outside_the_amm_contract() {
        let changes = vec![
            StateChange::new("currency.balances:alice", json!(5)),
            StateChange::new("con_other.prices:con_x", json!(1)),
        ];
        let out = derive(AMM, ctx(), &changes, &HashMap::new());
        assert!(out.trades.is_empty() && out.new_pairs.is_empty() && out.failures.is_empty());
    }

    #[test]
    fn price_change_for_unknown_pair_is_a_consistency_error() {
        let changes = vec![change("prices:con_ghost", json!("1.0"))];
        let out = derive(AMM, ctx(), &changes, &HashMap::new());
        assert_eq!(out.failures.len(), 1);
        let (contract, err) = &out.failures[0];
        assert_eq!(contract, "con_ghost");
        assert!(matches!(err, IndexerError::Consistency { .. }));
    }

    #[test]
    fn price_change_without_reserves_is_malformed() {
        let changes = vec![change("prices:con_x", json!("1.0"))];
        let out = derive(AMM, ctx(), &changes, &known("con_x", "1", "1"));
        assert!(matches!(out.failures[0].1, IndexerError::Malformed(_)));
        assert!(out.trades.is_empty());
    }

    #[test]
    fn unparseable_values_fail_only_their_contract() {
        let changes = vec![
            change("reserves:con_x", reserves("oops", "1")),
            change("prices:con_x", json!("1")),
            change("reserves:con_y", reserves("11", "9")),
            change("prices:con_y", json!("2")),
        ];
        let mut pairs = known("con_x", "1", "1");
        pairs.extend(known("con_y", "10", "10"));
        let out = derive(AMM, ctx(), &changes, &pairs);

        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].0, "con_x");
        assert_eq!(out.trades.len(), 1);
        assert_eq!(out.trades[0].contract_name, "con_y");
    }

    #[test]
    fn market_creation_is_a_listing_not_a_trade() {
        let changes = vec![
            change("pairs:con_new", json!(true)),
            change("reserves:con_new", reserves("1000", "50000")),
            change("prices:con_new", json!({"__fixed__": "0.02"})),
        ];
        let out = derive(AMM, ctx(), &changes, &HashMap::new());

        assert!(out.trades.is_empty());
        assert_eq!(
            out.new_pairs,
            vec![("con_new".to_string(), Reserves::new(dec("1000"), dec("50000")))]
        );
        assert_eq!(
            out.listings,
            vec![Listing {
                contract_name: "con_new".into(),
                price: dec("0.02")
            }]
        );
    }

    #[test]
    fn creation_of_an_already_seeded_pair_is_not_a_trade() {
        let changes = vec![
            change("pairs:con_x", json!(true)),
            change("reserves:con_x", reserves("1000", "50000")),
            change("prices:con_x", json!("0.02")),
        ];
        let out = derive(AMM, ctx(), &changes, &known("con_x", "1200", "41700"));

        assert!(out.trades.is_empty() && out.new_pairs.is_empty());
        assert_eq!(
            out.reserve_updates,
            vec![("con_x".to_string(), Reserves::new(dec("1000"), dec("50000")))]
        );
        assert_eq!(out.listings[0].price, dec("0.02"));
    }

    #[test]
    fn liquidity_changes_only_move_reserves() {
        let changes = vec![change("reserves:con_x", reserves("200", "2000"))];
        let out = derive(AMM, ctx(), &changes, &known("con_x", "100", "1000"));
        assert!(out.trades.is_empty());
        assert_eq!(out.reserve_updates.len(), 1);
    }

    #[test]
    fn lists_touched_contracts_once() {
        let changes = vec![
            change("reserves:con_b", reserves("1", "1")),
            change("prices:con_b", json!(1)),
            change("lp_points:con_c:alice", json!(1)),
            change("pairs:con_a", json!(true)),
        ];
        assert_eq!(touched_contracts(AMM, &changes), vec!["con_a", "con_b"]);
    }
}
