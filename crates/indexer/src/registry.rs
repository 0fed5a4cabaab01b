use std::collections::{BTreeSet, HashSet};

use tokio::sync::RwLock;
use tracing::error;

use crate::{error::IndexerResult, store::Store};

/// The pairs this process knows about, and the ones it has stopped processing.
///
/// Halts are persisted and reloaded on every refresh, so a halted contract
/// stays halted across restarts until a cold start rebuilds it.
#[derive(Default)]
pub struct PairRegistry {
    contracts: RwLock<BTreeSet<String>>,
    halted: RwLock<HashSet<String>>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known contracts that are not halted, in name order.
    pub async fn contracts(&self) -> Vec<String> {
        let halted = self.halted.read().await;
        self.contracts
            .read()
            .await
            .iter()
            .filter(|c| !halted.contains(*c))
            .cloned()
            .collect()
    }

    pub async fn refresh(&self, store: &dyn Store) -> IndexerResult<usize> {
        let pairs = store.list_pairs().await?;
        let halted = store.halted_contracts().await?;
        *self.halted.write().await = halted.into_iter().collect();
        let mut contracts = self.contracts.write().await;
        contracts.clear();
        contracts.extend(pairs.into_iter().map(|p| p.contract_name));
        Ok(contracts.len())
    }

    pub async fn insert(&self, contract_name: &str) {
        self.contracts
            .write()
            .await
            .insert(contract_name.to_string());
    }

    pub async fn contains(&self, contract_name: &str) -> bool {
        self.contracts.read().await.contains(contract_name)
    }

    /// Returns false when the contract was already halted.
    pub async fn halt(
        &self,
        store: &dyn Store,
        contract_name: &str,
        reason: &str,
    ) -> IndexerResult<bool> {
        let mut halted = self.halted.write().await;
        if halted.contains(contract_name) {
            return Ok(false);
        }
        store.halt_contract(contract_name, reason).await?;
        halted.insert(contract_name.to_string());
        error!(contract = contract_name, "halting contract: {reason}");
        Ok(true)
    }

    pub async fn is_halted(&self, contract_name: &str) -> bool {
        self.halted.read().await.contains(contract_name)
    }

    pub async fn halted(&self) -> Vec<String> {
        self.halted.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{Pair, Reserves},
        store::RuntimeStore,
    };

    #[tokio::test]
    async fn halted_contracts_drop_out_of_the_active_set() {
        let store = RuntimeStore::new();
        let pairs: Vec<Pair> = ["con_b", "con_a"]
            .into_iter()
            .map(|name| Pair {
                contract_name: name.into(),
                token_symbol: name.to_uppercase(),
                reserves: Reserves::zero(),
            })
            .collect();
        store.upsert_pairs(&pairs).await.unwrap();

        let registry = PairRegistry::new();
        assert_eq!(registry.refresh(&store).await.unwrap(), 2);
        assert_eq!(registry.contracts().await, vec!["con_a", "con_b"]);

        assert!(registry.halt(&store, "con_a", "no active candle").await.unwrap());
        assert!(!registry.halt(&store, "con_a", "again").await.unwrap());
        assert!(registry.is_halted("con_a").await);
        assert!(registry.contains("con_a").await);
        assert_eq!(registry.contracts().await, vec!["con_b"]);
    }

    #[tokio::test]
    async fn halts_survive_a_fresh_registry() {
        let store = RuntimeStore::new();
        store
            .upsert_pairs(&[Pair {
                contract_name: "con_a".into(),
                token_symbol: "A".into(),
                reserves: Reserves::zero(),
            }])
            .await
            .unwrap();
        PairRegistry::new()
            .halt(&store, "con_a", "price without reserves")
            .await
            .unwrap();

        let restarted = PairRegistry::new();
        restarted.refresh(&store).await.unwrap();
        assert!(restarted.is_halted("con_a").await);
        assert!(restarted.contracts().await.is_empty());
    }
}
