use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use url::Url;

use crate::{
    error::{IndexerError, IndexerResult},
    models::{Block, HistoryEntry, HistoryPage, StateChange},
    source::{
        BlockSource, BlockStream,
        retry::{RetryConfig, status_error},
        ws,
    },
};

#[derive(Deserialize)]
struct LatestSyncedBlock {
    latest_synced_block: i64,
}

#[derive(Deserialize)]
struct CurrentValue {
    #[serde(default)]
    value: Value,
}

/// Block service client. Requests rotate round-robin over `base_urls`.
pub struct HttpBlockSource {
    client: reqwest::Client,
    base_urls: Vec<Url>,
    next: AtomicUsize,
    live_feed_url: Url,
    retry: RetryConfig,
}

impl HttpBlockSource {
    pub fn new(base_urls: Vec<Url>, live_feed_url: Url) -> IndexerResult<Self> {
        if base_urls.is_empty() {
            return Err(IndexerError::malformed("at least one block service url is required"));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_urls,
            next: AtomicUsize::new(0),
            live_feed_url,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.base_urls.len();
        format!(
            "{}/{}",
            self.base_urls[i].as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn fetch_json<T>(&self, what: &str, path: &str, query: &[(&str, String)]) -> IndexerResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let response = self
            .client
            .get(self.endpoint(path))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(what, status));
        }
        Ok(response.json::<T>().await?)
    }

    async fn get_json<T>(&self, what: &str, path: &str, query: &[(&str, String)]) -> IndexerResult<T>
    where
        T: DeserializeOwned + Send,
    {
        self.retry
            .retry(what, || self.fetch_json(what, path, query))
            .await
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn fetch_block(&self, number: i64) -> IndexerResult<Block> {
        let what = format!("block {number}");
        self.get_json(&what, &format!("blocks/{number}"), &[]).await
    }

    async fn latest_known_block(&self) -> IndexerResult<i64> {
        let latest: LatestSyncedBlock = self
            .get_json("latest synced block", "latest_synced_block", &[])
            .await?;
        Ok(latest.latest_synced_block)
    }

    async fn subscribe(&self) -> IndexerResult<BlockStream> {
        ws::subscribe(&self.live_feed_url, &self.retry).await
    }

    async fn contract_state(&self, contract: &str) -> IndexerResult<Vec<StateChange>> {
        let state: Map<String, Value> = self
            .get_json(
                &format!("state of {contract}"),
                &format!("current/all/{contract}"),
                &[],
            )
            .await?;
        Ok(flatten_state(&state))
    }

    async fn history_page(
        &self,
        contract: &str,
        last_tx_uid: &str,
        limit: usize,
    ) -> IndexerResult<Vec<HistoryEntry>> {
        let page: HistoryPage = self
            .get_json(
                &format!("history of {contract}"),
                "contract_history",
                &[
                    ("contract", contract.to_string()),
                    ("last_tx_uid", last_tx_uid.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(page.history)
    }

    async fn token_symbol(&self, contract: &str) -> IndexerResult<String> {
        let what = format!("token symbol of {contract}");
        let path = format!("current/one/{contract}/metadata/token_symbol");
        let current = self
            .retry
            .retry_optional(&what, || self.fetch_json::<CurrentValue>(&what, &path, &[]))
            .await?;
        // tokens without metadata are listed under their contract name
        match current {
            Some(CurrentValue {
                value: Value::String(symbol),
            }) => Ok(symbol),
            _ => Ok(contract.to_string()),
        }
    }
}

/// Flattens `{contract: {variable: {key: {subkey: value}}}}` into
/// `contract.variable:key:subkey` changes. `{"__fixed__": ..}` objects are leaves.
pub fn flatten_state(state: &Map<String, Value>) -> Vec<StateChange> {
    fn is_leaf(value: &Value) -> bool {
        match value {
            Value::Object(map) => map.contains_key("__fixed__") || map.is_empty(),
            _ => true,
        }
    }

    fn walk(prefix: String, value: &Value, out: &mut Vec<StateChange>) {
        match value {
            Value::Object(map) if !is_leaf(value) => {
                for (key, child) in map {
                    walk(format!("{prefix}:{key}"), child, out);
                }
            }
            _ => out.push(StateChange::new(prefix, value.clone())),
        }
    }

    let mut out = Vec::new();
    for (contract, variables) in state {
        let Value::Object(variables) = variables else {
            continue;
        };
        for (variable, value) in variables {
            walk(format!("{contract}.{variable}"), value, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn flattens_nested_contract_state() {
        let state = json!({
            "con_amm": {
                "owner": "alice",
                "pairs": {"con_x": true},
                "reserves": {"con_x": [{"__fixed__": "1.5"}, "20"]},
                "prices": {"con_x": {"__fixed__": "13.3"}},
                "lp_points": {"con_x": {"bob": 10}}
            }
        });
        let Value::Object(map) = state else {
            unreachable!()
        };
        let mut keys: Vec<String> = flatten_state(&map).into_iter().map(|c| c.key).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "con_amm.lp_points:con_x:bob",
                "con_amm.owner",
                "con_amm.pairs:con_x",
                "con_amm.prices:con_x",
                "con_amm.reserves:con_x",
            ]
        );
    }

    #[test]
    fn rotates_over_block_service_urls() {
        let source = HttpBlockSource::new(
            vec![
                Url::parse("http://a:3535/").unwrap(),
                Url::parse("http://b:3535").unwrap(),
            ],
            Url::parse("ws://a:3535/blocks").unwrap(),
        )
        .unwrap();
        assert_eq!(source.endpoint("blocks/1"), "http://a:3535/blocks/1");
        assert_eq!(source.endpoint("/blocks/2"), "http://b:3535/blocks/2");
        assert_eq!(source.endpoint("latest_synced_block"), "http://a:3535/latest_synced_block");
    }

    #[test]
    fn requires_a_block_service_url() {
        let live = Url::parse("ws://a:3535/blocks").unwrap();
        assert!(HttpBlockSource::new(vec![], live).is_err());
    }
}
