use std::{collections::HashMap, sync::Arc};

use ammlook_indexer::{models::Candle, resolution::Resolution};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Serialize;

use crate::{
    error::ChartError,
    server::{AppState, ParameterUtil},
};

#[derive(Debug, Serialize, PartialEq)]
pub struct ChartCandle {
    pub time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
}

impl From<Candle> for ChartCandle {
    fn from(candle: Candle) -> Self {
        Self {
            time: candle.time,
            open: candle.open.to_plain_string(),
            high: candle.high.to_plain_string(),
            low: candle.low.to_plain_string(),
            close: candle.close.to_plain_string(),
            volume: candle.volume.to_plain_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Chart {
    pub contract_name: String,
    pub resolution: String,
    /// Fractional digits to render; `None` until the contract has candles.
    pub precision: Option<i32>,
    pub candles: Vec<ChartCandle>,
}

/// Candles of one contract at one resolution, oldest first.
///
/// Serves whatever the indexer has written so far and never waits on it.
pub async fn get_chart(
    Path((contract_name, resolution)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Chart>, ChartError> {
    let resolution: Resolution = resolution.parse()?;
    if state.resolutions.get(resolution.as_str()).is_none() {
        let allowed: Vec<&str> = state.resolutions.iter().map(Resolution::as_str).collect();
        return Err(ChartError::BadRequest(format!(
            "Invalid resolution '{}'. Allowed values are: {}",
            resolution,
            allowed.join(", ")
        )));
    }
    let from = params.from_time()?;
    let to = params.to_time()?;

    let candles = state
        .store
        .candles(&contract_name, resolution.as_str(), from, to)
        .await?;
    let precision = state
        .store
        .candle_meta(&contract_name)
        .await?
        .map(|meta| meta.precision);

    Ok(Json(Chart {
        contract_name,
        resolution: resolution.to_string(),
        precision,
        candles: candles.into_iter().map(ChartCandle::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use ammlook_indexer::{
        candles::Bucket,
        models::CandleMeta,
        resolution::ResolutionSet,
        store::{RuntimeStore, Store},
    };
    use bigdecimal::BigDecimal;

    use super::*;

    async fn state() -> Arc<AppState> {
        let store = RuntimeStore::new();
        let hourly: Resolution = "1h".parse().unwrap();
        let mut active = Bucket::carried(BigDecimal::from_str("8.0").unwrap());
        active.apply(
            &BigDecimal::from_str("10.25").unwrap(),
            &BigDecimal::from(2),
        );
        store
            .upsert_candles(&[
                Bucket::carried(BigDecimal::from(8)).into_candle("con_x", &hourly, 1),
                active.into_candle("con_x", &hourly, 2),
            ])
            .await
            .unwrap();
        store
            .set_candle_meta(&CandleMeta {
                contract_name: "con_x".into(),
                precision: 2,
            })
            .await
            .unwrap();
        Arc::new(AppState {
            store: Arc::new(store),
            resolutions: ResolutionSet::parse(&["15m", "1h"]).unwrap(),
        })
    }

    async fn chart(
        path: (&str, &str),
        params: &[(&str, &str)],
    ) -> Result<Json<Chart>, ChartError> {
        let params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        get_chart(
            Path((path.0.to_string(), path.1.to_string())),
            Query(params),
            State(state().await),
        )
        .await
    }

    #[tokio::test]
    async fn returns_ordered_candles_with_precision() {
        let Json(chart) = chart(("con_x", "1h"), &[]).await.unwrap();
        assert_eq!(chart.precision, Some(2));
        assert_eq!(chart.candles.len(), 2);
        assert_eq!(chart.candles[0].time, 3_600);
        assert_eq!(
            chart.candles[1],
            ChartCandle {
                time: 7_200,
                open: "8.0".into(),
                high: "10.25".into(),
                low: "8.0".into(),
                close: "10.25".into(),
                volume: "2".into(),
            }
        );
    }

    #[tokio::test]
    async fn applies_time_bounds() {
        let Json(chart) = chart(("con_x", "1h"), &[("from", "7200")]).await.unwrap();
        assert_eq!(chart.candles.len(), 1);
        assert_eq!(chart.candles[0].time, 7_200);
    }

    #[tokio::test]
    async fn unknown_contract_has_no_candles_and_no_precision() {
        let Json(chart) = chart(("con_nope", "15m"), &[]).await.unwrap();
        assert!(chart.candles.is_empty());
        assert_eq!(chart.precision, None);
    }

    #[tokio::test]
    async fn rejects_bad_resolutions_and_bounds() {
        for (resolution, params) in [
            ("1x", vec![]),
            ("1d", vec![]),
            ("1h", vec![("to", "soon")]),
        ] {
            let err = chart(("con_x", resolution), &params).await.unwrap_err();
            assert!(matches!(err, ChartError::BadRequest(_)), "{resolution}");
        }
    }
}
