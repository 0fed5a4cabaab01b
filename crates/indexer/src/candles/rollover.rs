use std::{collections::HashSet, sync::Arc, time::Duration};

use ammlook_utils::time::secs_to_datetime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    candles::{Bucket, CandleEngine},
    error::IndexerResult,
    registry::PairRegistry,
    resolution::Resolution,
    source::{RetryConfig, sleep_or_cancel},
};

impl CandleEngine {
    /// The epoch the scheduler opens next: one past the newest row, or one
    /// past the current epoch when there are no rows.
    pub async fn next_rollover_epoch(&self, resolution: &Resolution) -> IndexerResult<i64> {
        Ok(match self.store.latest_epoch(resolution.as_str()).await? {
            Some(latest) => latest + 1,
            None => resolution.epoch_of(self.now()) + 1,
        })
    }

    /// Carries the close of every listed contract forward up to `epoch`.
    ///
    /// Contracts whose active row is already at `epoch` are skipped, as are
    /// contracts without any rows.
    pub async fn roll_over(
        &self,
        resolution: &Resolution,
        epoch: i64,
        contracts: &[String],
    ) -> IndexerResult<usize> {
        let wanted: HashSet<&str> = contracts.iter().map(String::as_str).collect();
        let mut rows = Vec::new();
        for active in self.store.latest_candles(resolution.as_str()).await? {
            if active.epoch >= epoch || !wanted.contains(active.contract_name.as_str()) {
                continue;
            }
            for e in active.epoch + 1..=epoch {
                rows.push(Bucket::carried(active.close.clone()).into_candle(
                    &active.contract_name,
                    resolution,
                    e,
                ));
            }
        }
        self.write(&rows).await?;
        Ok(rows.len())
    }
}

/// One rollover task per resolution, cancelled together.
pub struct RolloverScheduler {
    tasks: JoinSet<()>,
    resolutions: Vec<String>,
    cancel: CancellationToken,
}

impl RolloverScheduler {
    /// Spawns the tasks. Each stops when `cancel` (or [`Self::shutdown`]) fires.
    pub fn start(
        engine: Arc<CandleEngine>,
        registry: Arc<PairRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let mut tasks = JoinSet::new();
        let mut resolutions = Vec::new();
        for resolution in engine.resolutions().iter().cloned() {
            resolutions.push(resolution.to_string());
            tasks.spawn(run_resolution(
                engine.clone(),
                registry.clone(),
                resolution,
                cancel.clone(),
            ));
        }
        info!(?resolutions, "rollover scheduler started");
        Self {
            tasks,
            resolutions,
            cancel,
        }
    }

    pub fn resolutions(&self) -> &[String] {
        &self.resolutions
    }

    /// Tasks still running.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("rollover task failed: {e}");
            }
        }
        info!("rollover scheduler stopped");
    }
}

async fn run_resolution(
    engine: Arc<CandleEngine>,
    registry: Arc<PairRegistry>,
    resolution: Resolution,
    cancel: CancellationToken,
) {
    let backoff = RetryConfig::unbounded();
    let mut failures = 0u32;
    let mut last_rolled: Option<i64> = None;

    loop {
        let next_epoch = match engine.next_rollover_epoch(&resolution).await {
            Ok(epoch) => last_rolled.map_or(epoch, |last| epoch.max(last + 1)),
            Err(e) => {
                warn!(%resolution, "failed to read latest epoch: {e}");
                if !sleep_or_cancel(backoff.delay_for_attempt(failures), &cancel).await {
                    return;
                }
                failures = failures.saturating_add(1);
                continue;
            }
        };

        let deadline = resolution.bucket_start(next_epoch);
        debug!(%resolution, epoch = next_epoch, opens_at = ?secs_to_datetime(deadline), "waiting for rollover");
        // the wall clock decides, timers only pace the checks
        loop {
            let remaining = deadline - engine.now();
            if remaining <= 0 {
                break;
            }
            if !sleep_or_cancel(Duration::from_secs(remaining as u64), &cancel).await {
                return;
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        let contracts = registry.contracts().await;
        match engine.roll_over(&resolution, next_epoch, &contracts).await {
            Ok(rows) => {
                failures = 0;
                last_rolled = Some(next_epoch);
                info!(%resolution, epoch = next_epoch, rows, "rolled over candles");
            }
            Err(e) => {
                warn!(%resolution, epoch = next_epoch, "rollover failed: {e}");
                if !sleep_or_cancel(backoff.delay_for_attempt(failures), &cancel).await {
                    return;
                }
                failures = failures.saturating_add(1);
            }
        }
    }
}
