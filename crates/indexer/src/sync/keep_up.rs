use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{
    error::IndexerResult,
    models::Block,
    source::sleep_or_cancel,
    sync::{SyncOrchestrator, SyncState},
};

impl SyncOrchestrator {
    /// Applies pushed blocks with candle updates until cancelled.
    ///
    /// A feed that ends is re-subscribed after a back-off.
    pub(crate) async fn keep_up(
        &self,
        mut cursor: i64,
        cancel: &CancellationToken,
    ) -> IndexerResult<()> {
        let mut attempt = 0u32;
        loop {
            let Some(mut feed) = self
                .retry_until_cancelled("live subscription", cancel, || self.source.subscribe())
                .await?
            else {
                return Ok(());
            };

            loop {
                let block = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    block = feed.recv() => block,
                };
                let Some(block) = block else {
                    break;
                };
                attempt = 0;
                match self.follow(cursor, block, cancel).await? {
                    Some(applied) => cursor = applied,
                    None => return Ok(()),
                }
            }

            self.metrics.source_errors.inc();
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                state = %SyncState::Live,
                cursor,
                delay_ms = delay.as_millis() as u64,
                "live feed ended, resubscribing"
            );
            if !sleep_or_cancel(delay, cancel).await {
                return Ok(());
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Applies one pushed block on top of `cursor`, returning the new cursor.
    async fn follow(
        &self,
        cursor: i64,
        block: Block,
        cancel: &CancellationToken,
    ) -> IndexerResult<Option<i64>> {
        if block.number <= cursor {
            warn!(block = block.number, cursor, "dropping duplicate block");
            return Ok(Some(cursor));
        }

        if block.number > cursor + 1 {
            error!(
                expected = cursor + 1,
                received = block.number,
                "live feed skipped blocks, fetching the gap"
            );
            for number in cursor + 1..block.number {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let what = format!("block {number}");
                let Some(missing) = self
                    .retry_until_cancelled(&what, cancel, || self.source.fetch_block(number))
                    .await?
                else {
                    return Ok(None);
                };
                let Some(()) = self
                    .retry_until_cancelled(&what, cancel, || self.apply_block(&missing, true))
                    .await?
                else {
                    return Ok(None);
                };
            }
        }

        let what = format!("block {}", block.number);
        let Some(()) = self
            .retry_until_cancelled(&what, cancel, || self.apply_block(&block, true))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(block.number))
    }
}
