use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{IndexerError, IndexerResult},
    sync::SyncOrchestrator,
};

impl SyncOrchestrator {
    /// Replays blocks after `cursor` in order, one at a time, until the
    /// source's latest known block. Candle updates are deferred.
    ///
    /// Returns the new cursor, or `None` when cancelled.
    pub(crate) async fn catch_up(
        &self,
        cursor: i64,
        cancel: &CancellationToken,
    ) -> IndexerResult<Option<i64>> {
        let mut next = cursor + 1;
        let Some(mut latest) = self
            .retry_until_cancelled("latest block", cancel, || self.source.latest_known_block())
            .await?
        else {
            return Ok(None);
        };

        loop {
            if next > latest {
                // the source may have moved on while we were replaying
                let Some(refreshed) = self
                    .retry_until_cancelled("latest block", cancel, || {
                        self.source.latest_known_block()
                    })
                    .await?
                else {
                    return Ok(None);
                };
                latest = refreshed;
                if next > latest {
                    break;
                }
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let what = format!("block {next}");
            let Some(block) = self
                .retry_until_cancelled(&what, cancel, || self.source.fetch_block(next))
                .await?
            else {
                return Ok(None);
            };
            if block.number != next {
                return Err(IndexerError::malformed(format!(
                    "asked for block {next}, source returned {}",
                    block.number
                )));
            }
            let Some(()) = self
                .retry_until_cancelled(&what, cancel, || self.apply_block(&block, false))
                .await?
            else {
                return Ok(None);
            };
            debug!(block = next, latest, "caught up block");
            next += 1;
        }

        info!(cursor = next - 1, "catch-up complete");
        Ok(Some(next - 1))
    }
}
