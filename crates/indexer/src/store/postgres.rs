use std::collections::HashSet;

use ammlook_schema::{
    MIGRATIONS, SYNC_CURSOR_ID,
    models::{HaltedContractRow, NewTradeRow, PairRow, SyncCursorRow, TradeRow},
    schema::{candle_meta, candles, halted_contracts, pairs, sync_cursor, trades},
};
use async_trait::async_trait;
use diesel::{
    Connection, ExpressionMethods, OptionalExtension, PgConnection, QueryDsl, SelectableHelper,
    dsl::{exists, max},
    upsert::excluded,
};
use diesel_async::{
    AsyncPgConnection, RunQueryDsl,
    pooled_connection::{AsyncDieselConnectionManager, bb8::Pool},
};
use diesel_migrations::MigrationHarness;
use tracing::info;
use url::Url;

use crate::{
    error::{IndexerError, IndexerResult},
    models::{Candle, CandleMeta, Pair, TradeRecord},
    store::Store,
};

/// Rows per multi-row INSERT, well below the postgres bind parameter limit.
const INSERT_CHUNK_SIZE: usize = 1000;

#[derive(Clone)]
pub struct PgStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgStore {
    pub async fn connect(database_url: &Url) -> IndexerResult<Self> {
        let manager =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url.as_str());
        let pool = Pool::builder()
            .build(manager)
            .await
            .map_err(|e| IndexerError::Persistence(format!("failed to build pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Applies pending embedded migrations over a blocking connection.
    pub fn run_migrations(database_url: &Url) -> IndexerResult<()> {
        let mut conn = PgConnection::establish(database_url.as_str())
            .map_err(|e| IndexerError::Persistence(format!("failed to connect: {e}")))?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| IndexerError::Persistence(format!("migrations failed: {e}")))?;
        info!(applied = applied.len(), "database migrations up to date");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn last_processed_block(&self) -> IndexerResult<Option<i64>> {
        let mut conn = self.pool.get().await?;
        Ok(sync_cursor::table
            .filter(sync_cursor::id.eq(SYNC_CURSOR_ID))
            .select(sync_cursor::block_number)
            .first::<i64>(&mut *conn)
            .await
            .optional()?)
    }

    async fn set_last_processed_block(&self, block_number: i64) -> IndexerResult<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(sync_cursor::table)
            .values(&SyncCursorRow {
                id: SYNC_CURSOR_ID,
                block_number,
            })
            .on_conflict(sync_cursor::id)
            .do_update()
            .set(sync_cursor::block_number.eq(block_number))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn get_pair(&self, contract_name: &str) -> IndexerResult<Option<Pair>> {
        let mut conn = self.pool.get().await?;
        let row = pairs::table
            .find(contract_name)
            .select(PairRow::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        Ok(row.map(Pair::from))
    }

    async fn list_pairs(&self) -> IndexerResult<Vec<Pair>> {
        let mut conn = self.pool.get().await?;
        let rows = pairs::table
            .select(PairRow::as_select())
            .order(pairs::contract_name.asc())
            .load(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Pair::from).collect())
    }

    async fn upsert_pairs(&self, pairs: &[Pair]) -> IndexerResult<()> {
        let rows: Vec<PairRow> = pairs.iter().map(PairRow::from).collect();
        let mut conn = self.pool.get().await?;
        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            diesel::insert_into(pairs::table)
                .values(chunk)
                .on_conflict(pairs::contract_name)
                .do_update()
                .set((
                    pairs::token_symbol.eq(excluded(pairs::token_symbol)),
                    pairs::base_reserve.eq(excluded(pairs::base_reserve)),
                    pairs::quote_reserve.eq(excluded(pairs::quote_reserve)),
                ))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn insert_trades(&self, trades: &[TradeRecord]) -> IndexerResult<Vec<TradeRecord>> {
        let mut conn = self.pool.get().await?;
        let mut appended = Vec::with_capacity(trades.len());
        for chunk in trades.chunks(INSERT_CHUNK_SIZE) {
            let rows: Vec<NewTradeRow> = chunk.iter().map(NewTradeRow::from).collect();
            let mut inserted: HashSet<(Option<String>, String)> = diesel::insert_into(trades::table)
                .values(&rows)
                .on_conflict((trades::hash, trades::contract_name))
                .do_nothing()
                .returning((trades::hash, trades::contract_name))
                .get_results::<(Option<String>, String)>(&mut *conn)
                .await?
                .into_iter()
                .collect();
            for trade in chunk {
                let key = (trade.hash.clone(), trade.contract_name.clone());
                if trade.hash.is_none() || inserted.remove(&key) {
                    appended.push(trade.clone());
                }
            }
        }
        Ok(appended)
    }

    async fn first_trade(&self, contract_name: &str) -> IndexerResult<Option<TradeRecord>> {
        let mut conn = self.pool.get().await?;
        let row = trades::table
            .filter(trades::contract_name.eq(contract_name))
            .order((trades::time.asc(), trades::id.asc()))
            .select(TradeRow::as_select())
            .first(&mut *conn)
            .await
            .optional()?;
        row.map(TradeRecord::try_from).transpose()
    }

    async fn trades_in_window(
        &self,
        contract_name: Option<&str>,
        start: i64,
        end: i64,
    ) -> IndexerResult<Vec<TradeRecord>> {
        let mut query = trades::table
            .select(TradeRow::as_select())
            .filter(trades::time.ge(start))
            .filter(trades::time.lt(end))
            .into_boxed();
        if let Some(contract_name) = contract_name {
            query = query.filter(trades::contract_name.eq(contract_name));
        }

        let mut conn = self.pool.get().await?;
        let rows = query
            .order((trades::time.asc(), trades::id.asc()))
            .load(&mut *conn)
            .await?;
        rows.into_iter().map(TradeRecord::try_from).collect()
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> IndexerResult<()> {
        let mut conn = self.pool.get().await?;
        for chunk in candles.chunks(INSERT_CHUNK_SIZE) {
            diesel::insert_into(candles::table)
                .values(chunk)
                .on_conflict((candles::contract_name, candles::resolution, candles::epoch))
                .do_update()
                .set((
                    candles::time.eq(excluded(candles::time)),
                    candles::open.eq(excluded(candles::open)),
                    candles::high.eq(excluded(candles::high)),
                    candles::low.eq(excluded(candles::low)),
                    candles::close.eq(excluded(candles::close)),
                    candles::last.eq(excluded(candles::last)),
                    candles::volume.eq(excluded(candles::volume)),
                ))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn latest_candle(
        &self,
        contract_name: &str,
        resolution: &str,
    ) -> IndexerResult<Option<Candle>> {
        let mut conn = self.pool.get().await?;
        Ok(candles::table
            .filter(candles::contract_name.eq(contract_name))
            .filter(candles::resolution.eq(resolution))
            .order(candles::epoch.desc())
            .select(Candle::as_select())
            .first(&mut *conn)
            .await
            .optional()?)
    }

    async fn latest_candles(&self, resolution: &str) -> IndexerResult<Vec<Candle>> {
        let mut conn = self.pool.get().await?;
        Ok(candles::table
            .filter(candles::resolution.eq(resolution))
            .distinct_on(candles::contract_name)
            .order((candles::contract_name.asc(), candles::epoch.desc()))
            .select(Candle::as_select())
            .load(&mut *conn)
            .await?)
    }

    async fn latest_epoch(&self, resolution: &str) -> IndexerResult<Option<i64>> {
        let mut conn = self.pool.get().await?;
        Ok(candles::table
            .filter(candles::resolution.eq(resolution))
            .select(max(candles::epoch))
            .first::<Option<i64>>(&mut *conn)
            .await?)
    }

    async fn candles(
        &self,
        contract_name: &str,
        resolution: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> IndexerResult<Vec<Candle>> {
        let mut query = candles::table
            .select(Candle::as_select())
            .filter(candles::contract_name.eq(contract_name))
            .filter(candles::resolution.eq(resolution))
            .into_boxed();
        if let Some(from) = from {
            query = query.filter(candles::time.ge(from));
        }
        if let Some(to) = to {
            query = query.filter(candles::time.le(to));
        }

        let mut conn = self.pool.get().await?;
        Ok(query
            .order(candles::epoch.asc())
            .load(&mut *conn)
            .await?)
    }

    async fn has_candles(&self, contract_name: &str) -> IndexerResult<bool> {
        let mut conn = self.pool.get().await?;
        Ok(diesel::select(exists(
            candles::table.filter(candles::contract_name.eq(contract_name)),
        ))
        .get_result::<bool>(&mut *conn)
        .await?)
    }

    async fn set_candle_meta(&self, meta: &CandleMeta) -> IndexerResult<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(candle_meta::table)
            .values(meta)
            .on_conflict(candle_meta::contract_name)
            .do_update()
            .set(candle_meta::precision.eq(excluded(candle_meta::precision)))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn candle_meta(&self, contract_name: &str) -> IndexerResult<Option<CandleMeta>> {
        let mut conn = self.pool.get().await?;
        Ok(candle_meta::table
            .find(contract_name)
            .select(CandleMeta::as_select())
            .first(&mut *conn)
            .await
            .optional()?)
    }

    async fn halt_contract(&self, contract_name: &str, reason: &str) -> IndexerResult<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(halted_contracts::table)
            .values(&HaltedContractRow {
                contract_name: contract_name.to_string(),
                reason: reason.to_string(),
            })
            .on_conflict(halted_contracts::contract_name)
            .do_nothing()
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn halted_contracts(&self) -> IndexerResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        Ok(halted_contracts::table
            .select(halted_contracts::contract_name)
            .order(halted_contracts::contract_name.asc())
            .load(&mut *conn)
            .await?)
    }

    async fn clear_derived(&self) -> IndexerResult<()> {
        let mut conn = self.pool.get().await?;
        let trades = diesel::delete(trades::table).execute(&mut *conn).await?;
        let candles = diesel::delete(candles::table).execute(&mut *conn).await?;
        diesel::delete(candle_meta::table)
            .execute(&mut *conn)
            .await?;
        let halted = diesel::delete(halted_contracts::table)
            .execute(&mut *conn)
            .await?;
        info!(trades, candles, halted, "cleared derived data");
        Ok(())
    }
}
