//! Candle persistence over PostgreSQL.
//!
//! Handles:
//! - Connection pooling via deadpool
//! - Batch upserts: fetch existing rows, merge in code, conflict-ignore
//!   insert plus bulk update inside one transaction
//! - 1-minute row id resolution for rollup linkage
//! - Latest/earliest probes used by the backfill completeness heuristic
//!
//! Write failures are caught and logged here and never propagate; the
//! aggregation path must keep running on a bad batch.

use crate::bucket::Timeframe;
use crate::candles::{CandleKey, CandleUpdate, WriteMode};
use crate::config::DatabaseConfig;
use crate::errors::{FeederError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, error, info};

/// Fetch existing rows for one timeframe and a key superset. The
/// asset/timestamp arrays form a cross product; callers index the result
/// by exact key so surplus rows are harmless.
const FETCH_CANDLES_SQL: &str = r#"
    SELECT id, asset_id, timestamp, open, high, low, close, volume,
           trade_count, vwap, minute_candle_ids
    FROM candles
    WHERE timeframe = $1 AND asset_id = ANY($2) AND timestamp = ANY($3)
"#;

/// Insert one candle row; a concurrent writer inserting the same key wins
/// silently and the merge lands via the update path on a later call.
const INSERT_CANDLE_SQL: &str = r#"
    INSERT INTO candles (
        asset_id, timeframe, timestamp, open, high, low, close, volume,
        trade_count, vwap, minute_candle_ids, is_active, created_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, true, now())
    ON CONFLICT (asset_id, timeframe, timestamp) DO NOTHING
"#;

const UPDATE_CANDLE_SQL: &str = r#"
    UPDATE candles
    SET open = $2, high = $3, low = $4, close = $5, volume = $6,
        trade_count = $7, vwap = $8, minute_candle_ids = $9
    WHERE id = $1
"#;

const FETCH_MINUTE_IDS_SQL: &str = r#"
    SELECT id, asset_id, timestamp
    FROM candles
    WHERE timeframe = '1T' AND asset_id = ANY($1) AND timestamp = ANY($2)
"#;

const LATEST_MINUTE_SQL: &str = r#"
    SELECT timestamp FROM candles
    WHERE asset_id = $1 AND timeframe = '1T'
    ORDER BY timestamp DESC LIMIT 1
"#;

const EARLIEST_MINUTE_SQL: &str = r#"
    SELECT timestamp FROM candles
    WHERE asset_id = $1 AND timeframe = '1T'
    ORDER BY timestamp ASC LIMIT 1
"#;

const HAS_CANDLE_BEFORE_SQL: &str = r#"
    SELECT 1 FROM candles
    WHERE asset_id = $1 AND timeframe = $2 AND timestamp < $3
    LIMIT 1
"#;

/// Create a connection pool and verify it with a probe query.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<Pool> {
    let pg_config = config.to_pool_config();

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mgr = Manager::from_config(
        pg_config
            .get_pg_config()
            .map_err(|e| FeederError::config(format!("Invalid PG config: {}", e)))?,
        NoTls,
        mgr_config,
    );

    let pool = Pool::builder(mgr)
        .max_size(config.pool_max)
        .wait_timeout(Some(Duration::from_secs(10)))
        .create_timeout(Some(Duration::from_secs(10)))
        .recycle_timeout(Some(Duration::from_secs(10)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| FeederError::config(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let client = pool.get().await?;
    let _ = client.simple_query("SELECT 1").await?;
    info!("Database connection pool established");

    Ok(pool)
}

/// Write surface consumed by the aggregator; lets tests substitute a
/// recording sink for the real store.
#[async_trait]
pub trait CandleSink: Send + Sync {
    async fn save_candles(
        &self,
        timeframe: Timeframe,
        updates: HashMap<CandleKey, CandleUpdate>,
        mode: WriteMode,
    );
}

/// One fetched row: surrogate id plus its mergeable state.
struct CandleRow {
    id: i64,
    state: CandleUpdate,
}

/// Candle persistence layer.
pub struct CandleStore {
    pool: Pool,
    candles_written: AtomicU64,
    write_failures: AtomicU64,
}

impl CandleStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            candles_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Total updates persisted since startup.
    pub fn candles_written(&self) -> u64 {
        self.candles_written.load(Ordering::SeqCst)
    }

    /// Number of failed save batches since startup.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::SeqCst)
    }

    /// Ping the database to check the connection.
    pub async fn ping(&self) -> bool {
        match self.pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }

    /// Merge a batch of updates for one timeframe into storage. Empty
    /// input is a no-op. Failures are logged, never returned.
    pub async fn save_candles(
        &self,
        timeframe: Timeframe,
        updates: HashMap<CandleKey, CandleUpdate>,
        mode: WriteMode,
    ) {
        if updates.is_empty() {
            return;
        }

        let count = updates.len();
        if let Err(e) = self.try_save(timeframe, updates, mode).await {
            self.write_failures.fetch_add(1, Ordering::SeqCst);
            error!(
                "Failed to save {} candle updates for {}: {}",
                count, timeframe, e
            );
        }
    }

    async fn try_save(
        &self,
        timeframe: Timeframe,
        updates: HashMap<CandleKey, CandleUpdate>,
        mode: WriteMode,
    ) -> Result<()> {
        let count = updates.len();
        let (asset_ids, timestamps) = key_columns(updates.keys());
        let tf_label = timeframe.label();

        let mut client = self.pool.get().await?;

        let rows = client
            .query(FETCH_CANDLES_SQL, &[&tf_label, &asset_ids, &timestamps])
            .await?;

        let mut existing: HashMap<CandleKey, CandleRow> = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = CandleKey::new(row.get("asset_id"), row.get("timestamp"));
            existing.insert(
                key,
                CandleRow {
                    id: row.get("id"),
                    state: CandleUpdate {
                        open: row.get("open"),
                        high: row.get("high"),
                        low: row.get("low"),
                        close: row.get("close"),
                        volume: row.get::<_, Option<f64>>("volume").unwrap_or(0.0),
                        trade_count: row.get("trade_count"),
                        vwap: row.get("vwap"),
                        minute_candle_ids: row
                            .get::<_, Option<Vec<i64>>>("minute_candle_ids")
                            .unwrap_or_default(),
                    },
                },
            );
        }

        let mut to_insert: Vec<(CandleKey, CandleUpdate)> = Vec::new();
        let mut to_update: Vec<CandleRow> = Vec::new();

        for (key, update) in updates {
            match existing.remove(&key) {
                Some(mut row) => {
                    row.state.merge_from(&update, mode);
                    to_update.push(row);
                }
                None => to_insert.push((key, update)),
            }
        }

        let tx = client.transaction().await?;

        if !to_insert.is_empty() {
            let stmt = tx.prepare(INSERT_CANDLE_SQL).await?;
            for (key, u) in &to_insert {
                tx.execute(
                    &stmt,
                    &[
                        &key.asset_id,
                        &tf_label,
                        &key.bucket,
                        &u.open,
                        &u.high,
                        &u.low,
                        &u.close,
                        &u.volume,
                        &u.trade_count,
                        &u.vwap,
                        &ids_param(u),
                    ],
                )
                .await?;
            }
        }

        if !to_update.is_empty() {
            let stmt = tx.prepare(UPDATE_CANDLE_SQL).await?;
            for row in &to_update {
                let u = &row.state;
                tx.execute(
                    &stmt,
                    &[
                        &row.id,
                        &u.open,
                        &u.high,
                        &u.low,
                        &u.close,
                        &u.volume,
                        &u.trade_count,
                        &u.vwap,
                        &ids_param(u),
                    ],
                )
                .await?;
            }
        }

        tx.commit().await?;

        self.candles_written.fetch_add(count as u64, Ordering::SeqCst);
        debug!(
            "Saved {} candle updates for {} ({} inserted, {} merged)",
            count,
            timeframe,
            to_insert.len(),
            to_update.len()
        );

        Ok(())
    }

    /// Resolve 1-minute row ids for a batch of keys. Empty input returns
    /// an empty map without touching the database.
    pub async fn fetch_minute_ids(
        &self,
        keys: &[CandleKey],
    ) -> Result<HashMap<CandleKey, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let (asset_ids, timestamps) = key_columns(keys.iter());

        let client = self.pool.get().await?;
        let rows = client
            .query(FETCH_MINUTE_IDS_SQL, &[&asset_ids, &timestamps])
            .await?;

        let mut ids = HashMap::with_capacity(rows.len());
        for row in rows {
            ids.insert(
                CandleKey::new(row.get("asset_id"), row.get("timestamp")),
                row.get::<_, i64>("id"),
            );
        }
        Ok(ids)
    }

    /// Timestamp of the newest 1-minute row for an asset, if any.
    pub async fn latest_minute(&self, asset_id: i64) -> Result<Option<DateTime<Utc>>> {
        let client = self.pool.get().await?;
        let row = client.query_opt(LATEST_MINUTE_SQL, &[&asset_id]).await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Timestamp of the oldest 1-minute row for an asset, if any.
    pub async fn earliest_minute(&self, asset_id: i64) -> Result<Option<DateTime<Utc>>> {
        let client = self.pool.get().await?;
        let row = client.query_opt(EARLIEST_MINUTE_SQL, &[&asset_id]).await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Whether any row exists for (asset, timeframe) strictly before the
    /// cutoff.
    pub async fn has_candle_before(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        let tf_label = timeframe.label();
        let client = self.pool.get().await?;
        let row = client
            .query_opt(HAS_CANDLE_BEFORE_SQL, &[&asset_id, &tf_label, &cutoff])
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl CandleSink for CandleStore {
    async fn save_candles(
        &self,
        timeframe: Timeframe,
        updates: HashMap<CandleKey, CandleUpdate>,
        mode: WriteMode,
    ) {
        CandleStore::save_candles(self, timeframe, updates, mode).await;
    }
}

/// Distinct asset ids and bucket timestamps for an ANY(..) key fetch.
fn key_columns<'a>(
    keys: impl Iterator<Item = &'a CandleKey>,
) -> (Vec<i64>, Vec<DateTime<Utc>>) {
    let mut asset_ids = HashSet::new();
    let mut timestamps = HashSet::new();
    for key in keys {
        asset_ids.insert(key.asset_id);
        timestamps.insert(key.bucket);
    }
    (
        asset_ids.into_iter().collect(),
        timestamps.into_iter().collect(),
    )
}

/// NULL instead of an empty array for rows with no minute linkage.
fn ids_param(u: &CandleUpdate) -> Option<Vec<i64>> {
    if u.minute_candle_ids.is_empty() {
        None
    } else {
        Some(u.minute_candle_ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lazy_pool() -> Pool {
        // deadpool connects lazily, so a pool against a closed port is
        // fine as long as no query runs.
        let mut pg = tokio_postgres::Config::new();
        pg.host("127.0.0.1").port(1).dbname("x").user("x");
        let mgr = Manager::from_config(
            pg,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(mgr).max_size(1).build().unwrap()
    }

    #[tokio::test]
    async fn test_empty_save_is_a_no_op() {
        let store = CandleStore::new(lazy_pool());
        store
            .save_candles(
                Timeframe::Min1,
                HashMap::new(),
                WriteMode::Delta,
            )
            .await;
        assert_eq!(store.candles_written(), 0);
        assert_eq!(store.write_failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_save_is_swallowed_and_counted() {
        let store = CandleStore::new(lazy_pool());
        let key = CandleKey::new(1, Utc.with_ymd_and_hms(2023, 10, 30, 14, 30, 0).unwrap());
        let mut updates = HashMap::new();
        updates.insert(key, CandleUpdate::default());

        // The pool points at a closed port, so the write fails; the error
        // must be absorbed here rather than surfaced to the caller.
        store
            .save_candles(Timeframe::Min1, updates, WriteMode::Delta)
            .await;
        assert_eq!(store.candles_written(), 0);
        assert_eq!(store.write_failures(), 1);
    }

    #[tokio::test]
    async fn test_empty_minute_id_fetch_skips_query() {
        let store = CandleStore::new(lazy_pool());
        let ids = store.fetch_minute_ids(&[]).await.unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_key_columns_dedupe() {
        let t1 = Utc.with_ymd_and_hms(2023, 10, 30, 14, 30, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2023, 10, 30, 14, 31, 0).unwrap();
        let keys = [
            CandleKey::new(1, t1),
            CandleKey::new(1, t2),
            CandleKey::new(2, t1),
        ];
        let (assets, timestamps) = key_columns(keys.iter());
        assert_eq!(assets.len(), 2);
        assert_eq!(timestamps.len(), 2);
    }

    #[test]
    fn test_ids_param_null_when_empty() {
        let mut u = CandleUpdate::default();
        assert!(ids_param(&u).is_none());
        u.minute_candle_ids.push(9);
        assert_eq!(ids_param(&u), Some(vec![9]));
    }
}
