//! Backfill coordination against the out-of-band historical fetch job.
//!
//! The live pipeline and the backfill job share nothing but three advisory
//! TTL flags per asset (`queued`, `running`, `completed`) in the
//! `backfill_flags` table, plus an HTTP trigger to the runner service.
//! This module owns the core's side of that contract: idempotent request
//! dedup via the `queued` flag, staleness-driven scheduling with a
//! per-asset cooldown, and the completeness gate consulted before every
//! higher-timeframe write. Uncertainty always resolves to "not complete".

use crate::bucket::{floor_to_bucket, Timeframe};
use crate::config::Config;
use crate::errors::{FeederError, Result};
use crate::store::CandleStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use deadpool_postgres::Pool;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 1-minute coverage must reach back at least this far before the
/// heuristic will call an asset's history complete.
const COVERAGE_DAYS: i64 = 4;

const QUEUED_FLAG: &str = "queued";
const RUNNING_FLAG: &str = "running";
const COMPLETED_FLAG: &str = "completed";

/// Set the queued flag if it is absent or expired. Affects one row when
/// this caller wins, zero when another holder's flag is still live.
const ACQUIRE_QUEUED_SQL: &str = r#"
    INSERT INTO backfill_flags (asset_id, flag, expires_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (asset_id, flag) DO UPDATE SET expires_at = EXCLUDED.expires_at
    WHERE backfill_flags.expires_at <= now()
"#;

const FLAG_LIVE_SQL: &str = r#"
    SELECT 1 FROM backfill_flags
    WHERE asset_id = $1 AND flag = $2 AND expires_at > now()
    LIMIT 1
"#;

const ON_ACTIVE_WATCHLIST_SQL: &str = r#"
    SELECT 1 FROM watchlist_assets wa
    JOIN watchlists w ON w.id = wa.watchlist_id
    WHERE wa.asset_id = $1 AND wa.is_active AND w.is_active
    LIMIT 1
"#;

/// Coordinator tunables, lifted from the service configuration.
#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub runner_url: String,
    pub queued_ttl: Duration,
    pub staleness: Duration,
    pub cooldown: Duration,
}

impl BackfillSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            runner_url: config.backfill_runner_url.clone(),
            queued_ttl: config.backfill_queued_ttl,
            staleness: config.backfill_staleness,
            cooldown: config.backfill_cooldown,
        }
    }
}

/// Completeness gate consumed by the aggregator; re-checked fresh before
/// every higher-timeframe write, never cached.
#[async_trait]
pub trait HistoricalGate: Send + Sync {
    async fn is_historical_complete(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
    ) -> bool;
}

/// Flag-table and coverage reads behind the coordinator; lets tests
/// substitute scripted storage for the live database.
#[async_trait]
pub trait BackfillStore: Send + Sync {
    /// Set the queued flag if it is absent or expired. True only when
    /// this caller won the row.
    async fn acquire_queued_flag(&self, asset_id: i64, ttl: Duration) -> Result<bool>;

    /// Whether an unexpired row for this flag exists.
    async fn flag_live(&self, asset_id: i64, flag: &str) -> Result<bool>;

    async fn on_active_watchlist(&self, asset_id: i64) -> Result<bool>;

    async fn latest_minute(&self, asset_id: i64) -> Result<Option<DateTime<Utc>>>;

    async fn earliest_minute(&self, asset_id: i64) -> Result<Option<DateTime<Utc>>>;

    async fn has_candle_before(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        cutoff: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Production storage: flag rows in `backfill_flags`, coverage reads
/// through the candle store.
pub struct PgBackfillStore {
    pool: Pool,
    candles: Arc<CandleStore>,
}

impl PgBackfillStore {
    pub fn new(pool: Pool, candles: Arc<CandleStore>) -> Self {
        Self { pool, candles }
    }
}

#[async_trait]
impl BackfillStore for PgBackfillStore {
    async fn acquire_queued_flag(&self, asset_id: i64, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now()
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(600));

        let client = self.pool.get().await?;
        let affected = client
            .execute(ACQUIRE_QUEUED_SQL, &[&asset_id, &QUEUED_FLAG, &expires_at])
            .await?;

        Ok(affected == 1)
    }

    async fn flag_live(&self, asset_id: i64, flag: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client.query_opt(FLAG_LIVE_SQL, &[&asset_id, &flag]).await?;
        Ok(row.is_some())
    }

    async fn on_active_watchlist(&self, asset_id: i64) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(ON_ACTIVE_WATCHLIST_SQL, &[&asset_id])
            .await?;
        Ok(row.is_some())
    }

    async fn latest_minute(&self, asset_id: i64) -> Result<Option<DateTime<Utc>>> {
        self.candles.latest_minute(asset_id).await
    }

    async fn earliest_minute(&self, asset_id: i64) -> Result<Option<DateTime<Utc>>> {
        self.candles.earliest_minute(asset_id).await
    }

    async fn has_candle_before(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        cutoff: DateTime<Utc>,
    ) -> Result<bool> {
        self.candles
            .has_candle_before(asset_id, timeframe, cutoff)
            .await
    }
}

/// Coordinates live writes against the external backfill job.
pub struct BackfillCoordinator {
    storage: Arc<dyn BackfillStore>,
    settings: BackfillSettings,
    http_client: reqwest::Client,
    /// In-process cooldown stamps per asset
    last_requested: Mutex<HashMap<i64, Instant>>,
    /// Total backfill requests that acquired the queued flag
    requests_sent: AtomicU64,
}

impl BackfillCoordinator {
    pub fn new(storage: Arc<dyn BackfillStore>, settings: BackfillSettings) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            storage,
            settings,
            http_client,
            last_requested: Mutex::new(HashMap::new()),
            requests_sent: AtomicU64::new(0),
        }
    }

    /// Total backfill requests that acquired the queued flag.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }

    /// Idempotently request a backfill for one asset. Returns true only if
    /// this call acquired the queued flag (and therefore triggered the
    /// runner); false when the flag was already live or could not be
    /// verified. The single entry point for enqueueing backfill work.
    pub async fn request_backfill(&self, asset_id: i64, source: &str) -> bool {
        let acquired = match self
            .storage
            .acquire_queued_flag(asset_id, self.settings.queued_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                error!("Could not acquire queued flag for asset {}: {}", asset_id, e);
                return false;
            }
        };

        if !acquired {
            debug!("Backfill already queued for asset {}", asset_id);
            return false;
        }

        self.requests_sent.fetch_add(1, Ordering::SeqCst);
        info!("Backfill queued for asset {} (source: {})", asset_id, source);

        // The flag stays set on a failed trigger so dedup remains correct;
        // a retry becomes possible once the TTL lapses.
        if let Err(e) = self.trigger_runner(asset_id, source).await {
            error!(
                "Failed to trigger backfill runner for asset {}: {}",
                asset_id, e
            );
        }

        true
    }

    /// For each asset with no 1-minute data, or 1-minute data older than
    /// the staleness threshold, request a backfill unless the per-asset
    /// cooldown is still running or the asset has left every active
    /// watchlist. Returns the assets for which a request was attempted so
    /// the caller can reset exactly their accumulator state.
    pub async fn maybe_schedule_for_assets(&self, asset_ids: &[i64]) -> HashSet<i64> {
        let mut scheduled = HashSet::new();

        for &asset_id in asset_ids {
            match self.needs_backfill(asset_id).await {
                Ok(false) => {}
                Ok(true) => {
                    if self.maybe_schedule(asset_id).await {
                        scheduled.insert(asset_id);
                    }
                }
                Err(e) => {
                    warn!("Skipping backfill check for asset {}: {}", asset_id, e);
                }
            }
        }

        scheduled
    }

    async fn needs_backfill(&self, asset_id: i64) -> Result<bool> {
        match self.storage.latest_minute(asset_id).await? {
            None => Ok(true),
            Some(latest) => {
                let age = Utc::now() - latest;
                let staleness = ChronoDuration::from_std(self.settings.staleness)
                    .unwrap_or_else(|_| ChronoDuration::seconds(300));
                Ok(age > staleness)
            }
        }
    }

    /// Cooldown plus watchlist-membership gate in front of
    /// `request_backfill`. Returns true when a request was attempted, even
    /// if another caller had already queued the job: the caller still
    /// needs to drop its stale accumulator state in that case.
    async fn maybe_schedule(&self, asset_id: i64) -> bool {
        if !self.cooldown_elapsed(asset_id) {
            debug!("Backfill cooldown active for asset {}", asset_id);
            return false;
        }

        match self.storage.on_active_watchlist(asset_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Asset {} is no longer on an active watchlist, skipping backfill",
                    asset_id
                );
                return false;
            }
            Err(e) => {
                warn!("Could not verify watchlist membership for asset {}: {}", asset_id, e);
                return false;
            }
        }

        self.record_request(asset_id);
        self.request_backfill(asset_id, "stream").await;
        true
    }

    /// Whether live writes are safe for this asset and timeframe, checked
    /// in strict order: running flag → completed flag → coverage
    /// heuristic. Any uncertainty yields false.
    pub async fn is_historical_complete(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
    ) -> bool {
        match self.storage.flag_live(asset_id, RUNNING_FLAG).await {
            Ok(true) => {
                debug!(
                    "Backfill running for asset {}, deferring {} bucket {}",
                    asset_id, timeframe, bucket_start
                );
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Could not read running flag for asset {}: {}", asset_id, e);
            }
        }

        match self.storage.flag_live(asset_id, COMPLETED_FLAG).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!("Could not read completed flag for asset {}: {}", asset_id, e);
            }
        }

        self.coverage_heuristic(asset_id, timeframe)
            .await
            .unwrap_or(false)
    }

    /// Coverage heuristic: at least one 1-minute row, the earliest of them
    /// older than the coverage window, and at least one row in the target
    /// timeframe from before the start of yesterday (UTC).
    async fn coverage_heuristic(&self, asset_id: i64, timeframe: Timeframe) -> Result<bool> {
        if self.storage.latest_minute(asset_id).await?.is_none() {
            return Ok(false);
        }

        let earliest = match self.storage.earliest_minute(asset_id).await? {
            Some(ts) => ts,
            None => return Ok(false),
        };

        let now = Utc::now();
        if earliest > now - ChronoDuration::days(COVERAGE_DAYS) {
            return Ok(false);
        }

        let historical_cutoff = floor_to_bucket(now, Timeframe::Day1) - ChronoDuration::days(1);
        self.storage
            .has_candle_before(asset_id, timeframe, historical_cutoff)
            .await
    }

    async fn trigger_runner(&self, asset_id: i64, source: &str) -> Result<()> {
        let payload = serde_json::json!({
            "asset_id": asset_id,
            "source": source,
            "requested_at": Utc::now().to_rfc3339(),
        });

        debug!("Sending backfill request to {}", self.settings.runner_url);

        let response = self
            .http_client
            .post(&self.settings.runner_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FeederError::http(format!("Failed to send backfill request: {}", e)))?;

        if !response.status().is_success() {
            return Err(FeederError::http(format!(
                "Backfill request failed with status: {}",
                response.status()
            )));
        }

        Ok(())
    }

    fn cooldown_elapsed(&self, asset_id: i64) -> bool {
        let last = self.last_requested.lock();
        match last.get(&asset_id) {
            Some(at) => at.elapsed() >= self.settings.cooldown,
            None => true,
        }
    }

    fn record_request(&self, asset_id: i64) {
        self.last_requested.lock().insert(asset_id, Instant::now());
    }
}

#[async_trait]
impl HistoricalGate for BackfillCoordinator {
    async fn is_historical_complete(
        &self,
        asset_id: i64,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
    ) -> bool {
        BackfillCoordinator::is_historical_complete(self, asset_id, timeframe, bucket_start).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// In-memory stand-in for the flag table and candle coverage. The
    /// queued flag behaves like the SQL test-and-set: the first acquire
    /// wins, later callers see the live flag.
    #[derive(Default)]
    struct ScriptedStore {
        running_live: bool,
        completed_live: bool,
        flags_fail: bool,
        candles_fail: bool,
        on_watchlist: bool,
        latest: Option<DateTime<Utc>>,
        earliest: Option<DateTime<Utc>>,
        deep_history: bool,
        queued: AtomicBool,
    }

    fn outage() -> FeederError {
        FeederError::Io(std::io::Error::other("storage unavailable"))
    }

    #[async_trait]
    impl BackfillStore for ScriptedStore {
        async fn acquire_queued_flag(&self, _asset_id: i64, _ttl: Duration) -> Result<bool> {
            Ok(!self.queued.swap(true, Ordering::SeqCst))
        }

        async fn flag_live(&self, _asset_id: i64, flag: &str) -> Result<bool> {
            if self.flags_fail {
                return Err(outage());
            }
            Ok(match flag {
                RUNNING_FLAG => self.running_live,
                COMPLETED_FLAG => self.completed_live,
                _ => false,
            })
        }

        async fn on_active_watchlist(&self, _asset_id: i64) -> Result<bool> {
            Ok(self.on_watchlist)
        }

        async fn latest_minute(&self, _asset_id: i64) -> Result<Option<DateTime<Utc>>> {
            if self.candles_fail {
                return Err(outage());
            }
            Ok(self.latest)
        }

        async fn earliest_minute(&self, _asset_id: i64) -> Result<Option<DateTime<Utc>>> {
            if self.candles_fail {
                return Err(outage());
            }
            Ok(self.earliest)
        }

        async fn has_candle_before(
            &self,
            _asset_id: i64,
            _timeframe: Timeframe,
            _cutoff: DateTime<Utc>,
        ) -> Result<bool> {
            if self.candles_fail {
                return Err(outage());
            }
            Ok(self.deep_history)
        }
    }

    /// Coverage that satisfies every leg of the heuristic.
    fn covered_store() -> ScriptedStore {
        let now = Utc::now();
        ScriptedStore {
            latest: Some(now - ChronoDuration::minutes(1)),
            earliest: Some(now - ChronoDuration::days(6)),
            deep_history: true,
            ..Default::default()
        }
    }

    fn coordinator(store: Arc<ScriptedStore>, cooldown: Duration) -> BackfillCoordinator {
        BackfillCoordinator::new(
            store,
            BackfillSettings {
                runner_url: "http://localhost:1/backfill".to_string(),
                queued_ttl: Duration::from_secs(600),
                staleness: Duration::from_secs(300),
                cooldown,
            },
        )
    }

    #[test]
    fn test_cooldown_blocks_repeat_requests() {
        let coord = coordinator(Arc::new(ScriptedStore::default()), Duration::from_secs(900));

        assert!(coord.cooldown_elapsed(7));
        coord.record_request(7);
        assert!(!coord.cooldown_elapsed(7));
        // Other assets are unaffected
        assert!(coord.cooldown_elapsed(8));
    }

    #[test]
    fn test_zero_cooldown_always_elapsed() {
        let coord = coordinator(Arc::new(ScriptedStore::default()), Duration::ZERO);
        coord.record_request(7);
        assert!(coord.cooldown_elapsed(7));
    }

    #[tokio::test]
    async fn test_running_flag_overrides_completed_flag() {
        // The fetch can re-queue while an old completed flag still has
        // days of TTL left; running must win.
        let store = ScriptedStore {
            running_live: true,
            completed_live: true,
            ..covered_store()
        };
        let coord = coordinator(Arc::new(store), Duration::ZERO);

        assert!(
            !coord
                .is_historical_complete(1, Timeframe::Hour1, Utc::now())
                .await
        );
    }

    #[tokio::test]
    async fn test_completed_flag_vouches_without_coverage() {
        // No candle rows at all, but a live completed flag settles it
        // before the heuristic runs.
        let store = ScriptedStore {
            completed_live: true,
            ..Default::default()
        };
        let coord = coordinator(Arc::new(store), Duration::ZERO);

        assert!(
            coord
                .is_historical_complete(1, Timeframe::Hour1, Utc::now())
                .await
        );
    }

    #[tokio::test]
    async fn test_coverage_heuristic_requires_every_condition() {
        let now = Utc::now();

        // Rows exist, the earliest reaches past the coverage window, and
        // the target timeframe has a row from before yesterday.
        let full = coordinator(Arc::new(covered_store()), Duration::ZERO);
        assert!(full.is_historical_complete(1, Timeframe::Hour1, now).await);

        // No 1-minute rows at all.
        let empty = coordinator(Arc::new(ScriptedStore::default()), Duration::ZERO);
        assert!(!empty.is_historical_complete(1, Timeframe::Hour1, now).await);

        // Earliest coverage starts too recently.
        let shallow = coordinator(
            Arc::new(ScriptedStore {
                earliest: Some(now - ChronoDuration::days(1)),
                ..covered_store()
            }),
            Duration::ZERO,
        );
        assert!(!shallow.is_historical_complete(1, Timeframe::Hour1, now).await);

        // Deep 1-minute coverage but nothing in the target timeframe
        // from before the start of yesterday.
        let unrolled = coordinator(
            Arc::new(ScriptedStore {
                deep_history: false,
                ..covered_store()
            }),
            Duration::ZERO,
        );
        assert!(!unrolled.is_historical_complete(1, Timeframe::Hour1, now).await);
    }

    #[tokio::test]
    async fn test_flag_read_errors_fall_through_to_heuristic() {
        // Unreadable flags defer to the coverage evidence rather than
        // blocking a fully-covered asset.
        let store = ScriptedStore {
            flags_fail: true,
            ..covered_store()
        };
        let coord = coordinator(Arc::new(store), Duration::ZERO);

        assert!(
            coord
                .is_historical_complete(1, Timeframe::Hour1, Utc::now())
                .await
        );
    }

    #[tokio::test]
    async fn test_coverage_read_errors_resolve_to_not_complete() {
        let store = ScriptedStore {
            candles_fail: true,
            ..covered_store()
        };
        let coord = coordinator(Arc::new(store), Duration::ZERO);

        assert!(
            !coord
                .is_historical_complete(1, Timeframe::Hour1, Utc::now())
                .await
        );
    }

    #[tokio::test]
    async fn test_second_request_sees_live_queued_flag() {
        let coord = coordinator(Arc::new(ScriptedStore::default()), Duration::ZERO);

        // First caller wins the flag; the runner trigger fails against
        // the closed port, which must not undo the acquisition.
        assert!(coord.request_backfill(1, "stream").await);
        // Second caller finds the flag still live and backs off.
        assert!(!coord.request_backfill(1, "stream").await);
        assert_eq!(coord.requests_sent(), 1);
    }

    #[tokio::test]
    async fn test_schedule_targets_stale_watchlisted_assets() {
        let stale = ScriptedStore {
            on_watchlist: true,
            latest: Some(Utc::now() - ChronoDuration::hours(2)),
            ..Default::default()
        };
        let coord = coordinator(Arc::new(stale), Duration::from_secs(900));

        let scheduled = coord.maybe_schedule_for_assets(&[7]).await;
        assert_eq!(scheduled, HashSet::from([7]));
        assert_eq!(coord.requests_sent(), 1);

        // The cooldown stamp from that attempt holds off a rerun.
        let again = coord.maybe_schedule_for_assets(&[7]).await;
        assert!(again.is_empty());
        assert_eq!(coord.requests_sent(), 1);
    }

    #[tokio::test]
    async fn test_schedule_skips_assets_off_active_watchlists() {
        // No 1-minute data at all, but the asset has left every active
        // watchlist; no request goes out.
        let coord = coordinator(Arc::new(ScriptedStore::default()), Duration::ZERO);

        let scheduled = coord.maybe_schedule_for_assets(&[7]).await;

        assert!(scheduled.is_empty());
        assert_eq!(coord.requests_sent(), 0);
    }

    #[tokio::test]
    async fn test_fresh_assets_are_not_scheduled() {
        let fresh = ScriptedStore {
            on_watchlist: true,
            latest: Some(Utc::now() - ChronoDuration::seconds(30)),
            ..Default::default()
        };
        let coord = coordinator(Arc::new(fresh), Duration::ZERO);

        assert!(coord.maybe_schedule_for_assets(&[7]).await.is_empty());
        assert_eq!(coord.requests_sent(), 0);
    }
}
