//! Higher-timeframe accumulation over the 1-minute base.
//!
//! Every batch of persisted 1-minute candles is folded into in-memory
//! accumulators for the six higher timeframes. Live (still-open) buckets
//! are snapshotted to storage on a throttle so charts track the market in
//! near-real-time; fully closed buckets get one final snapshot and leave
//! memory. Both write paths re-check the historical-completeness gate per
//! key immediately before writing, because the external backfill job runs
//! concurrently with this loop at all times.

use crate::backfill::HistoricalGate;
use crate::bucket::{floor_to_bucket, Timeframe};
use crate::candles::{CandleKey, CandleUpdate, WriteMode};
use crate::store::CandleSink;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct TimeframeAggregator {
    sink: Arc<dyn CandleSink>,
    gate: Arc<dyn HistoricalGate>,
    /// In-flight accumulators, keyed by timeframe then (asset, bucket start)
    buckets: HashMap<Timeframe, HashMap<CandleKey, CandleUpdate>>,
    last_open_flush: HashMap<Timeframe, Instant>,
    open_flush_interval: Duration,
}

impl TimeframeAggregator {
    pub fn new(
        sink: Arc<dyn CandleSink>,
        gate: Arc<dyn HistoricalGate>,
        open_flush_interval: Duration,
    ) -> Self {
        Self {
            sink,
            gate,
            buckets: HashMap::new(),
            last_open_flush: HashMap::new(),
            open_flush_interval,
        }
    }

    /// Number of in-flight higher-timeframe buckets held in memory.
    pub fn buffered_buckets(&self) -> usize {
        self.buckets.values().map(|m| m.len()).sum()
    }

    /// Folds a batch of 1-minute candles into every higher timeframe's
    /// accumulator and reports which (timeframe, bucket) keys were
    /// touched. Minutes are folded in timestamp order, so the bucket open
    /// comes from the earliest minute in the batch. Never touches storage.
    pub fn rollup_from_minutes(
        &mut self,
        minutes: &HashMap<CandleKey, CandleUpdate>,
    ) -> HashMap<Timeframe, HashSet<CandleKey>> {
        let mut entries: Vec<(&CandleKey, &CandleUpdate)> = minutes.iter().collect();
        entries.sort_by_key(|(key, _)| (key.asset_id, key.bucket));

        let mut touched: HashMap<Timeframe, HashSet<CandleKey>> = HashMap::new();
        for (key, minute) in entries {
            for timeframe in Timeframe::HIGHER {
                let bucket = floor_to_bucket(key.bucket, timeframe);
                let higher_key = CandleKey::new(key.asset_id, bucket);

                self.buckets
                    .entry(timeframe)
                    .or_default()
                    .entry(higher_key)
                    .or_default()
                    .fold_minute(minute);

                touched.entry(timeframe).or_default().insert(higher_key);
            }
        }

        touched
    }

    /// Records resolved 1-minute row ids on the accumulators containing
    /// those minutes, keeping the `minute_candle_ids` linkage current.
    pub fn attach_minute_ids(&mut self, minute_ids: &HashMap<CandleKey, i64>) {
        for (minute_key, &row_id) in minute_ids {
            for timeframe in Timeframe::HIGHER {
                let bucket = floor_to_bucket(minute_key.bucket, timeframe);
                let higher_key = CandleKey::new(minute_key.asset_id, bucket);
                if let Some(acc) = self
                    .buckets
                    .get_mut(&timeframe)
                    .and_then(|m| m.get_mut(&higher_key))
                {
                    acc.attach_minute_id(row_id);
                }
            }
        }
    }

    /// Snapshots still-open touched buckets to storage, at most once per
    /// flush interval per timeframe. A key whose history is not yet
    /// complete is skipped and stays in memory for the next cycle.
    /// Snapshot mode replaces volume, so repeated flushes of the same
    /// bucket never double-count.
    pub async fn persist_open(
        &mut self,
        touched: &HashMap<Timeframe, HashSet<CandleKey>>,
        latest_minute: DateTime<Utc>,
    ) {
        for (&timeframe, keys) in touched {
            if keys.is_empty() {
                continue;
            }
            if let Some(last) = self.last_open_flush.get(&timeframe) {
                if last.elapsed() < self.open_flush_interval {
                    continue;
                }
            }
            self.last_open_flush.insert(timeframe, Instant::now());

            let mut updates: HashMap<CandleKey, CandleUpdate> = HashMap::new();
            for &key in keys {
                if key.bucket + timeframe.duration() <= latest_minute {
                    // Closed already; flush_closed owns it
                    continue;
                }
                let state = match self.buckets.get(&timeframe).and_then(|m| m.get(&key)) {
                    Some(state) => state.clone(),
                    None => continue,
                };
                if self
                    .gate
                    .is_historical_complete(key.asset_id, timeframe, key.bucket)
                    .await
                {
                    updates.insert(key, state);
                } else {
                    debug!(
                        "Holding live {} bucket {} for asset {} until backfill completes",
                        timeframe, key.bucket, key.asset_id
                    );
                }
            }

            if !updates.is_empty() {
                self.sink
                    .save_candles(timeframe, updates, WriteMode::Snapshot)
                    .await;
            }
        }
    }

    /// Final-flushes every bucket whose end time has passed and removes it
    /// from memory. Buckets the backfill has not caught up to are evicted
    /// without writing; their authoritative close comes from the offline
    /// resample instead of a possibly-incomplete live state.
    pub async fn flush_closed(&mut self, latest_minute: DateTime<Utc>) {
        for timeframe in Timeframe::HIGHER {
            let closed: Vec<CandleKey> = match self.buckets.get(&timeframe) {
                Some(map) => map
                    .keys()
                    .filter(|key| key.bucket + timeframe.duration() <= latest_minute)
                    .copied()
                    .collect(),
                None => continue,
            };
            if closed.is_empty() {
                continue;
            }

            let mut updates: HashMap<CandleKey, CandleUpdate> = HashMap::new();
            for key in closed {
                let state = match self.buckets.get_mut(&timeframe).and_then(|m| m.remove(&key)) {
                    Some(state) => state,
                    None => continue,
                };
                if self
                    .gate
                    .is_historical_complete(key.asset_id, timeframe, key.bucket)
                    .await
                {
                    updates.insert(key, state);
                } else {
                    debug!(
                        "Discarding closed {} bucket {} for asset {} (history incomplete)",
                        timeframe, key.bucket, key.asset_id
                    );
                }
            }

            if !updates.is_empty() {
                self.sink
                    .save_candles(timeframe, updates, WriteMode::Snapshot)
                    .await;
            }
        }
    }

    /// Purges all in-flight buckets for one asset across every timeframe.
    /// Called when a backfill is newly scheduled so live partial state
    /// never mixes with the backfill's eventual resample.
    pub fn reset_for_asset(&mut self, asset_id: i64) {
        let mut purged = 0;
        for map in self.buckets.values_mut() {
            let before = map.len();
            map.retain(|key, _| key.asset_id != asset_id);
            purged += before - map.len();
        }
        if purged > 0 {
            info!(
                "Purged {} in-flight buckets for asset {} ahead of backfill",
                purged, asset_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingSink {
        saved: Mutex<Vec<(Timeframe, WriteMode, HashMap<CandleKey, CandleUpdate>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                saved: Mutex::new(Vec::new()),
            })
        }

        fn saves(&self) -> Vec<(Timeframe, WriteMode, HashMap<CandleKey, CandleUpdate>)> {
            self.saved.lock().clone()
        }
    }

    #[async_trait]
    impl CandleSink for RecordingSink {
        async fn save_candles(
            &self,
            timeframe: Timeframe,
            updates: HashMap<CandleKey, CandleUpdate>,
            mode: WriteMode,
        ) {
            self.saved.lock().push((timeframe, mode, updates));
        }
    }

    struct StaticGate(bool);

    #[async_trait]
    impl HistoricalGate for StaticGate {
        async fn is_historical_complete(
            &self,
            _asset_id: i64,
            _timeframe: Timeframe,
            _bucket_start: DateTime<Utc>,
        ) -> bool {
            self.0
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn minute_update(o: f64, h: f64, l: f64, c: f64, v: f64) -> CandleUpdate {
        CandleUpdate {
            open: Some(o),
            high: Some(h),
            low: Some(l),
            close: Some(c),
            volume: v,
            ..Default::default()
        }
    }

    fn aggregator(gate_open: bool, interval: Duration) -> (TimeframeAggregator, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let agg = TimeframeAggregator::new(sink.clone(), Arc::new(StaticGate(gate_open)), interval);
        (agg, sink)
    }

    #[test]
    fn test_rollup_touches_all_higher_timeframes() {
        let (mut agg, _sink) = aggregator(true, Duration::ZERO);

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 99.0, 101.0, 10.0),
        );

        let touched = agg.rollup_from_minutes(&minutes);

        assert_eq!(touched.len(), 6);
        // Intraday buckets anchor on the 09:30 New York session open
        assert!(touched[&Timeframe::Min5].contains(&CandleKey::new(1, ts("2023-10-30T14:30:00Z"))));
        assert!(touched[&Timeframe::Hour1].contains(&CandleKey::new(1, ts("2023-10-30T14:30:00Z"))));
        assert!(touched[&Timeframe::Hour4].contains(&CandleKey::new(1, ts("2023-10-30T13:30:00Z"))));
        assert!(touched[&Timeframe::Day1].contains(&CandleKey::new(1, ts("2023-10-30T00:00:00Z"))));
        assert_eq!(agg.buffered_buckets(), 6);
    }

    #[test]
    fn test_rollup_merges_minutes_in_timestamp_order() {
        let (mut agg, _sink) = aggregator(true, Duration::ZERO);

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:33:00Z")),
            minute_update(101.0, 105.0, 99.0, 99.0, 5.0),
        );
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 100.0, 102.0, 10.0),
        );

        agg.rollup_from_minutes(&minutes);

        let key = CandleKey::new(1, ts("2023-10-30T14:30:00Z"));
        let acc = &agg.buckets[&Timeframe::Min5][&key];
        assert_eq!(acc.open, Some(100.0));
        assert_eq!(acc.high, Some(105.0));
        assert_eq!(acc.low, Some(99.0));
        assert_eq!(acc.close, Some(99.0));
        assert_eq!(acc.volume, 15.0);
    }

    #[test]
    fn test_attach_minute_ids() {
        let (mut agg, _sink) = aggregator(true, Duration::ZERO);

        let minute_key = CandleKey::new(1, ts("2023-10-30T14:32:00Z"));
        let mut minutes = HashMap::new();
        minutes.insert(minute_key, minute_update(100.0, 102.0, 99.0, 101.0, 10.0));
        agg.rollup_from_minutes(&minutes);

        let mut ids = HashMap::new();
        ids.insert(minute_key, 42_i64);
        agg.attach_minute_ids(&ids);

        let key = CandleKey::new(1, ts("2023-10-30T14:30:00Z"));
        assert_eq!(agg.buckets[&Timeframe::Min5][&key].minute_candle_ids, vec![42]);
    }

    #[tokio::test]
    async fn test_persist_open_snapshots_live_buckets() {
        let (mut agg, sink) = aggregator(true, Duration::ZERO);

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 99.0, 101.0, 10.0),
        );
        let touched = agg.rollup_from_minutes(&minutes);

        agg.persist_open(&touched, ts("2023-10-30T14:32:00Z")).await;

        let saves = sink.saves();
        // Every higher timeframe bucket is still open at 14:32
        assert_eq!(saves.len(), 6);
        for (_, mode, updates) in &saves {
            assert_eq!(*mode, WriteMode::Snapshot);
            assert_eq!(updates.len(), 1);
        }
        // Buckets stay in memory after a live snapshot
        assert_eq!(agg.buffered_buckets(), 6);
    }

    #[tokio::test]
    async fn test_persist_open_throttles_per_timeframe() {
        let (mut agg, sink) = aggregator(true, Duration::from_secs(60));

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 99.0, 101.0, 10.0),
        );
        let all_touched = agg.rollup_from_minutes(&minutes);
        let mut touched = HashMap::new();
        touched.insert(Timeframe::Min5, all_touched[&Timeframe::Min5].clone());

        agg.persist_open(&touched, ts("2023-10-30T14:32:00Z")).await;
        agg.persist_open(&touched, ts("2023-10-30T14:32:00Z")).await;

        assert_eq!(sink.saves().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_open_holds_gated_buckets() {
        let (mut agg, sink) = aggregator(false, Duration::ZERO);

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 99.0, 101.0, 10.0),
        );
        let touched = agg.rollup_from_minutes(&minutes);

        agg.persist_open(&touched, ts("2023-10-30T14:32:00Z")).await;

        assert!(sink.saves().is_empty());
        // Gated buckets are retained for the next cycle
        assert_eq!(agg.buffered_buckets(), 6);
    }

    #[tokio::test]
    async fn test_flush_closed_writes_final_snapshot_and_evicts() {
        let (mut agg, sink) = aggregator(true, Duration::ZERO);

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 99.0, 101.0, 10.0),
        );
        agg.rollup_from_minutes(&minutes);

        // 14:30 + 5 minutes has passed once the 14:35 minute lands
        agg.flush_closed(ts("2023-10-30T14:35:00Z")).await;

        let saves = sink.saves();
        assert_eq!(saves.len(), 1);
        let (timeframe, mode, updates) = &saves[0];
        assert_eq!(*timeframe, Timeframe::Min5);
        assert_eq!(*mode, WriteMode::Snapshot);
        assert!(updates.contains_key(&CandleKey::new(1, ts("2023-10-30T14:30:00Z"))));
        assert_eq!(agg.buffered_buckets(), 5);
    }

    #[tokio::test]
    async fn test_flush_closed_discards_gated_buckets_without_writing() {
        let (mut agg, sink) = aggregator(false, Duration::ZERO);

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 99.0, 101.0, 10.0),
        );
        agg.rollup_from_minutes(&minutes);

        agg.flush_closed(ts("2023-10-30T14:35:00Z")).await;

        // Closed but incomplete: evicted silently, authority stays with
        // the offline resample
        assert!(sink.saves().is_empty());
        assert_eq!(agg.buffered_buckets(), 5);
    }

    #[test]
    fn test_reset_for_asset_scopes_to_one_asset() {
        let (mut agg, _sink) = aggregator(true, Duration::ZERO);

        let mut minutes = HashMap::new();
        minutes.insert(
            CandleKey::new(1, ts("2023-10-30T14:32:00Z")),
            minute_update(100.0, 102.0, 99.0, 101.0, 10.0),
        );
        minutes.insert(
            CandleKey::new(2, ts("2023-10-30T14:32:00Z")),
            minute_update(50.0, 51.0, 49.0, 50.0, 5.0),
        );
        agg.rollup_from_minutes(&minutes);
        assert_eq!(agg.buffered_buckets(), 12);

        agg.reset_for_asset(1);

        assert_eq!(agg.buffered_buckets(), 6);
        for map in agg.buckets.values() {
            assert!(map.keys().all(|key| key.asset_id == 2));
        }
    }
}
