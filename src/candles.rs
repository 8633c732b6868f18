//! Candle domain types and the pure merge semantics shared by the
//! in-memory accumulators and the persistence layer.
//!
//! OHLC fields are `Option<f64>` so "not yet observed" is explicit: open
//! fills once and is never overwritten, high/low only ever widen, close is
//! last-write-wins by arrival order, and volume either accumulates
//! (`Delta`) or is replaced (`Snapshot`) depending on the write mode.

use chrono::{DateTime, Utc};

/// Composite key identifying one bucket of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub asset_id: i64,
    pub bucket: DateTime<Utc>,
}

impl CandleKey {
    pub fn new(asset_id: i64, bucket: DateTime<Utc>) -> Self {
        Self { asset_id, bucket }
    }
}

/// How volume is combined when a write merges into an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Incoming volume adds to stored volume (incremental 1-minute writes).
    Delta,
    /// Incoming volume replaces stored volume (live open-bucket flushes,
    /// safe to repeat without double-counting).
    Snapshot,
}

/// Partial OHLCV state for one bucket. Doubles as the in-flight
/// accumulator entry and as the merge payload handed to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleUpdate {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: f64,
    pub trade_count: Option<i64>,
    pub vwap: Option<f64>,
    /// Ordered, de-duplicated ids of the 1-minute rows folded into this
    /// bucket. Empty for 1-minute updates themselves.
    pub minute_candle_ids: Vec<i64>,
}

impl CandleUpdate {
    /// Fold a single trade tick into this (1-minute) state.
    pub fn apply_trade(&mut self, price: f64, size: f64) {
        if self.open.is_none() {
            self.open = Some(price);
        }
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
        self.close = Some(price);
        self.volume += size;
    }

    /// Fold one 1-minute candle into this higher-timeframe accumulator
    /// state: open fills if unset, high/low widen, close replaces, volume
    /// sums. Trade count and vwap are left to the offline resampler, and
    /// minute ids are attached separately once their row ids are known.
    pub fn fold_minute(&mut self, minute: &CandleUpdate) {
        if self.open.is_none() {
            self.open = minute.open;
        }
        if let Some(h) = minute.high {
            self.high = Some(self.high.map_or(h, |cur| cur.max(h)));
        }
        if let Some(l) = minute.low {
            self.low = Some(self.low.map_or(l, |cur| cur.min(l)));
        }
        if minute.close.is_some() {
            self.close = minute.close;
        }
        self.volume += minute.volume;
    }

    /// Record a 1-minute row id, preserving insertion order and skipping
    /// ids already present.
    pub fn attach_minute_id(&mut self, id: i64) {
        if !self.minute_candle_ids.contains(&id) {
            self.minute_candle_ids.push(id);
        }
    }

    /// Merge an incoming update into this stored state. This is the row
    /// merge used by the persistence layer: open fills only if previously
    /// null, high/low widen, close replaces when present, volume combines
    /// per `mode`, trade count and vwap replace when present, and minute
    /// ids are set-unioned (existing order kept, unseen ids appended).
    pub fn merge_from(&mut self, incoming: &CandleUpdate, mode: WriteMode) {
        if self.open.is_none() {
            self.open = incoming.open;
        }
        if let Some(h) = incoming.high {
            self.high = Some(self.high.map_or(h, |cur| cur.max(h)));
        }
        if let Some(l) = incoming.low {
            self.low = Some(self.low.map_or(l, |cur| cur.min(l)));
        }
        if incoming.close.is_some() {
            self.close = incoming.close;
        }
        match mode {
            WriteMode::Delta => self.volume += incoming.volume,
            WriteMode::Snapshot => self.volume = incoming.volume,
        }
        if incoming.trade_count.is_some() {
            self.trade_count = incoming.trade_count;
        }
        if incoming.vwap.is_some() {
            self.vwap = incoming.vwap;
        }
        for id in &incoming.minute_candle_ids {
            if !self.minute_candle_ids.contains(id) {
                self.minute_candle_ids.push(*id);
            }
        }
    }
}
