//! Watchlist-driven subscription state.
//!
//! Tracks which symbols should be on the stream (active rows of active
//! watchlists) against which symbols currently are, and turns the
//! difference into subscribe/unsubscribe control frames. Transport
//! details stay behind [`SubscriptionSender`]; backfill scheduling for
//! newly added assets happens through [`SubscriptionHooks`] before the
//! subscribe frame goes out.

use crate::errors::Result;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DESIRED_ASSETS_SQL: &str = r#"
    SELECT DISTINCT a.id, a.symbol, a.asset_class
    FROM assets a
    JOIN watchlist_assets wa ON wa.asset_id = a.id
    JOIN watchlists w ON w.id = wa.watchlist_id
    WHERE wa.is_active AND w.is_active
"#;

/// Market segment an asset trades in. Each class maps to one transport
/// channel and determines whether trading-hours gating applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetClass {
    UsEquity,
    Crypto,
}

impl AssetClass {
    /// Maps the `assets.asset_class` column. Classes the stream does not
    /// carry (options, OTC) yield `None` and are skipped.
    pub fn from_db(value: &str) -> Option<AssetClass> {
        match value {
            "us_equity" => Some(AssetClass::UsEquity),
            "crypto" => Some(AssetClass::Crypto),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AssetClass::UsEquity => "us_equity",
            AssetClass::Crypto => "crypto",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionAction::Subscribe => "subscribe",
            SubscriptionAction::Unsubscribe => "unsubscribe",
        }
    }
}

/// One desired asset as returned by the watchlist query.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRecord {
    pub asset_id: i64,
    pub symbol: String,
    pub class: AssetClass,
}

/// Routes a subscribe/unsubscribe frame to the transport channel for the
/// given class.
#[async_trait]
pub trait SubscriptionSender: Send + Sync {
    async fn send_subscription(
        &self,
        action: SubscriptionAction,
        class: AssetClass,
        symbols: &[String],
    ) -> Result<()>;
}

/// Invoked with the asset ids newly entering the subscription, before
/// their subscribe frame is sent.
#[async_trait]
pub trait SubscriptionHooks: Send + Sync {
    async fn assets_added(&self, asset_ids: Vec<i64>);
}

/// Subscribed symbols plus the lookup caches the fold path classifies
/// ticks with. Cheap to clone; readers take a snapshot instead of
/// holding the lock.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionState {
    pub subscribed: HashSet<String>,
    pub asset_ids: HashMap<String, i64>,
    pub classes: HashMap<i64, AssetClass>,
}

pub struct SubscriptionSet {
    pool: Pool,
    sender: Arc<dyn SubscriptionSender>,
    hooks: Arc<dyn SubscriptionHooks>,
    state: Mutex<SubscriptionState>,
    /// Serializes reconcile runs; the state mutex is never held across await
    reconcile_guard: tokio::sync::Mutex<()>,
}

impl SubscriptionSet {
    pub fn new(
        pool: Pool,
        sender: Arc<dyn SubscriptionSender>,
        hooks: Arc<dyn SubscriptionHooks>,
    ) -> Self {
        Self {
            pool,
            sender,
            hooks,
            state: Mutex::new(SubscriptionState::default()),
            reconcile_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Consistent copy of the subscription state for the fold path.
    pub fn snapshot(&self) -> SubscriptionState {
        self.state.lock().clone()
    }

    pub fn subscribed_count(&self) -> usize {
        self.state.lock().subscribed.len()
    }

    /// Symbols the stream should currently carry.
    pub async fn desired_symbols(&self) -> Result<HashSet<String>> {
        let desired = self.fetch_desired().await?;
        Ok(desired.into_iter().map(|r| r.symbol).collect())
    }

    /// Brings the subscribed set in line with the watchlists. Idempotent;
    /// a run with no delta sends nothing. Safe to call from the periodic
    /// loop and the auth handler concurrently.
    pub async fn reconcile(&self) -> Result<()> {
        let _guard = self.reconcile_guard.lock().await;
        let desired = self.fetch_desired().await?;
        self.apply_desired(desired).await;
        Ok(())
    }

    /// Forget confirmed subscriptions for one class after its transport
    /// channel drops; the next reconcile resubscribes them. Lookup caches
    /// are append-only, only `subscribed` shrinks.
    pub fn mark_disconnected(&self, class: AssetClass) {
        let mut state = self.state.lock();
        let SubscriptionState {
            subscribed,
            asset_ids,
            classes,
        } = &mut *state;

        let before = subscribed.len();
        subscribed.retain(|symbol| {
            asset_ids
                .get(symbol)
                .and_then(|id| classes.get(id))
                .map(|c| *c != class)
                .unwrap_or(false)
        });

        let dropped = before - subscribed.len();
        if dropped > 0 {
            debug!("Cleared {} {} subscriptions after disconnect", dropped, class);
        }
    }

    async fn apply_desired(&self, desired: Vec<AssetRecord>) {
        let subscribed = self.state.lock().subscribed.clone();
        let (added, removed) = compute_delta(&desired, &subscribed);

        if added.is_empty() && removed.is_empty() {
            return;
        }

        // Caches first, then hooks, then frames: by the time a subscribe
        // goes out, backfill scheduling for the new assets has already run
        // and their ticks are classifiable.
        {
            let mut state = self.state.lock();
            for record in &added {
                state.asset_ids.insert(record.symbol.clone(), record.asset_id);
                state.classes.insert(record.asset_id, record.class);
            }
        }

        if !added.is_empty() {
            let added_ids: Vec<i64> = added.iter().map(|r| r.asset_id).collect();
            self.hooks.assets_added(added_ids).await;
        }

        let mut subscribe_by_class: HashMap<AssetClass, Vec<String>> = HashMap::new();
        for record in &added {
            subscribe_by_class
                .entry(record.class)
                .or_default()
                .push(record.symbol.clone());
        }

        for (class, mut symbols) in subscribe_by_class {
            symbols.sort();
            match self
                .sender
                .send_subscription(SubscriptionAction::Subscribe, class, &symbols)
                .await
            {
                Ok(()) => {
                    info!("Subscribed {} {} symbols: {:?}", symbols.len(), class, symbols);
                    let mut state = self.state.lock();
                    state.subscribed.extend(symbols.iter().cloned());
                }
                Err(e) => {
                    // Not marked subscribed; the next reconcile retries
                    warn!("Failed to send {} subscribe: {}", class, e);
                }
            }
        }

        let mut unsubscribe_by_class: HashMap<AssetClass, Vec<String>> = HashMap::new();
        let mut unroutable: Vec<String> = Vec::new();
        {
            let state = self.state.lock();
            for symbol in &removed {
                match state
                    .asset_ids
                    .get(symbol)
                    .and_then(|id| state.classes.get(id))
                {
                    Some(class) => unsubscribe_by_class
                        .entry(*class)
                        .or_default()
                        .push(symbol.clone()),
                    None => unroutable.push(symbol.clone()),
                }
            }
        }

        if !unroutable.is_empty() {
            warn!(
                "Dropping {} symbols with no class mapping from the subscribed set",
                unroutable.len()
            );
            let mut state = self.state.lock();
            for symbol in &unroutable {
                state.subscribed.remove(symbol);
            }
        }

        for (class, mut symbols) in unsubscribe_by_class {
            symbols.sort();
            match self
                .sender
                .send_subscription(SubscriptionAction::Unsubscribe, class, &symbols)
                .await
            {
                Ok(()) => {
                    info!(
                        "Unsubscribed {} {} symbols: {:?}",
                        symbols.len(),
                        class,
                        symbols
                    );
                    let mut state = self.state.lock();
                    for symbol in &symbols {
                        state.subscribed.remove(symbol);
                    }
                }
                Err(e) => {
                    warn!("Failed to send {} unsubscribe: {}", class, e);
                }
            }
        }
    }

    async fn fetch_desired(&self) -> Result<Vec<AssetRecord>> {
        let client = self.pool.get().await?;
        let rows = client.query(DESIRED_ASSETS_SQL, &[]).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let asset_id: i64 = row.get("id");
            let symbol: String = row.get("symbol");
            let class_label: String = row.get("asset_class");
            match AssetClass::from_db(&class_label) {
                Some(class) => records.push(AssetRecord {
                    asset_id,
                    symbol,
                    class,
                }),
                None => {
                    warn!(
                        "Asset {} has unsupported class {:?}, skipping",
                        symbol, class_label
                    );
                }
            }
        }

        Ok(records)
    }
}

/// Splits the desired records into those not yet subscribed and the
/// subscribed symbols no longer desired. Output is sorted by symbol.
fn compute_delta(
    desired: &[AssetRecord],
    subscribed: &HashSet<String>,
) -> (Vec<AssetRecord>, Vec<String>) {
    let desired_symbols: HashSet<&str> = desired.iter().map(|r| r.symbol.as_str()).collect();

    let mut added: Vec<AssetRecord> = desired
        .iter()
        .filter(|r| !subscribed.contains(&r.symbol))
        .cloned()
        .collect();
    added.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    let mut removed: Vec<String> = subscribed
        .iter()
        .filter(|s| !desired_symbols.contains(s.as_str()))
        .cloned()
        .collect();
    removed.sort();

    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_postgres::{Manager, ManagerConfig, RecyclingMethod};
    use tokio_postgres::NoTls;

    fn lazy_pool() -> Pool {
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

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(SubscriptionAction, AssetClass, Vec<String>)>>,
    }

    #[async_trait]
    impl SubscriptionSender for RecordingSender {
        async fn send_subscription(
            &self,
            action: SubscriptionAction,
            class: AssetClass,
            symbols: &[String],
        ) -> Result<()> {
            self.sent.lock().push((action, class, symbols.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        added: Mutex<Vec<Vec<i64>>>,
    }

    #[async_trait]
    impl SubscriptionHooks for RecordingHooks {
        async fn assets_added(&self, asset_ids: Vec<i64>) {
            self.added.lock().push(asset_ids);
        }
    }

    fn record(id: i64, symbol: &str, class: AssetClass) -> AssetRecord {
        AssetRecord {
            asset_id: id,
            symbol: symbol.to_string(),
            class,
        }
    }

    #[test]
    fn test_compute_delta() {
        let desired = vec![
            record(1, "A", AssetClass::UsEquity),
            record(2, "B", AssetClass::UsEquity),
            record(3, "C", AssetClass::UsEquity),
        ];
        let subscribed: HashSet<String> =
            ["B", "C", "D"].iter().map(|s| s.to_string()).collect();

        let (added, removed) = compute_delta(&desired, &subscribed);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].symbol, "A");
        assert_eq!(removed, vec!["D".to_string()]);
    }

    #[test]
    fn test_compute_delta_no_change() {
        let desired = vec![record(1, "A", AssetClass::UsEquity)];
        let subscribed: HashSet<String> = ["A"].iter().map(|s| s.to_string()).collect();

        let (added, removed) = compute_delta(&desired, &subscribed);

        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_sends_one_subscribe_and_one_unsubscribe() {
        let sender = Arc::new(RecordingSender::default());
        let hooks = Arc::new(RecordingHooks::default());
        let set = SubscriptionSet::new(lazy_pool(), sender.clone(), hooks.clone());

        {
            let mut state = set.state.lock();
            for (id, symbol) in [(2, "B"), (3, "C"), (4, "D")] {
                state.subscribed.insert(symbol.to_string());
                state.asset_ids.insert(symbol.to_string(), id);
                state.classes.insert(id, AssetClass::UsEquity);
            }
        }

        let desired = vec![
            record(1, "A", AssetClass::UsEquity),
            record(2, "B", AssetClass::UsEquity),
            record(3, "C", AssetClass::UsEquity),
        ];
        set.apply_desired(desired).await;

        let sent = sender.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            (
                SubscriptionAction::Subscribe,
                AssetClass::UsEquity,
                vec!["A".to_string()]
            )
        );
        assert_eq!(
            sent[1],
            (
                SubscriptionAction::Unsubscribe,
                AssetClass::UsEquity,
                vec!["D".to_string()]
            )
        );

        let state = set.snapshot();
        let expected: HashSet<String> =
            ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(state.subscribed, expected);

        // Hook fired once, with the new asset id, before the subscribe
        assert_eq!(*hooks.added.lock(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_reconcile_noop_sends_nothing() {
        let sender = Arc::new(RecordingSender::default());
        let hooks = Arc::new(RecordingHooks::default());
        let set = SubscriptionSet::new(lazy_pool(), sender.clone(), hooks.clone());

        {
            let mut state = set.state.lock();
            state.subscribed.insert("A".to_string());
            state.asset_ids.insert("A".to_string(), 1);
            state.classes.insert(1, AssetClass::UsEquity);
        }

        set.apply_desired(vec![record(1, "A", AssetClass::UsEquity)])
            .await;

        assert!(sender.sent.lock().is_empty());
        assert!(hooks.added.lock().is_empty());
    }

    #[test]
    fn test_mark_disconnected_scopes_by_class() {
        let set = SubscriptionSet::new(
            lazy_pool(),
            Arc::new(RecordingSender::default()),
            Arc::new(RecordingHooks::default()),
        );

        {
            let mut state = set.state.lock();
            state.subscribed.insert("AAPL".to_string());
            state.asset_ids.insert("AAPL".to_string(), 1);
            state.classes.insert(1, AssetClass::UsEquity);

            state.subscribed.insert("BTC/USD".to_string());
            state.asset_ids.insert("BTC/USD".to_string(), 2);
            state.classes.insert(2, AssetClass::Crypto);
        }

        set.mark_disconnected(AssetClass::UsEquity);

        let state = set.snapshot();
        assert!(!state.subscribed.contains("AAPL"));
        assert!(state.subscribed.contains("BTC/USD"));
        // Caches keep the mapping for buffered ticks
        assert_eq!(state.asset_ids.get("AAPL"), Some(&1));
    }

    #[test]
    fn test_asset_class_from_db() {
        assert_eq!(AssetClass::from_db("us_equity"), Some(AssetClass::UsEquity));
        assert_eq!(AssetClass::from_db("crypto"), Some(AssetClass::Crypto));
        assert_eq!(AssetClass::from_db("us_option"), None);
    }
}
