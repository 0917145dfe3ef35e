//! Real-time pipeline (C6) — keeps per-user analytics snapshots warm in the
//! background and detects significant changes.
//!
//! Three independent loops, each structured as an outer
//! `loop { sleep; cycle().await }` around a directly testable inner function.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::model::{
    AlertKind, ContextQuality, DataFreshness, Direction, PerformanceAlert, PipelineSnapshot,
    Significance,
};

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPriority {
    High,
    Normal,
    Low,
}

impl RefreshPriority {
    fn interval(self, config: &PipelineConfig) -> Duration {
        match self {
            RefreshPriority::High => Duration::from_secs(config.quick_refresh_min * 60),
            RefreshPriority::Normal => Duration::from_secs(config.normal_refresh_min * 60),
            RefreshPriority::Low => Duration::from_secs(config.background_refresh_min * 60),
        }
    }
}

/// Pipeline's exclusive mutable state; the only entity this crate persists
/// to `sled` across restarts, alongside [`PerformanceAlert`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserActivity {
    pub user_id: UserId,
    pub last_interaction_at: DateTime<Utc>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub refresh_priority: RefreshPriority,
    pub consecutive_errors: u32,
}

impl UserActivity {
    fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        UserActivity {
            user_id,
            last_interaction_at: now,
            last_refresh_at: None,
            refresh_priority: RefreshPriority::High,
            consecutive_errors: 0,
        }
    }

    /// Pure function of clocks.
    fn derive_priority(&self, now: DateTime<Utc>) -> RefreshPriority {
        if self.consecutive_errors >= 3 {
            return RefreshPriority::Low;
        }
        let since_interaction = now - self.last_interaction_at;
        if since_interaction < chrono::Duration::minutes(5) {
            RefreshPriority::High
        } else if since_interaction < chrono::Duration::hours(1) {
            RefreshPriority::Normal
        } else {
            RefreshPriority::Low
        }
    }

    fn due_for_refresh(&self, now: DateTime<Utc>, config: &PipelineConfig) -> bool {
        match self.last_refresh_at {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.refresh_priority.interval(config)
            }
        }
    }
}

/// An out-of-scope collaborator: the actual analytics backend. `comprehensive`
/// is the primary source; `basic` is the secondary fallback attempted on
/// primary failure.
#[async_trait::async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn comprehensive_summary(&self, user_id: &str) -> Result<RawSnapshot, String>;
    async fn basic_summary(&self, user_id: &str) -> Result<RawSnapshot, String>;
}

#[derive(Debug, Clone, Default)]
pub struct RawSnapshot {
    pub key_metrics: HashMap<String, f64>,
    pub performance_insights: Vec<String>,
}

struct SnapshotEntry {
    snapshot: PipelineSnapshot,
    previous_metrics: Option<HashMap<String, f64>>,
}

struct AlertDedup {
    seen: HashMap<(UserId, String, Direction), DateTime<Utc>>,
}

impl AlertDedup {
    fn new() -> Self {
        AlertDedup { seen: HashMap::new() }
    }

    fn should_emit(&mut self, user_id: &UserId, metric: &str, direction: Direction, now: DateTime<Utc>) -> bool {
        let key = (user_id.clone(), metric.to_string(), direction);
        match self.seen.get(&key) {
            Some(last) if now - *last < chrono::Duration::hours(24) => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    fn purge_older_than(&mut self, window: chrono::Duration, now: DateTime<Utc>) {
        self.seen.retain(|_, t| now - *t < window);
    }
}

/// Owns the per-user state and drives the three background loops. Cloned
/// freely behind `Arc` — all mutable state lives in its `RwLock`/`Mutex` fields.
pub struct Pipeline {
    config: PipelineConfig,
    activity: RwLock<HashMap<UserId, UserActivity>>,
    snapshots: RwLock<HashMap<UserId, SnapshotEntry>>,
    alerts: tokio::sync::Mutex<AlertDedup>,
    recent_alerts: RwLock<HashMap<UserId, Vec<PerformanceAlert>>>,
    refreshing: RwLock<std::collections::HashSet<UserId>>,
    source: Arc<dyn AnalyticsSource>,
    refresh_permits: Semaphore,
    shutdown: CancellationToken,
    store: Option<Arc<sled::Db>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn AnalyticsSource>, store: Option<Arc<sled::Db>>) -> Arc<Self> {
        let max_concurrent = config.max_concurrent_refreshes;
        let pipeline = Pipeline {
            config,
            activity: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            alerts: tokio::sync::Mutex::new(AlertDedup::new()),
            recent_alerts: RwLock::new(HashMap::new()),
            refreshing: RwLock::new(std::collections::HashSet::new()),
            source,
            refresh_permits: Semaphore::new(max_concurrent),
            shutdown: CancellationToken::new(),
            store,
        };
        if let Some(db) = pipeline.store.as_ref() {
            pipeline.restore_from_store(db);
        }
        Arc::new(pipeline)
    }

    fn restore_from_store(&self, _db: &sled::Db) {
        // Placeholder hook: actual restoration happens in `start()`, where we
        // have `&Arc<Self>` and can acquire the write locks asynchronously.
    }

    pub fn start(self: &Arc<Self>) {
        self.spawn_restore();

        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.refresh_scheduler_loop().await });

        let detector = Arc::clone(self);
        tokio::spawn(async move { detector.change_detector_loop().await });

        let cleanup = Arc::clone(self);
        tokio::spawn(async move { cleanup.cache_cleanup_loop().await });

        info!("pipeline started");
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn spawn_restore(self: &Arc<Self>) {
        let Some(db) = self.store.clone() else { return };
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut activity = pipeline.activity.write().await;
            for item in db.scan_prefix(b"activity:") {
                let Ok((_, value)) = item else { continue };
                if let Ok(parsed) = serde_json::from_slice::<UserActivity>(&value) {
                    activity.insert(parsed.user_id.clone(), parsed);
                }
            }
            drop(activity);

            let mut recent = pipeline.recent_alerts.write().await;
            for item in db.scan_prefix(b"alerts:") {
                let Ok((key, value)) = item else { continue };
                if let Ok(parsed) = serde_json::from_slice::<Vec<PerformanceAlert>>(&value) {
                    let user_id = String::from_utf8_lossy(&key["alerts:".len()..]).to_string();
                    recent.insert(user_id, parsed);
                }
            }
            info!(
                users = recent.len(),
                "pipeline restored activity and alerts from persistent store"
            );
        });
    }

    async fn persist_activity(&self, activity: &UserActivity) {
        let Some(db) = &self.store else { return };
        if let Ok(bytes) = serde_json::to_vec(activity) {
            let key = format!("activity:{}", activity.user_id);
            let _ = db.insert(key, bytes);
        }
    }

    async fn persist_alerts(&self, user_id: &UserId, alerts: &[PerformanceAlert]) {
        let Some(db) = &self.store else { return };
        if let Ok(bytes) = serde_json::to_vec(alerts) {
            let key = format!("alerts:{user_id}");
            let _ = db.insert(key, bytes);
        }
    }

    /// NEVER raises. Unseen users get an `empty_fallback`
    /// snapshot rather than an error.
    pub async fn get_enrichment(&self, user_id: &str) -> PipelineSnapshot {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(user_id) {
            Some(entry) => entry.snapshot.clone(),
            None => PipelineSnapshot::empty_fallback(),
        }
    }

    /// Updates `last_interaction_at`; may trigger an opportunistic refresh
    /// when priority is high and the user isn't already refreshing.
    pub async fn register_interaction(self: &Arc<Self>, user_id: &str) {
        let now = Utc::now();
        let mut activity = self.activity.write().await;
        let entry = activity
            .entry(user_id.to_string())
            .or_insert_with(|| UserActivity::new(user_id.to_string()));
        entry.last_interaction_at = now;
        entry.refresh_priority = entry.derive_priority(now);
        let snapshot = entry.clone();
        drop(activity);
        self.persist_activity(&snapshot).await;

        if snapshot.refresh_priority == RefreshPriority::High {
            let already_refreshing = self.refreshing.read().await.contains(user_id);
            if !already_refreshing {
                let pipeline = Arc::clone(self);
                let user_id = user_id.to_string();
                tokio::spawn(async move {
                    pipeline.refresh_user(&user_id).await;
                });
            }
        }
    }

    /// Immediate refresh bypassing `max_concurrent_refreshes`.
    pub async fn force_refresh(self: &Arc<Self>, user_id: &str) -> bool {
        self.refresh_user_inner(user_id, true).await
    }

    async fn refresh_user(self: &Arc<Self>, user_id: &str) -> bool {
        self.refresh_user_inner(user_id, false).await
    }

    async fn refresh_user_inner(self: &Arc<Self>, user_id: &str, bypass_concurrency_limit: bool) -> bool {
        let _permit = if bypass_concurrency_limit {
            None
        } else {
            match self.refresh_permits.try_acquire() {
                Ok(permit) => Some(permit),
                Err(_) => return false,
            }
        };

        self.refreshing.write().await.insert(user_id.to_string());
        let result = self.run_refresh_state_machine(user_id).await;
        self.refreshing.write().await.remove(user_id);
        result
    }

    /// The per-user refresh state machine: try the primary analytics
    /// source, fall back to the secondary on failure, and update activity
    /// bookkeeping accordingly.
    async fn run_refresh_state_machine(&self, user_id: &str) -> bool {
        let now = Utc::now();

        let primary = self.source.comprehensive_summary(user_id).await;
        let (raw, quality) = match primary {
            Ok(raw) => (Some(raw), ContextQuality::Complete),
            Err(e) => {
                debug!(user_id, error = %e, "primary analytics source failed, trying secondary");
                match self.source.basic_summary(user_id).await {
                    Ok(raw) => (Some(raw), ContextQuality::BasicFallback),
                    Err(e2) => {
                        warn!(user_id, error = %e2, "secondary analytics source also failed");
                        (None, ContextQuality::EmptyFallback)
                    }
                }
            }
        };

        let mut activity = self.activity.write().await;
        let entry = activity
            .entry(user_id.to_string())
            .or_insert_with(|| UserActivity::new(user_id.to_string()));

        let Some(raw) = raw else {
            entry.consecutive_errors += 1;
            if entry.consecutive_errors >= 3 {
                entry.refresh_priority = RefreshPriority::Low;
            }
            let snapshot = entry.clone();
            drop(activity);
            self.persist_activity(&snapshot).await;
            return false;
        };

        entry.consecutive_errors = 0;
        if entry.refresh_priority == RefreshPriority::Low {
            entry.refresh_priority = entry.derive_priority(now).max(RefreshPriority::Normal);
        }
        entry.last_refresh_at = Some(now);
        let snapshot_of_activity = entry.clone();
        drop(activity);
        self.persist_activity(&snapshot_of_activity).await;

        let mut snapshots = self.snapshots.write().await;
        let previous_metrics = snapshots.get(user_id).map(|e| e.snapshot.key_metrics.clone());
        let recent_alerts = self.recent_alerts.read().await.get(user_id).cloned().unwrap_or_default();

        let data_freshness = match quality {
            ContextQuality::Complete => DataFreshness::RealTime,
            ContextQuality::BasicFallback => DataFreshness::Degraded,
            ContextQuality::EmptyFallback => DataFreshness::Unavailable,
        };

        let new_snapshot = PipelineSnapshot {
            last_updated: Some(now),
            key_metrics: raw.key_metrics,
            performance_insights: raw.performance_insights,
            recent_alerts,
            data_freshness,
            context_quality: quality,
        };

        snapshots.insert(
            user_id.to_string(),
            SnapshotEntry { snapshot: new_snapshot, previous_metrics },
        );
        true
    }

    /// Refresh scheduler loop, period 60s.
    async fn refresh_scheduler_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.refresh_scheduler_cycle().await,
            }
        }
    }

    async fn refresh_scheduler_cycle(self: &Arc<Self>) {
        let now = Utc::now();
        let due: Vec<String> = {
            let activity = self.activity.read().await;
            activity
                .values()
                .filter(|a| a.due_for_refresh(now, &self.config))
                .map(|a| a.user_id.clone())
                .collect()
        };

        let refreshing = self.refreshing.read().await;
        let due: Vec<String> = due.into_iter().filter(|u| !refreshing.contains(u)).collect();
        drop(refreshing);

        debug!(due = due.len(), "refresh scheduler cycle");
        for user_id in due {
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                pipeline.refresh_user(&user_id).await;
            });
        }
    }

    /// Change detector loop, period 5min.
    async fn change_detector_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.change_detector_cycle().await,
            }
        }
    }

    async fn change_detector_cycle(&self) {
        let now = Utc::now();
        let candidates: Vec<(UserId, HashMap<String, f64>, HashMap<String, f64>)> = {
            let snapshots = self.snapshots.read().await;
            snapshots
                .iter()
                .filter_map(|(user_id, entry)| {
                    let previous = entry.previous_metrics.clone()?;
                    Some((user_id.clone(), entry.snapshot.key_metrics.clone(), previous))
                })
                .collect()
        };

        for (user_id, current, previous) in candidates {
            let mut new_alerts = Vec::new();
            for (metric, current_value) in &current {
                let Some(previous_value) = previous.get(metric) else { continue };
                if *previous_value == 0.0 {
                    continue;
                }
                let change_pct = (current_value - previous_value) / previous_value * 100.0;
                if change_pct.abs() < self.config.change_threshold_pct {
                    continue;
                }

                let direction = if change_pct >= 0.0 { Direction::Up } else { Direction::Down };
                let significance = if change_pct.abs() >= self.config.alert_threshold_pct {
                    Significance::High
                } else {
                    Significance::Medium
                };

                let mut dedup = self.alerts.lock().await;
                if !dedup.should_emit(&user_id, metric, direction, now) {
                    continue;
                }
                drop(dedup);

                let kind = if change_pct >= 0.0 { AlertKind::Spike } else { AlertKind::Drop };
                new_alerts.push(PerformanceAlert {
                    user_id: user_id.clone(),
                    kind,
                    metric: metric.clone(),
                    current: *current_value,
                    previous: *previous_value,
                    change_pct,
                    significance,
                    message: format!("{metric} changed {change_pct:.1}%"),
                    created_at: now,
                });
            }

            if let Some(net_subscriber_change) = current.get("net_subscriber_change") {
                if *net_subscriber_change >= self.config.milestone_subscriber_threshold {
                    let mut dedup = self.alerts.lock().await;
                    let should_emit = dedup.should_emit(&user_id, "net_subscriber_change", Direction::Up, now);
                    drop(dedup);
                    if should_emit {
                        new_alerts.push(PerformanceAlert {
                            user_id: user_id.clone(),
                            kind: AlertKind::Milestone,
                            metric: "subscribers".to_string(),
                            current: *net_subscriber_change,
                            previous: 0.0,
                            change_pct: 0.0,
                            significance: Significance::High,
                            message: format!("Milestone: +{net_subscriber_change:.0} subscribers this week!"),
                            created_at: now,
                        });
                    }
                }
            }

            if new_alerts.is_empty() {
                continue;
            }

            info!(user_id = %user_id, count = new_alerts.len(), "emitted performance alerts");
            let mut recent = self.recent_alerts.write().await;
            let entry = recent.entry(user_id.clone()).or_default();
            entry.extend(new_alerts);
            let snapshot = entry.clone();
            drop(recent);
            self.persist_alerts(&user_id, &snapshot).await;
        }
    }

    /// Cache cleanup loop, period 1h.
    async fn cache_cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.cache_cleanup_cycle().await,
            }
        }
    }

    async fn cache_cleanup_cycle(&self) {
        let now = Utc::now();
        let window = chrono::Duration::days(7);

        let mut recent = self.recent_alerts.write().await;
        for alerts in recent.values_mut() {
            alerts.retain(|a| now - a.created_at < window);
        }
        recent.retain(|_, alerts| !alerts.is_empty());
        let snapshot: Vec<(UserId, Vec<PerformanceAlert>)> =
            recent.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(recent);
        for (user_id, alerts) in snapshot {
            self.persist_alerts(&user_id, &alerts).await;
        }

        self.alerts.lock().await.purge_older_than(chrono::Duration::hours(24), now);
        debug!("pipeline cache cleanup cycle complete");
    }
}

impl RefreshPriority {
    fn max(self, other: RefreshPriority) -> RefreshPriority {
        use RefreshPriority::*;
        match (self, other) {
            (High, _) | (_, High) => High,
            (Normal, _) | (_, Normal) => Normal,
            (Low, Low) => Low,
        }
    }
}
