//! TTL cache for dashboard aggregates.
//!
//! An explicit cache handle injected via `web::Data` rather than a
//! process-wide singleton. Entries expire after a fixed TTL; the timer
//! handlers additionally evict the unparameterized dashboard key and the
//! per-project key eagerly on every start/stop. Range-parameterized dashboard
//! entries are left to expire naturally, so they can serve data up to one TTL
//! stale after a timer mutation. That window is an accepted tradeoff, matching
//! the eviction set of the timer operations.

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DASHBOARD_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    payload: Value,
    expires_at: Instant,
}

pub struct DashboardCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DashboardCache {
    pub fn new(ttl: Duration) -> Self {
        DashboardCache {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A poisoned lock only means a panic mid-insert; the map itself is
        // still usable.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the stored payload, or `None` on miss or expiry. Expired
    /// entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores a payload under the configured TTL, last writer wins.
    pub fn set(&self, key: &str, payload: Value) {
        let entry = CacheEntry {
            payload,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries().insert(key.to_string(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.entries().remove(key);
    }
}

impl Default for DashboardCache {
    fn default() -> Self {
        DashboardCache::new(DASHBOARD_CACHE_TTL)
    }
}

/// Cache key for a dashboard result, one per exact (start_date, end_date)
/// pair. Absent bounds render as "-" so the unfiltered key is stable.
pub fn dashboard_key(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> String {
    let fmt = |date: Option<NaiveDate>| match date {
        Some(d) => d.format("%Y-%m-%d").to_string(),
        None => "-".to_string(),
    };
    format!("dashboard_metrics_{}_{}", fmt(start_date), fmt(end_date))
}

/// Cache key for a single project's derived metrics.
pub fn project_metrics_key(project_id: uuid::Uuid) -> String {
    format!("project_{}_metrics", project_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_returns_stored_payload_before_ttl() {
        let cache = DashboardCache::new(Duration::from_secs(60));
        cache.set("k", json!({"total_spent_time": "01:00"}));
        assert_eq!(cache.get("k"), Some(json!({"total_spent_time": "01:00"})));
    }

    #[test]
    fn expired_entries_miss_and_are_dropped() {
        let cache = DashboardCache::new(Duration::from_secs(0));
        cache.set("k", json!(1));
        assert_eq!(cache.get("k"), None);
        // removed, not just hidden
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn delete_evicts_eagerly() {
        let cache = DashboardCache::new(Duration::from_secs(60));
        cache.set("k", json!(1));
        cache.delete("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn set_overwrites_last_writer_wins() {
        let cache = DashboardCache::new(Duration::from_secs(60));
        cache.set("k", json!(1));
        cache.set("k", json!(2));
        assert_eq!(cache.get("k"), Some(json!(2)));
    }

    #[test]
    fn dashboard_keys_are_stable_per_range() {
        let start = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 8, 30).unwrap();
        assert_eq!(dashboard_key(None, None), "dashboard_metrics_-_-");
        assert_eq!(
            dashboard_key(Some(start), None),
            "dashboard_metrics_2025-08-01_-"
        );
        assert_eq!(
            dashboard_key(Some(start), Some(end)),
            "dashboard_metrics_2025-08-01_2025-08-30"
        );
    }

    #[test]
    fn project_key_embeds_the_id() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            project_metrics_key(id),
            format!("project_{}_metrics", uuid::Uuid::nil())
        );
    }
}
