use crate::model::ActiveCancellation;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Bounded, insertion-ordered store of recent cancellations. One writer
/// (the enrichment task), many readers; readers snapshot under a short
/// shared lock, the writer holds the exclusive lock only across the
/// insert-plus-evict step.
pub struct CancellationCache {
    entries: RwLock<VecDeque<ActiveCancellation>>,
    max_entries: usize,
    max_age: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteEntry {
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub enriched: usize,
    pub non_enriched: usize,
    pub enrichment_rate: f64,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

impl CancellationCache {
    pub fn new(max_entries: usize, max_age: Duration) -> CancellationCache {
        CancellationCache {
            entries: RwLock::new(VecDeque::with_capacity(max_entries)),
            max_entries,
            max_age,
        }
    }

    fn read(&self) -> RwLockReadGuard<VecDeque<ActiveCancellation>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<VecDeque<ActiveCancellation>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one cancellation, evicting oldest-first once the bound is
    /// reached. `observed_at` is clamped so it never runs backwards
    /// relative to what is already stored.
    pub fn insert(&self, mut cancellation: ActiveCancellation) {
        let mut entries = self.write();
        if let Some(newest) = entries.back() {
            if cancellation.observed_at < newest.observed_at {
                cancellation.observed_at = newest.observed_at;
            }
        }
        entries.push_back(cancellation);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    /// Newest first, up to `limit`, optionally only entries observed
    /// strictly after `since`.
    pub fn recent(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<ActiveCancellation> {
        self.read()
            .iter()
            .rev()
            .filter(|entry| since.map(|since| entry.observed_at > since).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn enriched(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<ActiveCancellation> {
        self.read()
            .iter()
            .rev()
            .filter(|entry| entry.darwin_enriched)
            .filter(|entry| since.map(|since| entry.observed_at > since).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Cancellation counts per (origin, destination) over the current
    /// contents. Only enriched rows know their route, so only they count.
    pub fn by_route(&self) -> HashMap<(String, String), RouteEntry> {
        let entries = self.read();
        let mut routes: HashMap<(String, String), RouteEntry> = HashMap::new();
        for entry in entries.iter() {
            let (Some(origin), Some(destination)) = (&entry.origin, &entry.destination) else {
                continue;
            };
            let route = routes
                .entry((origin.tiploc.clone(), destination.tiploc.clone()))
                .or_insert(RouteEntry {
                    count: 0,
                    last_seen: entry.observed_at,
                });
            route.count += 1;
            if entry.observed_at > route.last_seen {
                route.last_seen = entry.observed_at;
            }
        }
        routes
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.read();
        let total = entries.len();
        let enriched = entries.iter().filter(|entry| entry.darwin_enriched).count();
        let enrichment_rate = if total > 0 {
            (enriched as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        CacheStats {
            total,
            enriched,
            non_enriched: total - enriched,
            enrichment_rate,
            window_start: entries.front().map(|entry| entry.observed_at),
            window_end: entries.back().map(|entry| entry.observed_at),
        }
    }

    /// Drop entries older than the given age. Returns how many went.
    pub fn purge_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now() - age;
        let mut entries = self.write();
        let before = entries.len();
        while entries
            .front()
            .map(|entry| entry.observed_at < cutoff)
            .unwrap_or(false)
        {
            entries.pop_front();
        }
        before - entries.len()
    }

    /// The retention sweep the pipeline runs periodically.
    pub fn purge_expired(&self) -> usize {
        self.purge_older_than(self.max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceDestination, ServiceOrigin};
    use chrono::NaiveTime;

    fn cancellation(rid: &str, enriched: bool, at: DateTime<Utc>) -> ActiveCancellation {
        let (origin, destination) = if enriched {
            (
                Some(ServiceOrigin {
                    tiploc: "EUSTON".to_string(),
                    station_name: Some("London Euston".to_string()),
                    scheduled_departure: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                    platform: None,
                }),
                Some(ServiceDestination {
                    tiploc: "BHAMNS".to_string(),
                    station_name: None,
                    scheduled_arrival: NaiveTime::from_hms_opt(19, 35, 0).unwrap(),
                    platform: None,
                }),
            )
        } else {
            (None, None)
        };
        ActiveCancellation {
            rid: rid.to_string(),
            train_service_code: None,
            reason_code: Some("104".to_string()),
            reason_text: Some("Signal failure".to_string()),
            observed_at: at,
            darwin_enriched: enriched,
            train_uid: enriched.then(|| "C12345".to_string()),
            headcode: None,
            operator_code: None,
            service_date: None,
            origin,
            destination,
            calling_points: Vec::new(),
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_764_547_200 + seconds, 0).unwrap()
    }

    #[test]
    fn inserted_cancellations_are_immediately_visible() {
        let cache = CancellationCache::new(10, Duration::hours(24));
        let entry = cancellation("r1", false, at(0));
        cache.insert(entry.clone());
        assert!(cache.recent(usize::MAX, None).contains(&entry));
    }

    #[test]
    fn eviction_is_oldest_first_at_capacity() {
        let cache = CancellationCache::new(3, Duration::hours(24));
        for (index, rid) in ["c1", "c2", "c3", "c4"].iter().enumerate() {
            cache.insert(cancellation(rid, false, at(index as i64)));
        }
        let rids = cache
            .recent(10, None)
            .iter()
            .map(|entry| entry.rid.clone())
            .collect::<Vec<String>>();
        assert_eq!(rids, vec!["c4", "c3", "c2"]);
        assert_eq!(cache.stats().total, 3);
    }

    #[test]
    fn since_filters_and_limit_caps() {
        let cache = CancellationCache::new(10, Duration::hours(24));
        for i in 0..5 {
            cache.insert(cancellation(&format!("r{}", i), false, at(i)));
        }
        let newer = cache.recent(10, Some(at(2)));
        assert_eq!(newer.len(), 2);
        assert_eq!(newer[0].rid, "r4");
        assert_eq!(cache.recent(2, None).len(), 2);
    }

    #[test]
    fn enriched_view_filters_out_basic_rows() {
        let cache = CancellationCache::new(10, Duration::hours(24));
        cache.insert(cancellation("plain", false, at(0)));
        cache.insert(cancellation("rich", true, at(1)));
        let enriched = cache.enriched(10, None);
        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].rid, "rich");
    }

    #[test]
    fn by_route_counts_only_enriched_and_stats_balance() {
        let cache = CancellationCache::new(10, Duration::hours(24));
        cache.insert(cancellation("a", true, at(0)));
        cache.insert(cancellation("b", true, at(5)));
        cache.insert(cancellation("c", false, at(9)));

        let routes = cache.by_route();
        let key = ("EUSTON".to_string(), "BHAMNS".to_string());
        assert_eq!(routes[&key].count, 2);
        assert_eq!(routes[&key].last_seen, at(5));

        let stats = cache.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.enriched + stats.non_enriched, stats.total);
        let route_total: u64 = routes.values().map(|route| route.count).sum();
        assert!(route_total <= stats.enriched as u64);
        assert_eq!(stats.window_start, Some(at(0)));
        assert_eq!(stats.window_end, Some(at(9)));
        assert!((stats.enrichment_rate - 66.7).abs() < 0.01);
    }

    #[test]
    fn observed_at_never_runs_backwards() {
        let cache = CancellationCache::new(10, Duration::hours(24));
        cache.insert(cancellation("first", false, at(100)));
        cache.insert(cancellation("second", false, at(50)));
        let entries = cache.recent(10, None);
        assert_eq!(entries[0].rid, "second");
        assert_eq!(entries[0].observed_at, at(100));
    }

    #[test]
    fn purge_removes_old_entries() {
        let cache = CancellationCache::new(10, Duration::hours(24));
        cache.insert(cancellation("old", false, Utc::now() - Duration::hours(30)));
        cache.insert(cancellation("new", false, Utc::now()));
        let removed = cache.purge_expired();
        assert_eq!(removed, 1);
        let remaining = cache.recent(10, None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].rid, "new");
    }

    #[test]
    fn readers_survive_a_writing_thread() {
        use std::sync::Arc;
        let cache = Arc::new(CancellationCache::new(50, Duration::hours(24)));
        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    cache.insert(cancellation(&format!("w{}", i), i % 2 == 0, at(i)));
                }
            })
        };
        for _ in 0..50 {
            let stats = cache.stats();
            assert_eq!(stats.enriched + stats.non_enriched, stats.total);
            assert!(stats.total <= 50);
        }
        writer.join().unwrap();
        assert_eq!(cache.stats().total, 50);
    }
}
