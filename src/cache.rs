use crate::types::GeocodeResult;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Session-local reverse-geocode cache.
///
/// Keys are coordinates rounded to 6 decimals (about 11 cm), so nearby points
/// share an entry. Expiry is whole-cache: once the cache is older than its
/// validity window every entry is dropped at once.
#[derive(Debug, Clone)]
pub struct GeocodeCache {
    entries: HashMap<String, GeocodeResult>,
    built_at: DateTime<Utc>,
    duration: Duration,
}

impl GeocodeCache {
    pub fn new(duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            entries: HashMap::new(),
            built_at: now,
            duration,
        }
    }

    pub fn with_hours(hours: u32, now: DateTime<Utc>) -> Self {
        Self::new(Duration::hours(i64::from(hours)), now)
    }

    pub fn get(&self, lat: f64, lon: f64) -> Option<&GeocodeResult> {
        self.entries.get(&cache_key(lat, lon))
    }

    pub fn put(&mut self, lat: f64, lon: f64, result: GeocodeResult) {
        self.entries.insert(cache_key(lat, lon), result);
    }

    /// Clears everything when the cache has outlived its window. Returns
    /// whether an eviction happened.
    pub fn evict_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.built_at <= self.duration {
            return false;
        }
        let dropped = self.entries.len();
        self.entries.clear();
        self.built_at = now;
        tracing::info!(dropped, "geocode cache expired");
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn cache_key(lat: f64, lon: f64) -> String {
    format!("{lat:.6},{lon:.6}")
}
