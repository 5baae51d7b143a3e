//! Per-domain TTL caches.
//!
//! Each domain gets its own `DashMap` keyed by resort id. Entries older than
//! the domain TTL are never served. Every write also records the value's
//! capture time in a same-day history list, which is pruned to the current
//! local calendar day on each write.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use common::config::CacheConfig;
use common::{Captured, Domain, LiftStatusSnapshot, Result, TrafficSnapshot, WeatherSnapshot};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Upper bound on history entries kept for one key within a day.
pub const MAX_HISTORY_PER_DAY: usize = 288;

/// A cached value with its write time and same-day capture history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub valid: usize,
    pub expired: usize,
    pub total: usize,
}

/// On-disk form of one domain cache.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheSnapshot<T> {
    pub domain: Domain,
    pub taken_at: DateTime<Utc>,
    pub entries: HashMap<String, CacheEntry<T>>,
}

/// Thread-safe cache for one domain.
#[derive(Debug)]
pub struct TtlCache<T> {
    domain: Domain,
    ttl: Duration,
    offset: FixedOffset,
    entries: DashMap<String, CacheEntry<T>>,
}

impl<T> TtlCache<T>
where
    T: Clone + Captured,
{
    pub fn new(domain: Domain, ttl_secs: u64, offset: FixedOffset) -> Self {
        Self {
            domain,
            ttl: Duration::seconds(ttl_secs.min(i64::MAX as u64 / 1000) as i64),
            offset,
            entries: DashMap::new(),
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    fn is_expired(&self, entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
        now - entry.stored_at > self.ttl
    }

    fn same_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        a.with_timezone(&self.offset).date_naive() == b.with_timezone(&self.offset).date_naive()
    }

    pub fn set(&self, key: &str, value: T) {
        self.set_at(key, value, Utc::now());
    }

    /// Store `value` and append its capture time to the key's history,
    /// dropping history from earlier local days. A capture time from an
    /// earlier local day updates the value but is not recorded.
    pub fn set_at(&self, key: &str, value: T, now: DateTime<Utc>) {
        let captured = value.captured_at().unwrap_or(now);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: value.clone(),
                stored_at: now,
                history: Vec::new(),
            });

        entry.value = value;
        entry.stored_at = now;
        entry.history.retain(|ts| self.same_day(*ts, now));
        if self.same_day(captured, now) {
            entry.history.push(captured);
        }
        if entry.history.len() > MAX_HISTORY_PER_DAY {
            let excess = entry.history.len() - MAX_HISTORY_PER_DAY;
            entry.history.drain(..excess);
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        self.entry_at(key, now).map(|e| e.value)
    }

    /// The whole entry, if still within TTL. Expired entries are evicted.
    pub fn entry_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<T>> {
        {
            let entry = self.entries.get(key)?;
            if !self.is_expired(&entry, now) {
                return Some(entry.clone());
            }
        }
        // The read guard must be gone before removing from the same shard.
        self.entries.remove_if(key, |_, e| self.is_expired(e, now));
        None
    }

    /// When `key` was last written, if the entry is still within TTL.
    pub fn stored_at(&self, key: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .get(key)
            .filter(|e| !self.is_expired(e, now))
            .map(|e| e.stored_at)
    }

    /// Capture times recorded for `key` during the current local day.
    pub fn get_history(&self, key: &str) -> Vec<DateTime<Utc>> {
        self.get_history_at(key, Utc::now())
    }

    pub fn get_history_at(&self, key: &str, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.entries
            .get(key)
            .map(|e| {
                e.history
                    .iter()
                    .copied()
                    .filter(|ts| self.same_day(*ts, now))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evict expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !self.is_expired(e, now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("{} cache: evicted {} expired entries", self.domain, removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in self.entries.iter() {
            stats.total += 1;
            if self.is_expired(entry.value(), now) {
                stats.expired += 1;
            } else {
                stats.valid += 1;
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<T> TtlCache<T>
where
    T: Clone + Captured + Serialize + DeserializeOwned,
{
    pub fn snapshot(&self) -> CacheSnapshot<T> {
        CacheSnapshot {
            domain: self.domain,
            taken_at: Utc::now(),
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Load entries from a snapshot. Expired entries and entries older than
    /// what is already cached are skipped. Returns how many were loaded.
    pub fn restore(&self, snapshot: CacheSnapshot<T>, now: DateTime<Utc>) -> usize {
        let mut loaded = 0;
        for (key, mut entry) in snapshot.entries {
            if self.is_expired(&entry, now) {
                continue;
            }
            entry.history.retain(|ts| self.same_day(*ts, now));
            let newer_present = self
                .entries
                .get(&key)
                .is_some_and(|existing| existing.stored_at >= entry.stored_at);
            if newer_present {
                continue;
            }
            self.entries.insert(key, entry);
            loaded += 1;
        }
        loaded
    }

    /// Write the cache as JSON. Goes through a temp file so a crash never
    /// leaves a truncated snapshot behind.
    pub fn save_to(&self, path: &Path) -> Result<usize> {
        let snapshot = self.snapshot();
        let count = snapshot.entries.len();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(count)
    }

    /// Restore from a file written by `save_to`. A missing file loads nothing.
    pub fn load_from(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read(path)?;
        let snapshot: CacheSnapshot<T> = serde_json::from_slice(&raw)?;
        Ok(self.restore(snapshot, Utc::now()))
    }
}

/// The three domain caches, shared by the orchestrator, fusion and the
/// scheduler. These maps are the only shared mutable state.
#[derive(Debug)]
pub struct Caches {
    pub lift: TtlCache<LiftStatusSnapshot>,
    pub weather: TtlCache<WeatherSnapshot>,
    pub traffic: TtlCache<TrafficSnapshot>,
}

impl Caches {
    pub fn new(config: &CacheConfig, utc_offset_minutes: i32) -> Self {
        let offset = utc_offset(utc_offset_minutes);
        Self {
            lift: TtlCache::new(Domain::Lift, config.lift.ttl_secs, offset),
            weather: TtlCache::new(Domain::Weather, config.weather.ttl_secs, offset),
            traffic: TtlCache::new(Domain::Traffic, config.traffic.ttl_secs, offset),
        }
    }

    pub fn stats(&self, domain: Domain) -> CacheStats {
        match domain {
            Domain::Lift => self.lift.stats(),
            Domain::Weather => self.weather.stats(),
            Domain::Traffic => self.traffic.stats(),
        }
    }

    pub fn cleanup_all(&self) -> usize {
        self.lift.cleanup() + self.weather.cleanup() + self.traffic.cleanup()
    }

    pub fn save_all(&self, dir: &Path) -> Result<usize> {
        let mut written = 0;
        written += self.lift.save_to(&snapshot_path(dir, Domain::Lift))?;
        written += self.weather.save_to(&snapshot_path(dir, Domain::Weather))?;
        written += self.traffic.save_to(&snapshot_path(dir, Domain::Traffic))?;
        debug!("Saved {} cache entries to {}", written, dir.display());
        Ok(written)
    }

    pub fn restore_all(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        loaded += self.lift.load_from(&snapshot_path(dir, Domain::Lift))?;
        loaded += self.weather.load_from(&snapshot_path(dir, Domain::Weather))?;
        loaded += self.traffic.load_from(&snapshot_path(dir, Domain::Traffic))?;
        info!("Restored {} cache entries from {}", loaded, dir.display());
        Ok(loaded)
    }
}

pub fn snapshot_path(dir: &Path, domain: Domain) -> std::path::PathBuf {
    dir.join(format!("{}-cache.json", domain.as_str()))
}

/// Fixed offset for the resorts' local day. Out-of-range values fall back
/// to UTC.
pub fn utc_offset(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}
