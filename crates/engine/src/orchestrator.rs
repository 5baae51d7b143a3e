//! Concurrent, bounded refresh of lift, weather and traffic data.
//!
//! Every outbound call goes through one shared semaphore and one deadline.
//! Failures are isolated per resort: a timeout, adapter error or invalid
//! snapshot only affects that resort's outcome and never touches the cache.
//! Writes are guarded by per-(domain, resort) request tokens so an older
//! call can never overwrite a result from a newer one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::{AdapterSpec, AppConfig, CacheConfig, OriginConfig, ResortConfig, MAX_CONCURRENCY};
use common::{Domain, Error, FailureKind, Result};
use dashmap::DashMap;
use lift_adapters::AdapterRegistry;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use traffic_client::{Destination, TrafficSource};
use weather_client::WeatherSource;

use crate::cache::Caches;
use crate::validate::ensure_valid;

/// Result of refreshing one resort in one domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// A new value was validated and cached.
    Updated,
    /// The cached value was recent enough; no call was made.
    Cached,
    /// Nothing is configured to serve this resort in this domain.
    NoAdapter,
    /// The upstream answered but had nothing for this resort.
    NoData,
    /// A newer call for the same resort committed first; this result was dropped.
    Superseded,
    Failed { kind: FailureKind, message: String },
}

impl RefreshOutcome {
    fn from_error(err: &Error) -> Self {
        Self::Failed {
            kind: err.failure_kind().unwrap_or(FailureKind::Adapter),
            message: err.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResortOutcome {
    pub resort_id: String,
    #[serde(flatten)]
    pub outcome: RefreshOutcome,
}

/// Per-resort outcomes of one domain refresh, in config order.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub domain: Domain,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcomes: Vec<ResortOutcome>,
}

impl RefreshReport {
    pub fn outcome(&self, resort_id: &str) -> Option<&RefreshOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.resort_id == resort_id)
            .map(|o| &o.outcome)
    }

    pub fn count(&self, pred: impl Fn(&RefreshOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.outcome)).count()
    }

    pub fn updated(&self) -> usize {
        self.count(|o| *o == RefreshOutcome::Updated)
    }

    pub fn failed(&self) -> usize {
        self.count(RefreshOutcome::is_failure)
    }

    pub fn cached(&self) -> usize {
        self.count(|o| *o == RefreshOutcome::Cached)
    }

    pub fn no_adapter(&self) -> usize {
        self.count(|o| *o == RefreshOutcome::NoAdapter)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResortOutcome> {
        self.outcomes.iter().filter(|o| o.outcome.is_failure())
    }
}

/// Last refresh result for one (domain, resort).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshHealth {
    pub ok: bool,
    pub last_error: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Per-resort health table, read by fusion to report resort status.
#[derive(Debug, Default)]
pub struct HealthBook {
    entries: DashMap<(Domain, String), RefreshHealth>,
}

impl HealthBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ok(&self, domain: Domain, resort_id: &str, at: DateTime<Utc>) {
        self.entries.insert(
            (domain, resort_id.to_string()),
            RefreshHealth {
                ok: true,
                last_error: None,
                attempted_at: at,
                last_success_at: Some(at),
            },
        );
    }

    pub fn record_error(&self, domain: Domain, resort_id: &str, message: &str, at: DateTime<Utc>) {
        let mut entry = self
            .entries
            .entry((domain, resort_id.to_string()))
            .or_insert_with(|| RefreshHealth {
                ok: false,
                last_error: None,
                attempted_at: at,
                last_success_at: None,
            });
        entry.ok = false;
        entry.last_error = Some(message.to_string());
        entry.attempted_at = at;
    }

    pub fn get(&self, domain: Domain, resort_id: &str) -> Option<RefreshHealth> {
        self.entries
            .get(&(domain, resort_id.to_string()))
            .map(|h| h.clone())
    }
}

/// Monotonic request tokens. A result commits only if no newer token for
/// the same (domain, resort) has committed already.
#[derive(Debug, Default)]
struct CommitTokens {
    issued: AtomicU64,
    committed: DashMap<(Domain, String), u64>,
}

impl CommitTokens {
    fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn commit(&self, domain: Domain, resort_id: &str, token: u64, write: impl FnOnce()) -> bool {
        let mut latest = self
            .committed
            .entry((domain, resort_id.to_string()))
            .or_insert(0);
        if token < *latest {
            return false;
        }
        *latest = token;
        write();
        true
    }
}

/// Fans refreshes out over a bounded pool and writes validated results
/// into the shared caches.
pub struct FetchOrchestrator {
    resorts: Vec<ResortConfig>,
    origin: OriginConfig,
    cache_config: CacheConfig,
    registry: AdapterRegistry,
    weather: Option<Arc<dyn WeatherSource>>,
    traffic: Option<Arc<dyn TrafficSource>>,
    caches: Arc<Caches>,
    health: Arc<HealthBook>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    deadline: Duration,
    jitter_ms: u64,
    tokens: CommitTokens,
}

impl FetchOrchestrator {
    /// Fails only on misconfiguration: a pool size outside
    /// `1..=MAX_CONCURRENCY`, a zero deadline, or a resort whose adapter
    /// entry has no registered adapter.
    pub fn new(config: &AppConfig, registry: AdapterRegistry, caches: Arc<Caches>) -> Result<Self> {
        let concurrency = config.fetch.concurrency;
        if concurrency == 0 || concurrency > MAX_CONCURRENCY {
            return Err(Error::Config(format!(
                "fetch.concurrency must be in 1..={MAX_CONCURRENCY}, got {concurrency}"
            )));
        }
        if config.fetch.deadline_secs == 0 {
            return Err(Error::Config("fetch.deadline_secs must be > 0".into()));
        }

        let unregistered: Vec<&str> = config
            .resorts
            .iter()
            .filter(|r| r.adapter != AdapterSpec::None && !registry.contains(&r.id))
            .map(|r| r.id.as_str())
            .collect();
        if !unregistered.is_empty() {
            return Err(Error::Config(format!(
                "resorts configured with an adapter but none registered: {}",
                unregistered.join(", ")
            )));
        }

        Ok(Self {
            resorts: config.resorts.clone(),
            origin: config.origin.clone(),
            cache_config: config.cache.clone(),
            registry,
            weather: None,
            traffic: None,
            caches,
            health: Arc::new(HealthBook::new()),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            deadline: Duration::from_secs(config.fetch.deadline_secs),
            jitter_ms: config.fetch.jitter_ms,
            tokens: CommitTokens::default(),
        })
    }

    pub fn with_weather(mut self, source: Arc<dyn WeatherSource>) -> Self {
        self.weather = Some(source);
        self
    }

    pub fn with_traffic(mut self, source: Arc<dyn TrafficSource>) -> Self {
        self.traffic = Some(source);
        self
    }

    pub fn caches(&self) -> &Arc<Caches> {
        &self.caches
    }

    pub fn health(&self) -> Arc<HealthBook> {
        Arc::clone(&self.health)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    // ── Lift status (the primary domain) ──────────────────────────────

    /// Refresh one resort's lift status unless the cached value is recent.
    pub async fn refresh_one(&self, resort_id: &str) -> RefreshOutcome {
        self.refresh_resort(Domain::Lift, resort_id, false).await
    }

    /// Refresh one resort's lift status, bypassing the cache.
    pub async fn force_one(&self, resort_id: &str) -> RefreshOutcome {
        self.refresh_resort(Domain::Lift, resort_id, true).await
    }

    pub async fn refresh_all(self: &Arc<Self>) -> RefreshReport {
        self.refresh_domain(Domain::Lift, false).await
    }

    pub async fn refresh_weather_all(self: &Arc<Self>, force: bool) -> RefreshReport {
        self.refresh_domain(Domain::Weather, force).await
    }

    pub async fn refresh_traffic_all(self: &Arc<Self>, force: bool) -> RefreshReport {
        self.refresh_domain(Domain::Traffic, force).await
    }

    /// Refresh one resort in one domain.
    pub async fn refresh_resort(&self, domain: Domain, resort_id: &str, force: bool) -> RefreshOutcome {
        let Some(resort) = self.resorts.iter().find(|r| r.id == resort_id) else {
            return RefreshOutcome::NoAdapter;
        };
        match domain {
            Domain::Lift => self.lift_once(resort, force).await,
            Domain::Weather => self.weather_once(resort, force).await,
            Domain::Traffic => {
                if !force && self.is_reusable(Domain::Traffic, &resort.id, Utc::now()) {
                    return RefreshOutcome::Cached;
                }
                self.traffic_batch(&[resort])
                    .await
                    .pop()
                    .unwrap_or(RefreshOutcome::NoData)
            }
        }
    }

    /// Refresh one resort in every domain concurrently.
    pub async fn refresh_resort_everywhere(
        &self,
        resort_id: &str,
        force: bool,
    ) -> Vec<(Domain, RefreshOutcome)> {
        let (lift, weather, traffic) = tokio::join!(
            self.refresh_resort(Domain::Lift, resort_id, force),
            self.refresh_resort(Domain::Weather, resort_id, force),
            self.refresh_resort(Domain::Traffic, resort_id, force),
        );
        vec![
            (Domain::Lift, lift),
            (Domain::Weather, weather),
            (Domain::Traffic, traffic),
        ]
    }

    /// One pass over every domain concurrently. Reports come back in
    /// lift, weather, traffic order.
    pub async fn refresh_every_domain(self: &Arc<Self>, force: bool) -> Vec<RefreshReport> {
        let (lift, weather, traffic) = tokio::join!(
            self.refresh_domain(Domain::Lift, force),
            self.refresh_domain(Domain::Weather, force),
            self.refresh_domain(Domain::Traffic, force),
        );
        vec![lift, weather, traffic]
    }

    /// Refresh every resort in `domain`, bounded by the shared pool.
    pub async fn refresh_domain(self: &Arc<Self>, domain: Domain, force: bool) -> RefreshReport {
        let started_at = Utc::now();
        let clock = std::time::Instant::now();

        let outcomes = match domain {
            Domain::Traffic => self.fan_out_traffic(force).await,
            _ => self.fan_out_resorts(domain, force).await,
        };

        let report = RefreshReport {
            domain,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            outcomes: self
                .resorts
                .iter()
                .zip(outcomes)
                .map(|(resort, outcome)| ResortOutcome {
                    resort_id: resort.id.clone(),
                    outcome,
                })
                .collect(),
        };

        info!(
            domain = %domain,
            updated = report.updated(),
            failed = report.failed(),
            "Refresh cycle done in {}ms ({} resorts)",
            report.elapsed_ms,
            report.outcomes.len()
        );
        report
    }

    // ── Fan-out ───────────────────────────────────────────────────────

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_ms))
    }

    /// One task per resort. Tasks start after a random delay and then
    /// queue on the semaphore. A panicking task fails only its own resort.
    async fn fan_out_resorts(self: &Arc<Self>, domain: Domain, force: bool) -> Vec<RefreshOutcome> {
        let mut set = JoinSet::new();
        for idx in 0..self.resorts.len() {
            let this = Arc::clone(self);
            let delay = self.jitter();
            set.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let resort = &this.resorts[idx];
                let outcome = match domain {
                    Domain::Weather => this.weather_once(resort, force).await,
                    _ => this.lift_once(resort, force).await,
                };
                vec![(idx, outcome)]
            });
        }
        self.collect(set).await
    }

    /// Traffic goes out in batches of destinations, one pool slot per batch.
    async fn fan_out_traffic(self: &Arc<Self>, force: bool) -> Vec<RefreshOutcome> {
        let Some(source) = &self.traffic else {
            return vec![RefreshOutcome::NoAdapter; self.resorts.len()];
        };

        let now = Utc::now();
        let mut outcomes = vec![RefreshOutcome::Cached; self.resorts.len()];
        let due: Vec<usize> = (0..self.resorts.len())
            .filter(|&idx| force || !self.is_reusable(Domain::Traffic, &self.resorts[idx].id, now))
            .collect();

        let mut set = JoinSet::new();
        for chunk in due.chunks(source.max_batch().max(1)) {
            let this = Arc::clone(self);
            let idxs = chunk.to_vec();
            let delay = self.jitter();
            set.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let batch: Vec<&ResortConfig> = idxs.iter().map(|&i| &this.resorts[i]).collect();
                let results = this.traffic_batch(&batch).await;
                idxs.into_iter().zip(results).collect::<Vec<_>>()
            });
        }

        let mut pending = vec![false; self.resorts.len()];
        for &idx in &due {
            pending[idx] = true;
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => {
                    for (idx, outcome) in results {
                        outcomes[idx] = outcome;
                        pending[idx] = false;
                    }
                }
                Err(e) => error!("Traffic refresh task failed: {}", e),
            }
        }
        for (idx, still_pending) in pending.into_iter().enumerate() {
            if still_pending {
                outcomes[idx] = aborted();
            }
        }
        outcomes
    }

    async fn collect(&self, mut set: JoinSet<Vec<(usize, RefreshOutcome)>>) -> Vec<RefreshOutcome> {
        let mut slots: Vec<Option<RefreshOutcome>> = vec![None; self.resorts.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(results) => {
                    for (idx, outcome) in results {
                        slots[idx] = Some(outcome);
                    }
                }
                Err(e) => error!("Refresh task failed: {}", e),
            }
        }
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(aborted))
            .collect()
    }

    // ── Single calls ──────────────────────────────────────────────────

    /// Whether the cached value was written recently enough to skip a call:
    /// within half of the domain's fresh window.
    fn is_reusable(&self, domain: Domain, resort_id: &str, now: DateTime<Utc>) -> bool {
        let stored_at = match domain {
            Domain::Lift => self.caches.lift.stored_at(resort_id, now),
            Domain::Weather => self.caches.weather.stored_at(resort_id, now),
            Domain::Traffic => self.caches.traffic.stored_at(resort_id, now),
        };
        let reuse_secs = (self.cache_config.for_domain(domain).fresh_secs / 2) as i64;
        stored_at.is_some_and(|at| (now - at).num_seconds() < reuse_secs)
    }

    /// Run one outbound call under a pool slot and the deadline. The
    /// deadline starts once the slot is acquired. `timed_out` builds the
    /// error from the deadline in milliseconds.
    async fn guarded<T, F, Fut, E>(&self, timed_out: E, call: F) -> Result<T>
    where
        F: FnOnce(Instant) -> Fut,
        Fut: Future<Output = Result<T>>,
        E: FnOnce(u64) -> Error,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Other("fetch pool closed".into()))?;
        let deadline = Instant::now() + self.deadline;
        match tokio::time::timeout_at(deadline, call(deadline)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(self.deadline.as_millis() as u64)),
        }
    }

    async fn lift_once(&self, resort: &ResortConfig, force: bool) -> RefreshOutcome {
        let Some(adapter) = self.registry.get(&resort.id) else {
            return RefreshOutcome::NoAdapter;
        };
        if !force && self.is_reusable(Domain::Lift, &resort.id, Utc::now()) {
            return RefreshOutcome::Cached;
        }

        let token = self.tokens.issue();
        let result = self
            .guarded(resort_timeout(&resort.id), |deadline| adapter.fetch(deadline))
            .await
            .and_then(|snap| ensure_valid(&snap, &resort.id, Utc::now()).map(|_| snap));

        let outcome = match result {
            Ok(snap) => {
                let committed = self.tokens.commit(Domain::Lift, &resort.id, token, || {
                    self.caches.lift.set(&resort.id, snap)
                });
                if committed {
                    RefreshOutcome::Updated
                } else {
                    RefreshOutcome::Superseded
                }
            }
            Err(e) => RefreshOutcome::from_error(&e),
        };
        self.record(Domain::Lift, &resort.id, adapter.source_url(), &outcome);
        outcome
    }

    async fn weather_once(&self, resort: &ResortConfig, force: bool) -> RefreshOutcome {
        let Some(source) = &self.weather else {
            return RefreshOutcome::NoAdapter;
        };
        if !force && self.is_reusable(Domain::Weather, &resort.id, Utc::now()) {
            return RefreshOutcome::Cached;
        }

        let token = self.tokens.issue();
        let result = self
            .guarded(resort_timeout(&resort.id), |deadline| {
                source.forecast(&resort.id, resort.lat, resort.lon, deadline)
            })
            .await;

        let outcome = match result {
            Ok(Some(snap)) => match ensure_valid(&snap, &resort.id, Utc::now()) {
                Ok(()) => {
                    let committed = self.tokens.commit(Domain::Weather, &resort.id, token, || {
                        self.caches.weather.set(&resort.id, snap)
                    });
                    if committed {
                        RefreshOutcome::Updated
                    } else {
                        RefreshOutcome::Superseded
                    }
                }
                Err(e) => RefreshOutcome::from_error(&e),
            },
            Ok(None) => RefreshOutcome::NoData,
            Err(e) => RefreshOutcome::from_error(&e),
        };
        self.record(Domain::Weather, &resort.id, source.source_url(), &outcome);
        outcome
    }

    /// One traffic call for `batch`; outcomes are aligned with `batch`.
    async fn traffic_batch(&self, batch: &[&ResortConfig]) -> Vec<RefreshOutcome> {
        let Some(source) = &self.traffic else {
            return vec![RefreshOutcome::NoAdapter; batch.len()];
        };
        if batch.is_empty() {
            return Vec::new();
        }

        let tokens: Vec<u64> = batch.iter().map(|_| self.tokens.issue()).collect();
        let destinations: Vec<Destination> = batch
            .iter()
            .map(|r| Destination {
                resort_id: r.id.clone(),
                lat: r.lat,
                lon: r.lon,
            })
            .collect();
        let timed_out = |after_ms: u64| match batch {
            [single] => Error::Timeout {
                resort_id: single.id.clone(),
                after_ms,
            },
            _ => Error::BatchTimeout {
                resort_ids: batch.iter().map(|r| r.id.clone()).collect(),
                after_ms,
            },
        };

        let result = self
            .guarded(timed_out, |deadline| {
                source.travel_times(&self.origin, &destinations, deadline)
            })
            .await;

        let mut outcomes = Vec::with_capacity(batch.len());
        match result {
            Ok(mut snapshots) => {
                for (resort, token) in batch.iter().zip(tokens) {
                    let outcome = match snapshots.remove(&resort.id) {
                        None => RefreshOutcome::NoData,
                        Some(snap) => match ensure_valid(&snap, &resort.id, Utc::now()) {
                            Ok(()) => {
                                let committed =
                                    self.tokens.commit(Domain::Traffic, &resort.id, token, || {
                                        let previous = self.caches.traffic.get(&resort.id);
                                        self.caches
                                            .traffic
                                            .set(&resort.id, snap.with_history(previous.as_ref()))
                                    });
                                if committed {
                                    RefreshOutcome::Updated
                                } else {
                                    RefreshOutcome::Superseded
                                }
                            }
                            Err(e) => RefreshOutcome::from_error(&e),
                        },
                    };
                    self.record(Domain::Traffic, &resort.id, source.source_url(), &outcome);
                    outcomes.push(outcome);
                }
            }
            Err(e) => {
                let outcome = RefreshOutcome::from_error(&e);
                for resort in batch {
                    self.record(Domain::Traffic, &resort.id, source.source_url(), &outcome);
                    outcomes.push(outcome.clone());
                }
            }
        }
        outcomes
    }

    fn record(&self, domain: Domain, resort_id: &str, source_url: &str, outcome: &RefreshOutcome) {
        let now = Utc::now();
        match outcome {
            RefreshOutcome::Updated => {
                self.health.record_ok(domain, resort_id, now);
                debug!(resort_id, domain = %domain, "Refreshed");
            }
            RefreshOutcome::Failed { kind, message } => {
                self.health.record_error(domain, resort_id, message, now);
                warn!(
                    resort_id,
                    domain = %domain,
                    source_url,
                    kind = kind.as_str(),
                    "Refresh failed: {}",
                    message
                );
            }
            RefreshOutcome::Superseded => {
                debug!(resort_id, domain = %domain, "Dropped result superseded by a newer call");
            }
            _ => {}
        }
    }
}

fn aborted() -> RefreshOutcome {
    RefreshOutcome::Failed {
        kind: FailureKind::Adapter,
        message: "refresh task aborted".into(),
    }
}

fn resort_timeout(resort_id: &str) -> impl FnOnce(u64) -> Error + '_ {
    move |after_ms| Error::Timeout {
        resort_id: resort_id.to_string(),
        after_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::config::ResortClass;
    use common::{CurrentConditions, LiftStatusSnapshot, TrafficSnapshot, WeatherSnapshot};
    use lift_adapters::LiftStatusAdapter;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    // ── Fakes ─────────────────────────────────────────────────────────

    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Counts(i64, i64),
        Fail,
    }

    struct ScriptedAdapter {
        resort_id: String,
        /// Delay and reply per call; the last entry repeats.
        script: Vec<(Duration, Reply)>,
        calls: AtomicUsize,
        gauge: Option<Arc<Gauge>>,
    }

    impl ScriptedAdapter {
        fn new(resort_id: &str, delay: Duration, reply: Reply) -> Self {
            Self {
                resort_id: resort_id.into(),
                script: vec![(delay, reply)],
                calls: AtomicUsize::new(0),
                gauge: None,
            }
        }
    }

    #[async_trait]
    impl LiftStatusAdapter for ScriptedAdapter {
        async fn fetch(&self, _deadline: Instant) -> Result<LiftStatusSnapshot> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, reply) = self.script[call.min(self.script.len() - 1)];
            if let Some(g) = &self.gauge {
                g.enter();
            }
            tokio::time::sleep(delay).await;
            if let Some(g) = &self.gauge {
                g.leave();
            }
            match reply {
                Reply::Counts(open, total) => Ok(make_lift(&self.resort_id, open, total, Utc::now())),
                Reply::Fail => Err(Error::Http("503 Service Unavailable".into())),
            }
        }

        fn source_url(&self) -> &str {
            "http://feed.test/lifts"
        }
    }

    struct FakeWeather {
        empty_for: Vec<String>,
    }

    #[async_trait]
    impl WeatherSource for FakeWeather {
        async fn forecast(
            &self,
            resort_id: &str,
            _lat: f64,
            _lon: f64,
            _deadline: Instant,
        ) -> Result<Option<WeatherSnapshot>> {
            if self.empty_for.iter().any(|id| id == resort_id) {
                return Ok(None);
            }
            Ok(Some(WeatherSnapshot {
                resort_id: resort_id.into(),
                forecast_days: vec![],
                current: CurrentConditions {
                    temperature_c: -3.0,
                    wind_kmh: 10.0,
                    precipitation_probability: 0.1,
                    snow_depth_cm: Some(90.0),
                    weather_code: None,
                },
                captured_at: Utc::now(),
            }))
        }

        fn source_url(&self) -> &str {
            "http://weather.test"
        }
    }

    #[derive(Default)]
    struct FakeTraffic {
        batch_sizes: Mutex<Vec<usize>>,
        delay: Duration,
    }

    #[async_trait]
    impl TrafficSource for FakeTraffic {
        async fn travel_times(
            &self,
            _origin: &OriginConfig,
            destinations: &[Destination],
            _deadline: Instant,
        ) -> Result<HashMap<String, TrafficSnapshot>> {
            self.batch_sizes
                .lock()
                .expect("lock")
                .push(destinations.len());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(destinations
                .iter()
                .map(|d| {
                    (
                        d.resort_id.clone(),
                        TrafficSnapshot {
                            resort_id: d.resort_id.clone(),
                            travel_time_secs: 5400,
                            traffic_delay_secs: 300,
                            distance_km: 120.0,
                            recent_samples: VecDeque::new(),
                            captured_at: Utc::now(),
                        },
                    )
                })
                .collect())
        }

        fn source_url(&self) -> &str {
            "http://traffic.test"
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn make_lift(resort_id: &str, open: i64, total: i64, at: DateTime<Utc>) -> LiftStatusSnapshot {
        LiftStatusSnapshot {
            resort_id: resort_id.into(),
            lifts_open: Some(open),
            lifts_total: Some(total),
            lifts: vec![],
            slopes: vec![],
            snow: None,
            source_url: "http://feed.test/lifts".into(),
            captured_at: at,
        }
    }

    fn make_resort(id: &str) -> ResortConfig {
        ResortConfig {
            id: id.into(),
            name: id.to_uppercase(),
            lat: 46.8,
            lon: 9.2,
            day_pass_price: Some(60.0),
            classification: ResortClass::AllMountain,
            lifts_total: Some(10),
            static_travel_minutes: Some(90),
            adapter: AdapterSpec::None,
        }
    }

    fn make_config(resorts: usize, concurrency: usize) -> AppConfig {
        let mut config = AppConfig::default();
        config.resorts = (1..=resorts).map(|i| make_resort(&format!("alpine-{i}"))).collect();
        config.fetch.concurrency = concurrency;
        config.fetch.jitter_ms = 0;
        config
    }

    fn make_orchestrator(config: &AppConfig, registry: AdapterRegistry) -> FetchOrchestrator {
        let caches = Arc::new(Caches::new(&config.cache, config.utc_offset_minutes));
        FetchOrchestrator::new(config, registry, caches).expect("valid orchestrator config")
    }

    // ── Tests ─────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_successful_fetch_is_cached() {
        let config = make_config(1, 4);
        let mut registry = AdapterRegistry::new();
        registry.register(
            "alpine-1",
            Arc::new(ScriptedAdapter::new("alpine-1", Duration::from_secs(2), Reply::Counts(8, 10))),
        );
        let orch = make_orchestrator(&config, registry);

        assert_eq!(orch.refresh_one("alpine-1").await, RefreshOutcome::Updated);

        let cached = orch.caches().lift.get("alpine-1").expect("cached snapshot");
        assert_eq!(cached.lifts_open, Some(8));
        assert_eq!(cached.lifts_total, Some(10));
        assert!(orch.health().get(Domain::Lift, "alpine-1").expect("health").ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_adapter_times_out_and_keeps_previous_value() {
        let config = make_config(2, 4);
        let mut registry = AdapterRegistry::new();
        registry.register(
            "alpine-2",
            Arc::new(ScriptedAdapter::new("alpine-2", Duration::from_secs(3600), Reply::Counts(9, 10))),
        );
        let orch = make_orchestrator(&config, registry);

        let earlier = Utc::now() - chrono::Duration::minutes(40);
        orch.caches()
            .lift
            .set_at("alpine-2", make_lift("alpine-2", 5, 10, earlier), earlier);

        let outcome = orch.refresh_one("alpine-2").await;
        match outcome {
            RefreshOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }

        let kept = orch.caches().lift.get("alpine-2").expect("previous value kept");
        assert_eq!(kept.lifts_open, Some(5));
        assert_eq!(kept.captured_at, earlier);

        let health = orch.health().get(Domain::Lift, "alpine-2").expect("health");
        assert!(!health.ok);
        assert!(health.last_error.expect("error message").contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_in_flight_calls() {
        let config = make_config(50, 5);
        let gauge = Arc::new(Gauge::default());
        let mut registry = AdapterRegistry::new();
        for resort in &config.resorts {
            let mut adapter =
                ScriptedAdapter::new(&resort.id, Duration::from_millis(100), Reply::Counts(3, 10));
            adapter.gauge = Some(Arc::clone(&gauge));
            registry.register(&resort.id, Arc::new(adapter));
        }
        let orch = Arc::new(make_orchestrator(&config, registry));

        let report = orch.refresh_all().await;

        assert_eq!(report.updated(), 50);
        assert_eq!(report.failed(), 0);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak in-flight {peak} exceeded pool size");
        assert!(peak >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated_per_resort() {
        let config = make_config(3, 2);
        let mut registry = AdapterRegistry::new();
        registry.register(
            "alpine-1",
            Arc::new(ScriptedAdapter::new("alpine-1", Duration::from_millis(10), Reply::Fail)),
        );
        registry.register(
            "alpine-2",
            Arc::new(ScriptedAdapter::new("alpine-2", Duration::from_millis(10), Reply::Counts(4, 6))),
        );
        let orch = Arc::new(make_orchestrator(&config, registry));

        let report = orch.refresh_all().await;

        assert!(report.outcome("alpine-1").expect("alpine-1").is_failure());
        assert_eq!(report.outcome("alpine-2"), Some(&RefreshOutcome::Updated));
        assert_eq!(report.outcome("alpine-3"), Some(&RefreshOutcome::NoAdapter));
        assert!(orch.caches().lift.get("alpine-1").is_none());
        assert!(orch.caches().lift.get("alpine-2").is_some());
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_snapshot_is_not_stored() {
        let config = make_config(1, 1);
        let mut registry = AdapterRegistry::new();
        registry.register(
            "alpine-1",
            Arc::new(ScriptedAdapter::new("alpine-1", Duration::ZERO, Reply::Counts(12, 10))),
        );
        let orch = make_orchestrator(&config, registry);

        match orch.force_one("alpine-1").await {
            RefreshOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Validation),
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert!(orch.caches().lift.get("alpine-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_value_served_from_cache_unless_forced() {
        let config = make_config(1, 1);
        let adapter = Arc::new(ScriptedAdapter::new("alpine-1", Duration::ZERO, Reply::Counts(2, 4)));
        let mut registry = AdapterRegistry::new();
        registry.register("alpine-1", adapter.clone());
        let orch = make_orchestrator(&config, registry);

        assert_eq!(orch.refresh_one("alpine-1").await, RefreshOutcome::Updated);
        assert_eq!(orch.refresh_one("alpine-1").await, RefreshOutcome::Cached);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        assert_eq!(orch.force_one("alpine-1").await, RefreshOutcome::Updated);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_call_cannot_overwrite_newer_result() {
        let config = make_config(1, 4);
        let adapter = Arc::new(ScriptedAdapter {
            resort_id: "alpine-1".into(),
            script: vec![
                (Duration::from_secs(5), Reply::Counts(1, 10)),
                (Duration::ZERO, Reply::Counts(7, 10)),
            ],
            calls: AtomicUsize::new(0),
            gauge: None,
        });
        let mut registry = AdapterRegistry::new();
        registry.register("alpine-1", adapter);
        let orch = Arc::new(make_orchestrator(&config, registry));

        let slow = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.force_one("alpine-1").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(orch.force_one("alpine-1").await, RefreshOutcome::Updated);
        assert_eq!(slow.await.expect("join"), RefreshOutcome::Superseded);

        let cached = orch.caches().lift.get("alpine-1").expect("cached");
        assert_eq!(cached.lifts_open, Some(7));
    }

    #[tokio::test]
    async fn test_unregistered_adapter_spec_is_config_error() {
        let mut config = make_config(1, 1);
        config.resorts[0].adapter = AdapterSpec::JsonFeed {
            url: "http://feed.test/alpine-1".into(),
        };
        let caches = Arc::new(Caches::new(&config.cache, 0));
        let err = FetchOrchestrator::new(&config, AdapterRegistry::new(), caches)
            .err()
            .expect("should reject");
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_pool_size_must_be_bounded() {
        let caches = Arc::new(Caches::new(&AppConfig::default().cache, 0));
        for bad in [0, MAX_CONCURRENCY + 1] {
            let config = make_config(1, bad);
            assert!(FetchOrchestrator::new(&config, AdapterRegistry::new(), Arc::clone(&caches)).is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_weather_refresh_outcomes() {
        let config = make_config(3, 2);
        let orch = Arc::new(
            make_orchestrator(&config, AdapterRegistry::new()).with_weather(Arc::new(FakeWeather {
                empty_for: vec!["alpine-3".into()],
            })),
        );

        let report = orch.refresh_weather_all(false).await;

        assert_eq!(report.outcome("alpine-1"), Some(&RefreshOutcome::Updated));
        assert_eq!(report.outcome("alpine-3"), Some(&RefreshOutcome::NoData));
        assert!(orch.caches().weather.get("alpine-2").is_some());
        assert!(orch.caches().weather.get("alpine-3").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_batches_and_keeps_samples() {
        let config = make_config(30, 4);
        let traffic = Arc::new(FakeTraffic::default());
        let orch = Arc::new(make_orchestrator(&config, AdapterRegistry::new()).with_traffic(traffic.clone()));

        let first = orch.refresh_traffic_all(false).await;
        assert_eq!(first.updated(), 30);
        let mut sizes = traffic.batch_sizes.lock().expect("lock").clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![5, 25]);

        let cached = orch.refresh_traffic_all(false).await;
        assert_eq!(cached.cached(), 30);

        orch.refresh_traffic_all(true).await;
        let snap = orch.caches().traffic.get("alpine-7").expect("traffic cached");
        assert_eq!(snap.recent_samples.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_batch_timeout_names_every_resort() {
        let config = make_config(3, 2);
        let traffic = Arc::new(FakeTraffic {
            delay: Duration::from_secs(3600),
            ..FakeTraffic::default()
        });
        let orch = Arc::new(make_orchestrator(&config, AdapterRegistry::new()).with_traffic(traffic));

        let report = orch.refresh_traffic_all(true).await;
        assert_eq!(report.failed(), 3);
        match report.outcome("alpine-2") {
            Some(RefreshOutcome::Failed { kind, message }) => {
                assert_eq!(*kind, FailureKind::Timeout);
                assert!(message.contains("Batched call for 3 resorts"), "{message}");
                assert!(message.contains("alpine-1, alpine-2, alpine-3"), "{message}");
            }
            other => panic!("expected batch timeout, got {other:?}"),
        }
        assert!(orch.caches().traffic.get("alpine-2").is_none());
    }

    #[tokio::test]
    async fn test_missing_sources_report_no_adapter() {
        let config = make_config(2, 2);
        let orch = Arc::new(make_orchestrator(&config, AdapterRegistry::new()));
        let report = orch.refresh_traffic_all(true).await;
        assert_eq!(report.no_adapter(), 2);
        assert_eq!(
            orch.refresh_resort(Domain::Weather, "alpine-1", true).await,
            RefreshOutcome::NoAdapter
        );
        assert_eq!(orch.refresh_one("unknown").await, RefreshOutcome::NoAdapter);
    }
}
