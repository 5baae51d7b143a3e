//! Read/refresh facade over the whole pipeline.

use std::path::Path;
use std::sync::Arc;

use common::config::AppConfig;
use common::{Domain, Result};
use lift_adapters::AdapterRegistry;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use traffic_client::TrafficSource;
use weather_client::WeatherSource;

use crate::cache::{CacheStats, Caches};
use crate::fusion::{FusedResortView, FusionEngine};
use crate::orchestrator::{FetchOrchestrator, RefreshOutcome, RefreshReport};
use crate::scheduler::{persist, Scheduler, SchedulerHandle};
use crate::scoring::{rank, score, RankedResort, ScoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStatsReport {
    pub lift: CacheStats,
    pub weather: CacheStats,
    pub traffic: CacheStats,
}

/// Owns the caches, orchestrator and fusion engine for one board.
pub struct ResortService {
    config: AppConfig,
    caches: Arc<Caches>,
    orchestrator: Arc<FetchOrchestrator>,
    fusion: FusionEngine,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl ResortService {
    pub fn new(
        config: AppConfig,
        registry: AdapterRegistry,
        weather: Option<Arc<dyn WeatherSource>>,
        traffic: Option<Arc<dyn TrafficSource>>,
    ) -> Result<Self> {
        let caches = Arc::new(Caches::new(&config.cache, config.utc_offset_minutes));
        let mut orchestrator = FetchOrchestrator::new(&config, registry, Arc::clone(&caches))?;
        if let Some(source) = weather {
            orchestrator = orchestrator.with_weather(source);
        }
        if let Some(source) = traffic {
            orchestrator = orchestrator.with_traffic(source);
        }
        let fusion = FusionEngine::new(&config, Arc::clone(&caches), orchestrator.health());

        Ok(Self {
            config,
            caches,
            orchestrator: Arc::new(orchestrator),
            fusion,
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<FetchOrchestrator> {
        &self.orchestrator
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn fused_view(&self, resort_id: &str) -> Option<FusedResortView> {
        self.fusion.fused_view(resort_id)
    }

    pub fn fused_views(&self) -> Vec<FusedResortView> {
        self.fusion.fused_views()
    }

    pub fn score(&self, resort_id: &str) -> Option<ScoreResult> {
        let view = self.fusion.fused_view(resort_id)?;
        Some(score(&view, &view.freshness, &self.config.scoring))
    }

    pub fn ranked(&self) -> Vec<RankedResort> {
        rank(self.fusion.fused_views(), &self.config.scoring)
    }

    pub fn cache_stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            lift: self.caches.stats(Domain::Lift),
            weather: self.caches.stats(Domain::Weather),
            traffic: self.caches.stats(Domain::Traffic),
        }
    }

    // ── Refreshes ─────────────────────────────────────────────────────

    /// Refresh every domain for one resort, bypassing the cache.
    pub async fn force_refresh(&self, resort_id: &str) -> Vec<(Domain, RefreshOutcome)> {
        self.orchestrator.refresh_resort_everywhere(resort_id, true).await
    }

    /// Refresh every domain for every resort, bypassing the cache.
    pub async fn force_all(&self) -> Vec<RefreshReport> {
        self.orchestrator.refresh_every_domain(true).await
    }

    /// One cache-aware pass over every domain, concurrently.
    pub async fn refresh_all(&self) -> Vec<RefreshReport> {
        self.orchestrator.refresh_every_domain(false).await
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Load snapshots from the configured directory, if any.
    pub fn restore_snapshots(&self) -> Result<usize> {
        match &self.config.cache.snapshot_dir {
            Some(dir) => self.caches.restore_all(Path::new(dir)),
            None => Ok(0),
        }
    }

    /// Start background refresh. A second call is a no-op.
    pub async fn start(&self, reports: Option<mpsc::UnboundedSender<RefreshReport>>) {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return;
        }
        let mut scheduler = Scheduler::new(Arc::clone(&self.orchestrator), &self.config);
        if let Some(tx) = reports {
            scheduler = scheduler.with_reports(tx);
        }
        *slot = Some(scheduler.start());
        info!("Background refresh started for {} resorts", self.config.resorts.len());
    }

    /// Stop background refresh and persist caches if configured.
    pub async fn stop(&self) {
        let handle = self.scheduler.lock().await.take();
        match handle {
            // The snapshot loop writes a final snapshot on stop.
            Some(handle) => handle.stop().await,
            None => {
                if let Some(dir) = &self.config.cache.snapshot_dir {
                    persist(&self.caches, Path::new(dir)).await;
                }
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(SchedulerHandle::is_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::{Facilities, LiftCount, ResortStatus, SnowSource};
    use async_trait::async_trait;
    use common::config::{AdapterSpec, ResortClass, ResortConfig};
    use common::{CurrentConditions, FailureKind, Freshness, LiftStatusSnapshot, WeatherSnapshot};
    use lift_adapters::LiftStatusAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    struct DelayedAdapter {
        resort_id: &'static str,
        delay: Duration,
        counts: (i64, i64),
    }

    #[async_trait]
    impl LiftStatusAdapter for DelayedAdapter {
        async fn fetch(&self, _deadline: Instant) -> Result<LiftStatusSnapshot> {
            tokio::time::sleep(self.delay).await;
            Ok(LiftStatusSnapshot {
                resort_id: self.resort_id.into(),
                lifts_open: Some(self.counts.0),
                lifts_total: Some(self.counts.1),
                lifts: vec![],
                slopes: vec![],
                snow: None,
                source_url: "http://feed.test".into(),
                captured_at: chrono::Utc::now(),
            })
        }

        fn source_url(&self) -> &str {
            "http://feed.test"
        }
    }

    struct CountingAdapter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LiftStatusAdapter for CountingAdapter {
        async fn fetch(&self, _deadline: Instant) -> Result<LiftStatusSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LiftStatusSnapshot {
                resort_id: "alpine-1".into(),
                lifts_open: Some(4),
                lifts_total: Some(10),
                lifts: vec![],
                slopes: vec![],
                snow: None,
                source_url: "http://feed.test".into(),
                captured_at: chrono::Utc::now(),
            })
        }

        fn source_url(&self) -> &str {
            "http://feed.test"
        }
    }

    struct SnowyWeather;

    #[async_trait]
    impl WeatherSource for SnowyWeather {
        async fn forecast(
            &self,
            resort_id: &str,
            _lat: f64,
            _lon: f64,
            _deadline: Instant,
        ) -> Result<Option<WeatherSnapshot>> {
            Ok(Some(WeatherSnapshot {
                resort_id: resort_id.into(),
                forecast_days: vec![],
                current: CurrentConditions {
                    temperature_c: -6.0,
                    wind_kmh: 8.0,
                    precipitation_probability: 0.1,
                    snow_depth_cm: Some(120.0),
                    weather_code: None,
                },
                captured_at: chrono::Utc::now(),
            }))
        }

        fn source_url(&self) -> &str {
            "http://weather.test"
        }
    }

    fn make_resort(id: &str, lifts_total: u32) -> ResortConfig {
        ResortConfig {
            id: id.into(),
            name: id.into(),
            lat: 46.8,
            lon: 9.2,
            day_pass_price: Some(55.0),
            classification: ResortClass::AllMountain,
            lifts_total: Some(lifts_total),
            static_travel_minutes: Some(75),
            adapter: AdapterSpec::None,
        }
    }

    fn make_service() -> ResortService {
        let mut config = AppConfig::default();
        config.resorts = vec![make_resort("alpine-1", 10), make_resort("alpine-2", 14)];
        config.fetch.jitter_ms = 0;

        let mut registry = AdapterRegistry::new();
        registry.register(
            "alpine-1",
            Arc::new(DelayedAdapter {
                resort_id: "alpine-1",
                delay: Duration::from_secs(2),
                counts: (8, 10),
            }),
        );
        registry.register(
            "alpine-2",
            Arc::new(DelayedAdapter {
                resort_id: "alpine-2",
                delay: Duration::from_secs(3600),
                counts: (14, 14),
            }),
        );
        ResortService::new(config, registry, Some(Arc::new(SnowyWeather)), None)
            .expect("valid service")
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_all_then_fuse_and_rank() {
        let service = make_service();

        let reports = service.refresh_all().await;
        let lift = &reports[0];
        assert_eq!(lift.outcome("alpine-1"), Some(&RefreshOutcome::Updated));
        match lift.outcome("alpine-2") {
            Some(RefreshOutcome::Failed { kind, .. }) => assert_eq!(*kind, FailureKind::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }

        let one = service.fused_view("alpine-1").expect("alpine-1");
        assert_eq!(one.status, ResortStatus::Ok);
        assert_eq!(one.lifts_open, Some(8));
        assert_eq!(one.lifts_total, Some(LiftCount::Live(10)));
        assert_eq!(one.freshness.lift, Freshness::Fresh);

        let two = service.fused_view("alpine-2").expect("alpine-2");
        assert_eq!(two.status, ResortStatus::Error);
        assert_eq!(two.lifts, Facilities::Absent);
        assert_eq!(two.lifts_total, Some(LiftCount::Static(14)));
        assert_eq!(two.snow.expect("weather estimate").source, SnowSource::Estimated);

        let ranked = service.ranked();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].view.resort_id, "alpine-1");

        let stats = service.cache_stats();
        assert_eq!(stats.lift.valid, 1);
        assert_eq!(stats.weather.valid, 2);
        assert_eq!(stats.traffic.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_reports_each_domain() {
        let service = make_service();
        let outcomes = service.force_refresh("alpine-1").await;
        assert_eq!(
            outcomes,
            vec![
                (Domain::Lift, RefreshOutcome::Updated),
                (Domain::Weather, RefreshOutcome::Updated),
                (Domain::Traffic, RefreshOutcome::NoAdapter),
            ]
        );
        assert!(service.score("alpine-1").expect("score").total > 0.0);
    }

    #[tokio::test]
    async fn test_force_all_bypasses_fresh_cache() {
        let mut config = AppConfig::default();
        config.resorts = vec![make_resort("alpine-1", 10)];
        config.fetch.jitter_ms = 0;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = AdapterRegistry::new();
        registry.register(
            "alpine-1",
            Arc::new(CountingAdapter {
                calls: Arc::clone(&calls),
            }),
        );
        let service = ResortService::new(config, registry, None, None).expect("valid service");

        service.refresh_all().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Entry is fresh: a scheduled pass reuses it.
        let reports = service.refresh_all().await;
        assert_eq!(reports[0].outcome("alpine-1"), Some(&RefreshOutcome::Cached));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let reports = service.force_all().await;
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].outcome("alpine-1"), Some(&RefreshOutcome::Updated));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop() {
        let service = make_service();
        service.start(None).await;
        service.start(None).await;
        assert!(service.is_running().await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(service.fused_view("alpine-1").expect("view").lifts_open.is_some());

        service.stop().await;
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_snapshots_round_trip_through_service() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.resorts = vec![make_resort("alpine-1", 10)];
        config.fetch.jitter_ms = 0;
        config.cache.snapshot_dir = Some(dir.path().display().to_string());

        let make = |config: AppConfig| {
            let mut registry = AdapterRegistry::new();
            registry.register(
                "alpine-1",
                Arc::new(DelayedAdapter {
                    resort_id: "alpine-1",
                    delay: Duration::ZERO,
                    counts: (5, 10),
                }),
            );
            ResortService::new(config, registry, None, None).expect("valid service")
        };

        let first = make(config.clone());
        first.refresh_all().await;
        first.stop().await;

        let second = make(config);
        assert_eq!(second.restore_snapshots().expect("restore"), 1);
        assert_eq!(second.fused_view("alpine-1").expect("view").lifts_open, Some(5));
    }
}
