//! Background refresh loops.
//!
//! One loop per domain on its own cadence and optional local-time window,
//! plus cache cleanup and snapshot persistence. Loops share nothing but the
//! orchestrator, so a slow or failing domain never delays another.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use common::config::{ActiveWindow, AppConfig};
use common::Domain;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{utc_offset, Caches};
use crate::orchestrator::{FetchOrchestrator, RefreshOutcome, RefreshReport};

/// Whether `now` falls inside `window` in local time. No window means always.
pub fn in_window(window: Option<ActiveWindow>, now: DateTime<Utc>, offset: FixedOffset) -> bool {
    match window {
        Some(w) => w.contains(now.with_timezone(&offset).hour()),
        None => true,
    }
}

pub struct Scheduler {
    orchestrator: Arc<FetchOrchestrator>,
    config: AppConfig,
    offset: FixedOffset,
    reports: Option<mpsc::UnboundedSender<RefreshReport>>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<FetchOrchestrator>, config: &AppConfig) -> Self {
        Self {
            orchestrator,
            offset: utc_offset(config.utc_offset_minutes),
            config: config.clone(),
            reports: None,
        }
    }

    /// Send every completed refresh cycle's report to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<RefreshReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Spawn all loops. They run until `SchedulerHandle::stop`.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, _) = broadcast::channel(16);
        let mut tasks = Vec::new();

        for domain in Domain::ALL {
            let period = Duration::from_secs(self.config.timing.interval_secs(domain).max(1));
            let window = self.config.timing.window(domain);
            info!(
                "Scheduling {} refresh every {}s{}",
                domain,
                period.as_secs(),
                window
                    .map(|w| format!(" between {:02}:00 and {:02}:00", w.start_hour, w.end_hour))
                    .unwrap_or_default()
            );
            tasks.push((
                format!("{domain}-refresh"),
                tokio::spawn(run_domain(
                    Arc::clone(&self.orchestrator),
                    domain,
                    period,
                    window,
                    self.offset,
                    self.reports.clone(),
                    shutdown_tx.subscribe(),
                )),
            ));
        }

        let caches = Arc::clone(self.orchestrator.caches());
        tasks.push((
            "cache-cleanup".to_string(),
            tokio::spawn(run_cleanup(
                Arc::clone(&caches),
                Duration::from_secs(self.config.cache.cleanup_interval_secs.max(1)),
                shutdown_tx.subscribe(),
            )),
        ));

        if let Some(dir) = &self.config.cache.snapshot_dir {
            tasks.push((
                "cache-snapshot".to_string(),
                tokio::spawn(run_snapshots(
                    caches,
                    PathBuf::from(dir),
                    Duration::from_secs(self.config.cache.snapshot_interval_secs.max(1)),
                    shutdown_tx.subscribe(),
                )),
            ));
        }

        SchedulerHandle {
            orchestrator: self.orchestrator,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Control surface for running loops.
pub struct SchedulerHandle {
    orchestrator: Arc<FetchOrchestrator>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl SchedulerHandle {
    /// Refresh every domain for one resort now, bypassing the cache.
    pub async fn force_one(&self, resort_id: &str) -> Vec<(Domain, RefreshOutcome)> {
        self.orchestrator.refresh_resort_everywhere(resort_id, true).await
    }

    /// Refresh every domain for every resort now, bypassing the cache.
    pub async fn force_all(&self) -> Vec<RefreshReport> {
        self.orchestrator.refresh_every_domain(true).await
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|(_, t)| !t.is_finished())
    }

    /// Signal every loop to stop and wait for them.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                error!("Scheduler task {} ended abnormally: {}", name, e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_domain(
    orchestrator: Arc<FetchOrchestrator>,
    domain: Domain,
    period: Duration,
    window: Option<ActiveWindow>,
    offset: FixedOffset,
    reports: Option<mpsc::UnboundedSender<RefreshReport>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }
        if !in_window(window, Utc::now(), offset) {
            debug!("{} refresh skipped: outside active window", domain);
            continue;
        }

        let report = tokio::select! {
            r = orchestrator.refresh_domain(domain, false) => r,
            _ = shutdown.recv() => break,
        };
        if let Some(tx) = &reports {
            let _ = tx.send(report);
        }
    }
    debug!("{} refresh loop stopped", domain);
}

async fn run_cleanup(caches: Arc<Caches>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing can have expired yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }
        let removed = caches.cleanup_all();
        if removed > 0 {
            info!("Cache cleanup evicted {} expired entries", removed);
        }
    }
}

async fn run_snapshots(
    caches: Arc<Caches>,
    dir: PathBuf,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = shutdown.recv() => true,
        };
        persist(&caches, &dir).await;
        if stopping {
            break;
        }
    }
}

/// Save all caches on the blocking pool.
pub async fn persist(caches: &Arc<Caches>, dir: &std::path::Path) {
    let caches = Arc::clone(caches);
    let dir = dir.to_path_buf();
    match tokio::task::spawn_blocking(move || caches.save_all(&dir)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Cache snapshot failed: {}", e),
        Err(e) => error!("Cache snapshot task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::config::{AdapterSpec, ResortClass, ResortConfig};
    use common::{LiftStatusSnapshot, Result, WeatherSnapshot};
    use lift_adapters::{AdapterRegistry, LiftStatusAdapter};
    use tokio::time::Instant;
    use weather_client::WeatherSource;

    struct QuickAdapter;

    #[async_trait]
    impl LiftStatusAdapter for QuickAdapter {
        async fn fetch(&self, _deadline: Instant) -> Result<LiftStatusSnapshot> {
            Ok(LiftStatusSnapshot {
                resort_id: "alpine-1".into(),
                lifts_open: Some(6),
                lifts_total: Some(9),
                lifts: vec![],
                slopes: vec![],
                snow: None,
                source_url: "http://feed.test".into(),
                captured_at: Utc::now(),
            })
        }

        fn source_url(&self) -> &str {
            "http://feed.test"
        }
    }

    struct HangingWeather;

    #[async_trait]
    impl WeatherSource for HangingWeather {
        async fn forecast(
            &self,
            _resort_id: &str,
            _lat: f64,
            _lon: f64,
            _deadline: Instant,
        ) -> Result<Option<WeatherSnapshot>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        fn source_url(&self) -> &str {
            "http://weather.test"
        }
    }

    fn make_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.resorts = vec![ResortConfig {
            id: "alpine-1".into(),
            name: "Alpine One".into(),
            lat: 46.8,
            lon: 9.2,
            day_pass_price: None,
            classification: ResortClass::Family,
            lifts_total: None,
            static_travel_minutes: None,
            adapter: AdapterSpec::None,
        }];
        config.fetch.jitter_ms = 0;
        config.timing.traffic_window = None;
        config
    }

    fn make_orchestrator(config: &AppConfig) -> Arc<FetchOrchestrator> {
        let caches = Arc::new(Caches::new(&config.cache, config.utc_offset_minutes));
        let mut registry = AdapterRegistry::new();
        registry.register("alpine-1", Arc::new(QuickAdapter));
        Arc::new(
            FetchOrchestrator::new(config, registry, caches)
                .expect("valid config")
                .with_weather(Arc::new(HangingWeather)),
        )
    }

    #[test]
    fn test_in_window_uses_local_offset() {
        let window = Some(ActiveWindow {
            start_hour: 6,
            end_hour: 20,
        });
        let offset = utc_offset(60);
        let at = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .expect("valid timestamp")
                .with_timezone(&Utc)
        };
        // 05:30 UTC is 06:30 local.
        assert!(in_window(window, at("2026-01-10T05:30:00Z"), offset));
        // 19:30 UTC is 20:30 local.
        assert!(!in_window(window, at("2026-01-10T19:30:00Z"), offset));
        assert!(in_window(None, at("2026-01-10T03:00:00Z"), offset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_domain_does_not_block_lift_refresh() {
        let config = make_config();
        let orch = make_orchestrator(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Scheduler::new(Arc::clone(&orch), &config)
            .with_reports(tx)
            .start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let cached = orch.caches().lift.get("alpine-1").expect("lift refreshed");
        assert_eq!(cached.lifts_open, Some(6));

        // Weather is still waiting on its deadline.
        let mut finished = Vec::new();
        while let Ok(report) = rx.try_recv() {
            finished.push(report.domain);
        }
        assert!(finished.contains(&Domain::Lift));
        assert!(!finished.contains(&Domain::Weather));

        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_one_refreshes_every_domain() {
        let config = make_config();
        let orch = make_orchestrator(&config);
        let handle = Scheduler::new(Arc::clone(&orch), &config).start();

        let outcomes = handle.force_one("alpine-1").await;
        assert_eq!(outcomes[0], (Domain::Lift, RefreshOutcome::Updated));
        assert!(matches!(outcomes[1].1, RefreshOutcome::Failed { .. }));
        assert_eq!(outcomes[2], (Domain::Traffic, RefreshOutcome::NoAdapter));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_all_reports_every_domain() {
        let config = make_config();
        let orch = make_orchestrator(&config);
        let handle = Scheduler::new(Arc::clone(&orch), &config).start();

        let reports = handle.force_all().await;
        let domains: Vec<Domain> = reports.iter().map(|r| r.domain).collect();
        assert_eq!(domains, vec![Domain::Lift, Domain::Weather, Domain::Traffic]);
        assert_eq!(reports[0].outcome("alpine-1"), Some(&RefreshOutcome::Updated));
        assert_eq!(reports[1].failed(), 1);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_writes_final_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = make_config();
        config.cache.snapshot_dir = Some(dir.path().display().to_string());
        let orch = make_orchestrator(&config);
        let handle = Scheduler::new(Arc::clone(&orch), &config).start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop().await;

        let path = crate::cache::snapshot_path(dir.path(), Domain::Lift);
        assert!(path.exists(), "lift snapshot written on stop");
    }
}
