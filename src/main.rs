//! Resort board: live ski-resort status aggregator.
//!
//! Single-binary Tokio application that:
//! 1. Refreshes lift status, weather and traffic on independent cadences
//! 2. Caches every domain with per-domain freshness thresholds
//! 3. Fuses the caches into one view per resort
//! 4. Ranks resorts by a freshness-weighted score

mod config;
mod journal;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use common::config::AppConfig;
use common::Domain;
use engine::cache::utc_offset;
use engine::{RankedResort, RefreshOutcome, RefreshReport, ResortService};
use journal::{record, resolve_journal_dir, BoardEvent, EventJournal, SharedJournal};
use lift_adapters::AdapterRegistry;
use traffic_client::{DistanceMatrixClient, TrafficSource};
use weather_client::{OpenMeteoClient, WeatherSource};

/// Ski resort status board
#[derive(Parser)]
#[command(name = "resort-board", about = "Live ski-resort status aggregator")]
struct Cli {
    /// Run one full refresh, print the ranking, then exit.
    #[arg(long)]
    once: bool,

    /// Force-refresh one resort in every domain, print the outcomes, then exit.
    #[arg(long, value_name = "RESORT_ID")]
    force: Option<String>,
}

fn outcome_label(outcome: &RefreshOutcome) -> String {
    match outcome {
        RefreshOutcome::Updated => "updated".into(),
        RefreshOutcome::Cached => "cached".into(),
        RefreshOutcome::NoAdapter => "no adapter".into(),
        RefreshOutcome::NoData => "no data".into(),
        RefreshOutcome::Superseded => "superseded".into(),
        RefreshOutcome::Failed { kind, message } => format!("{} failure: {}", kind.as_str(), message),
    }
}

fn log_ranking(ranked: &[RankedResort]) {
    for entry in ranked {
        let v = &entry.view;
        let lifts = match (v.lifts_open, v.lifts_total) {
            (Some(open), Some(total)) => format!("{}/{}", open, total.value()),
            (None, Some(total)) => format!("?/{}", total.value()),
            _ => "n/a".into(),
        };
        let snow = v
            .snow
            .as_ref()
            .map(|s| format!("{:.0}cm", s.depth_cm))
            .unwrap_or_else(|| "n/a".into());
        let trend = match v.travel.trend_secs() {
            Some(d) if d > 0 => format!(" (+{}m)", d / 60),
            Some(d) if d < 0 => format!(" ({}m)", d / 60),
            _ => String::new(),
        };
        info!(
            "#{:<2} {:<24} score={:>5.1} lifts={:<7} snow={:<6} drive={:.0}m{}{} status={:?}",
            entry.rank,
            v.name,
            entry.score.total,
            lifts,
            snow,
            v.travel.minutes(),
            if v.travel.is_live() { "" } else { " (est)" },
            trend,
            v.status,
        );
    }
}

fn build_sources(
    cfg: &AppConfig,
) -> (Option<Arc<dyn WeatherSource>>, Option<Arc<dyn TrafficSource>>) {
    let weather: Option<Arc<dyn WeatherSource>> = match OpenMeteoClient::new(&cfg.weather_source) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("Weather source disabled: {}", e);
            None
        }
    };

    let traffic: Option<Arc<dyn TrafficSource>> = if cfg.google_maps_api_key.is_empty() {
        info!("GOOGLE_MAPS_API_KEY not set; travel times will be estimated");
        None
    } else {
        match DistanceMatrixClient::new(&cfg.traffic_source, cfg.google_maps_api_key.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Traffic source disabled: {}", e);
                None
            }
        }
    };

    (weather, traffic)
}

#[tokio::main]
async fn main() {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "resort_board=info,engine=info,lift_adapters=info,weather_client=info,traffic_client=info"
                    .into()
            }),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    info!("Resort board starting up...");

    // Load configuration.
    let cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Resorts: {:?}",
        cfg.resorts.iter().map(|r| &r.id).collect::<Vec<_>>()
    );
    info!(
        "Fetch: concurrency={}, deadline={}s, jitter≤{}ms",
        cfg.fetch.concurrency, cfg.fetch.deadline_secs, cfg.fetch.jitter_ms,
    );
    info!(
        "Cadence: lift={}s, weather={}s, traffic={}s, utc_offset={}min",
        cfg.timing.lift_interval_secs,
        cfg.timing.weather_interval_secs,
        cfg.timing.traffic_interval_secs,
        cfg.utc_offset_minutes,
    );

    let registry = match AdapterRegistry::from_resorts(&cfg.resorts) {
        Ok(r) => r,
        Err(e) => {
            error!("Adapter registry error: {}", e);
            std::process::exit(1);
        }
    };
    info!("Lift adapters registered: {}", registry.len());

    let (weather, traffic) = build_sources(&cfg);
    let service = match ResortService::new(cfg.clone(), registry, weather, traffic) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to build resort service: {}", e);
            std::process::exit(1);
        }
    };

    match service.restore_snapshots() {
        Ok(0) => {}
        Ok(n) => info!("Restored {} cache entries from snapshots", n),
        Err(e) => warn!("Snapshot restore failed, starting cold: {}", e),
    }

    // ── Force mode ───────────────────────────────────────────────────
    if let Some(resort_id) = cli.force.as_deref() {
        if !cfg.resorts.iter().any(|r| r.id == resort_id) {
            error!("Unknown resort: {}", resort_id);
            std::process::exit(1);
        }
        info!("Force-refreshing {}...", resort_id);
        for (domain, outcome) in service.force_refresh(resort_id).await {
            info!("  {:<8} {}", domain.as_str(), outcome_label(&outcome));
        }
        if let Some(result) = service.score(resort_id) {
            info!("  score={:.1}", result.total);
        }
        service.stop().await;
        return;
    }

    // ── Once mode ────────────────────────────────────────────────────
    if cli.once {
        info!("Running a single refresh...");
        for report in service.refresh_all().await {
            info!(
                "{}: updated={} cached={} failed={} no_adapter={} ({}ms)",
                report.domain,
                report.updated(),
                report.cached(),
                report.failed(),
                report.no_adapter(),
                report.elapsed_ms,
            );
            for failure in report.failures() {
                warn!("  {} {}", failure.resort_id, outcome_label(&failure.outcome));
            }
        }
        log_ranking(&service.ranked());
        service.stop().await;
        return;
    }

    // ── Journal ──────────────────────────────────────────────────────
    let journal = match EventJournal::open(resolve_journal_dir(), utc_offset(cfg.utc_offset_minutes)) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to initialize event journal: {}", e);
            std::process::exit(1);
        }
    };
    info!("Event journal path: {}", journal.dir().display());
    let event_journal: SharedJournal = Arc::new(tokio::sync::Mutex::new(journal));
    record(
        &event_journal,
        BoardEvent::BoardStart {
            resorts: cfg.resorts.iter().map(|r| r.id.clone()).collect(),
            concurrency: cfg.fetch.concurrency,
            deadline_secs: cfg.fetch.deadline_secs,
            lift_interval_secs: cfg.timing.lift_interval_secs,
            weather_interval_secs: cfg.timing.weather_interval_secs,
            traffic_interval_secs: cfg.timing.traffic_interval_secs,
        },
    )
    .await;

    // ── Background refresh ───────────────────────────────────────────
    let (report_tx, mut report_rx) = mpsc::unbounded_channel::<RefreshReport>();
    service.start(Some(report_tx)).await;

    let report_journal = event_journal.clone();
    let report_service = service.clone();
    let report_handle = tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            info!(
                "{} cycle: updated={} cached={} failed={} ({}ms)",
                report.domain,
                report.updated(),
                report.cached(),
                report.failed(),
                report.elapsed_ms,
            );
            for event in BoardEvent::from_report(&report) {
                record(&report_journal, event).await;
            }
            if report.domain == Domain::Lift {
                log_ranking(&report_service.ranked());
            }
        }
    });

    let hb_journal = event_journal.clone();
    let hb_service = service.clone();
    let hb_interval = Duration::from_secs(cfg.timing.heartbeat_interval_secs);
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(hb_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let stats = hb_service.cache_stats();
            info!(
                "HEARTBEAT: lift={}/{} weather={}/{} traffic={}/{} (valid/total)",
                stats.lift.valid,
                stats.lift.total,
                stats.weather.valid,
                stats.weather.total,
                stats.traffic.valid,
                stats.traffic.total,
            );
            let running = hb_service.is_running().await;
            record(&hb_journal, BoardEvent::Heartbeat { cache: stats, running }).await;
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────────
    info!("Resort board is running. Press Ctrl+C to stop.");

    let shutdown_reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            "ctrl_c"
        }
        r = report_handle => {
            error!("Report task exited: {:?}", r);
            "report_task_exit"
        }
        r = heartbeat_handle => {
            error!("Heartbeat task exited: {:?}", r);
            "heartbeat_task_exit"
        }
    };

    service.stop().await;

    record(
        &event_journal,
        BoardEvent::BoardShutdown {
            reason: shutdown_reason.to_string(),
        },
    )
    .await;

    info!("Resort board stopped.");
}
