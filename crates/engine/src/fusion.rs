//! Merge static resort config with the three cached domains into one view.
//!
//! Fusion is read-only: it never calls upstream and never writes a cache.
//! Static config never stands in for live detail. An absent lift list stays
//! `Facilities::Absent` even when a brochure lift count is configured.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::{AppConfig, CacheConfig, OriginConfig, ResortClass, ResortConfig};
use common::{
    Domain, DomainFreshness, Freshness, LiftFacility, SlopeFacility, TrafficSample,
    WeatherSnapshot,
};
use serde::Serialize;

use crate::cache::Caches;
use crate::orchestrator::HealthBook;

/// Road distance over great-circle distance.
const ROAD_FACTOR: f64 = 1.3;
/// Average speed assumed for distance-based travel estimates.
const ESTIMATE_SPEED_KMH: f64 = 70.0;
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Detailed per-facility data, or nothing. Never a bare count.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum Facilities<T> {
    Detailed(Vec<T>),
    Absent,
}

impl<T> Facilities<T> {
    fn from_live(items: &[T]) -> Self
    where
        T: Clone,
    {
        if items.is_empty() {
            Self::Absent
        } else {
            Self::Detailed(items.to_vec())
        }
    }

    pub fn is_detailed(&self) -> bool {
        matches!(self, Self::Detailed(_))
    }
}

/// Where a lift total came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "count", rename_all = "snake_case")]
pub enum LiftCount {
    Live(u32),
    /// Brochure figure from static config.
    Static(u32),
}

impl LiftCount {
    pub fn value(&self) -> u32 {
        match self {
            Self::Live(n) | Self::Static(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnowSource {
    /// Reported by the resort's lift-status feed.
    Measured,
    /// Derived from the weather forecast.
    Estimated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnowView {
    pub depth_cm: f64,
    pub new_snow_cm: Option<f64>,
    pub source: SnowSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateBasis {
    StaticConfig,
    Distance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TravelEstimate {
    Live {
        travel_time_secs: u64,
        traffic_delay_secs: u64,
        distance_km: f64,
        recent_samples: Vec<TrafficSample>,
    },
    Estimated {
        travel_time_secs: u64,
        basis: EstimateBasis,
    },
}

impl TravelEstimate {
    pub fn travel_time_secs(&self) -> u64 {
        match self {
            Self::Live { travel_time_secs, .. } | Self::Estimated { travel_time_secs, .. } => {
                *travel_time_secs
            }
        }
    }

    pub fn minutes(&self) -> f64 {
        self.travel_time_secs() as f64 / 60.0
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Change in travel time across the retained samples, oldest to newest.
    pub fn trend_secs(&self) -> Option<i64> {
        match self {
            Self::Live { recent_samples, .. } if recent_samples.len() >= 2 => {
                let first = recent_samples.first()?.travel_time_secs as i64;
                let last = recent_samples.last()?.travel_time_secs as i64;
                Some(last - first)
            }
            _ => None,
        }
    }
}

/// Lift-status health of a resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResortStatus {
    /// The most recent lift-status refresh succeeded.
    Ok,
    /// The most recent lift-status refresh failed.
    Error,
    /// No lift-status refresh has succeeded or failed yet.
    NoData,
}

/// Everything known about one resort, merged across sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResortView {
    pub resort_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub classification: ResortClass,
    pub day_pass_price: Option<f64>,

    pub status: ResortStatus,
    pub last_error: Option<String>,

    pub lifts_open: Option<u32>,
    pub lifts_total: Option<LiftCount>,
    pub lifts: Facilities<LiftFacility>,
    pub slopes: Facilities<SlopeFacility>,

    pub snow: Option<SnowView>,
    pub weather: Option<WeatherSnapshot>,
    pub travel: TravelEstimate,

    pub freshness: DomainFreshness,
    pub lift_captured_at: Option<DateTime<Utc>>,
    pub weather_captured_at: Option<DateTime<Utc>>,
    pub traffic_captured_at: Option<DateTime<Utc>>,
}

/// Builds fused views from the shared caches.
#[derive(Debug, Clone)]
pub struct FusionEngine {
    resorts: Arc<Vec<ResortConfig>>,
    index: HashMap<String, usize>,
    origin: OriginConfig,
    cache_config: CacheConfig,
    caches: Arc<Caches>,
    health: Arc<HealthBook>,
}

impl FusionEngine {
    pub fn new(config: &AppConfig, caches: Arc<Caches>, health: Arc<HealthBook>) -> Self {
        let index = config
            .resorts
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self {
            resorts: Arc::new(config.resorts.clone()),
            index,
            origin: config.origin.clone(),
            cache_config: config.cache.clone(),
            caches,
            health,
        }
    }

    pub fn fused_view(&self, resort_id: &str) -> Option<FusedResortView> {
        self.fused_view_at(resort_id, Utc::now())
    }

    /// Views for every configured resort, in config order.
    pub fn fused_views(&self) -> Vec<FusedResortView> {
        let now = Utc::now();
        self.resorts
            .iter()
            .filter_map(|r| self.fused_view_at(&r.id, now))
            .collect()
    }

    /// `None` only for an id that is not configured.
    pub fn fused_view_at(&self, resort_id: &str, now: DateTime<Utc>) -> Option<FusedResortView> {
        let resort = &self.resorts[*self.index.get(resort_id)?];
        let lift = self.caches.lift.get_at(resort_id, now);
        let weather = self.caches.weather.get_at(resort_id, now);
        let traffic = self.caches.traffic.get_at(resort_id, now);
        let health = self.health.get(Domain::Lift, resort_id);

        let (status, last_error) = match &health {
            Some(h) if h.ok => (ResortStatus::Ok, None),
            Some(h) => (ResortStatus::Error, h.last_error.clone()),
            None if lift.is_some() => (ResortStatus::Ok, None),
            None => (ResortStatus::NoData, None),
        };

        let freshness = DomainFreshness {
            lift: self.freshness(Domain::Lift, lift.as_ref().map(|l| l.captured_at), now),
            weather: self.freshness(Domain::Weather, weather.as_ref().map(|w| w.captured_at), now),
            traffic: self.freshness(Domain::Traffic, traffic.as_ref().map(|t| t.captured_at), now),
        };

        // Live counts win; the brochure total only fills an empty slot.
        let lifts_open = lift
            .as_ref()
            .and_then(|l| l.open_count())
            .and_then(|n| u32::try_from(n).ok());
        let lifts_total = lift
            .as_ref()
            .and_then(|l| l.total_count())
            .and_then(|n| u32::try_from(n).ok())
            .map(LiftCount::Live)
            .or(resort.lifts_total.map(LiftCount::Static));

        let (lifts, slopes) = match &lift {
            Some(l) => (Facilities::from_live(&l.lifts), Facilities::from_live(&l.slopes)),
            None => (Facilities::Absent, Facilities::Absent),
        };

        let measured = if status == ResortStatus::Error {
            None
        } else {
            lift.as_ref()
                .and_then(|l| l.snow.as_ref())
                .and_then(|s| {
                    s.depth_cm().map(|depth_cm| SnowView {
                        depth_cm,
                        new_snow_cm: s.new_snow_cm,
                        source: SnowSource::Measured,
                    })
                })
        };
        let snow = measured.or_else(|| {
            weather.as_ref().and_then(|w| {
                w.estimated_snow_depth_cm().map(|depth_cm| SnowView {
                    depth_cm,
                    new_snow_cm: w.forecast_days.first().map(|d| d.snowfall_cm),
                    source: SnowSource::Estimated,
                })
            })
        });

        let travel = match &traffic {
            Some(t) => TravelEstimate::Live {
                travel_time_secs: t.travel_time_secs,
                traffic_delay_secs: t.traffic_delay_secs,
                distance_km: t.distance_km,
                recent_samples: t.recent_samples.iter().copied().collect(),
            },
            None => self.estimate_travel(resort),
        };

        Some(FusedResortView {
            resort_id: resort.id.clone(),
            name: resort.name.clone(),
            lat: resort.lat,
            lon: resort.lon,
            classification: resort.classification,
            day_pass_price: resort.day_pass_price,
            status,
            last_error,
            lifts_open,
            lifts_total,
            lifts,
            slopes,
            snow,
            lift_captured_at: lift.as_ref().map(|l| l.captured_at),
            weather_captured_at: weather.as_ref().map(|w| w.captured_at),
            traffic_captured_at: traffic.as_ref().map(|t| t.captured_at),
            weather,
            travel,
            freshness,
        })
    }

    fn freshness(&self, domain: Domain, captured_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Freshness {
        let cfg = self.cache_config.for_domain(domain);
        Freshness::of(captured_at, now, cfg.fresh_secs, cfg.ttl_secs)
    }

    fn estimate_travel(&self, resort: &ResortConfig) -> TravelEstimate {
        match resort.static_travel_minutes {
            Some(minutes) => TravelEstimate::Estimated {
                travel_time_secs: u64::from(minutes) * 60,
                basis: EstimateBasis::StaticConfig,
            },
            None => {
                let km = haversine_km(self.origin.lat, self.origin.lon, resort.lat, resort.lon)
                    * ROAD_FACTOR;
                TravelEstimate::Estimated {
                    travel_time_secs: (km / ESTIMATE_SPEED_KMH * 3600.0).round() as u64,
                    basis: EstimateBasis::Distance,
                }
            }
        }
    }
}

/// Great-circle distance between two coordinates.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::AdapterSpec;
    use common::{
        CurrentConditions, FacilityStatus, LiftStatusSnapshot, SnowReading, TrafficSnapshot,
    };
    use std::collections::VecDeque;

    fn make_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.resorts = vec![
            ResortConfig {
                id: "alpine-1".into(),
                name: "Alpine One".into(),
                lat: 46.84,
                lon: 9.26,
                day_pass_price: Some(70.0),
                classification: ResortClass::AllMountain,
                lifts_total: Some(12),
                static_travel_minutes: Some(95),
                adapter: AdapterSpec::None,
            },
            ResortConfig {
                id: "alpine-2".into(),
                name: "Alpine Two".into(),
                lat: 46.82,
                lon: 8.41,
                day_pass_price: None,
                classification: ResortClass::Glacier,
                lifts_total: None,
                static_travel_minutes: None,
                adapter: AdapterSpec::None,
            },
        ];
        config
    }

    fn make_engine(config: &AppConfig) -> (FusionEngine, Arc<Caches>, Arc<HealthBook>) {
        let caches = Arc::new(Caches::new(&config.cache, config.utc_offset_minutes));
        let health = Arc::new(HealthBook::new());
        let engine = FusionEngine::new(config, Arc::clone(&caches), Arc::clone(&health));
        (engine, caches, health)
    }

    fn make_lift(at: DateTime<Utc>) -> LiftStatusSnapshot {
        LiftStatusSnapshot {
            resort_id: "alpine-1".into(),
            lifts_open: Some(8),
            lifts_total: Some(10),
            lifts: vec![LiftFacility {
                name: "Gondola".into(),
                kind: None,
                status: FacilityStatus::Open,
            }],
            slopes: vec![],
            snow: Some(SnowReading {
                base_cm: Some(60.0),
                summit_cm: Some(140.0),
                new_snow_cm: Some(10.0),
            }),
            source_url: "http://feed.test".into(),
            captured_at: at,
        }
    }

    fn make_weather(at: DateTime<Utc>) -> WeatherSnapshot {
        WeatherSnapshot {
            resort_id: "alpine-1".into(),
            forecast_days: vec![],
            current: CurrentConditions {
                temperature_c: -4.0,
                wind_kmh: 15.0,
                precipitation_probability: 0.2,
                snow_depth_cm: Some(95.0),
                weather_code: None,
            },
            captured_at: at,
        }
    }

    #[test]
    fn test_empty_caches_yield_static_view() {
        let config = make_config();
        let (engine, _, _) = make_engine(&config);

        let view = engine.fused_view("alpine-1").expect("configured resort");
        assert_eq!(view.status, ResortStatus::NoData);
        assert_eq!(view.lifts, Facilities::Absent);
        assert_eq!(view.lifts_total, Some(LiftCount::Static(12)));
        assert_eq!(view.lifts_open, None);
        assert!(view.snow.is_none());
        assert_eq!(view.freshness, DomainFreshness::all(Freshness::Expired));
        assert_eq!(
            view.travel,
            TravelEstimate::Estimated {
                travel_time_secs: 95 * 60,
                basis: EstimateBasis::StaticConfig
            }
        );
        assert!(engine.fused_view("nowhere").is_none());
    }

    #[test]
    fn test_live_lift_data_wins() {
        let config = make_config();
        let (engine, caches, health) = make_engine(&config);
        let now = Utc::now();
        caches.lift.set_at("alpine-1", make_lift(now), now);
        health.record_ok(Domain::Lift, "alpine-1", now);

        let view = engine.fused_view_at("alpine-1", now).expect("view");
        assert_eq!(view.status, ResortStatus::Ok);
        assert_eq!(view.lifts_open, Some(8));
        assert_eq!(view.lifts_total, Some(LiftCount::Live(10)));
        assert!(view.lifts.is_detailed());
        assert_eq!(view.slopes, Facilities::Absent);
        let snow = view.snow.expect("measured snow");
        assert_eq!(snow.source, SnowSource::Measured);
        assert_eq!(snow.depth_cm, 140.0);
        assert_eq!(view.freshness.lift, Freshness::Fresh);
    }

    #[test]
    fn test_errored_resort_keeps_last_good_detail_and_estimates_snow() {
        let config = make_config();
        let (engine, caches, health) = make_engine(&config);
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(45);
        caches.lift.set_at("alpine-1", make_lift(earlier), earlier);
        caches.weather.set_at("alpine-1", make_weather(now), now);
        health.record_error(Domain::Lift, "alpine-1", "timed out", now);

        let view = engine.fused_view_at("alpine-1", now).expect("view");
        assert_eq!(view.status, ResortStatus::Error);
        assert_eq!(view.last_error.as_deref(), Some("timed out"));
        // Last-known-good detail stays; it is never replaced by the brochure count.
        assert!(view.lifts.is_detailed());
        assert_eq!(view.lifts_total, Some(LiftCount::Live(10)));
        assert_eq!(view.freshness.lift, Freshness::Stale);

        let snow = view.snow.expect("estimated snow");
        assert_eq!(snow.source, SnowSource::Estimated);
        assert_eq!(snow.depth_cm, 95.0);
    }

    #[test]
    fn test_errored_resort_without_cache_has_no_lift_list() {
        let config = make_config();
        let (engine, _, health) = make_engine(&config);
        health.record_error(Domain::Lift, "alpine-1", "503", Utc::now());

        let view = engine.fused_view("alpine-1").expect("view");
        assert_eq!(view.status, ResortStatus::Error);
        assert_eq!(view.lifts, Facilities::Absent);
        assert_eq!(view.lifts_total, Some(LiftCount::Static(12)));
    }

    #[test]
    fn test_live_traffic_and_distance_estimate() {
        let config = make_config();
        let (engine, caches, _) = make_engine(&config);
        let now = Utc::now();
        let snap = TrafficSnapshot {
            resort_id: "alpine-1".into(),
            travel_time_secs: 6000,
            traffic_delay_secs: 600,
            distance_km: 130.0,
            recent_samples: VecDeque::new(),
            captured_at: now,
        }
        .with_history(None);
        caches.traffic.set_at("alpine-1", snap, now);

        let live = engine.fused_view_at("alpine-1", now).expect("view");
        assert!(live.travel.is_live());
        assert_eq!(live.travel.travel_time_secs(), 6000);
        assert_eq!(live.freshness.traffic, Freshness::Fresh);

        // alpine-2 has no static travel time: distance-based estimate.
        let estimated = engine.fused_view_at("alpine-2", now).expect("view");
        match estimated.travel {
            TravelEstimate::Estimated {
                travel_time_secs,
                basis,
            } => {
                assert_eq!(basis, EstimateBasis::Distance);
                assert!(travel_time_secs > 30 * 60 && travel_time_secs < 3 * 3600);
            }
            other => panic!("expected estimate, got {other:?}"),
        }
    }

    #[test]
    fn test_fused_views_in_config_order() {
        let config = make_config();
        let (engine, _, _) = make_engine(&config);
        let ids: Vec<String> = engine.fused_views().into_iter().map(|v| v.resort_id).collect();
        assert_eq!(ids, vec!["alpine-1", "alpine-2"]);
    }

    #[test]
    fn test_haversine_zurich_to_engelberg() {
        let km = haversine_km(47.3769, 8.5417, 46.8198, 8.4075);
        assert!((km - 62.7).abs() < 2.0, "got {km}");
    }
}
