//! Board configuration types.

use serde::{Deserialize, Serialize};

use crate::types::Domain;

/// Top-level board configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where users travel from; used for traffic queries and travel estimates.
    #[serde(default = "default_origin")]
    pub origin: OriginConfig,

    /// Offset of the resorts' local time from UTC, in minutes. Drives the
    /// calendar day for cache history and the scheduler's time windows.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    /// Resorts to track.
    #[serde(default = "default_resorts")]
    pub resorts: Vec<ResortConfig>,

    /// Upstream fetch parameters.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Per-domain cache thresholds and persistence.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Refresh cadences (seconds) and time windows.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Ranking weights and curve parameters.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Weather collaborator settings.
    #[serde(default)]
    pub weather_source: WeatherSourceConfig,

    /// Traffic collaborator settings.
    #[serde(default)]
    pub traffic_source: TrafficSourceConfig,

    /// Google Maps API key (traffic is disabled when empty).
    #[serde(default)]
    pub google_maps_api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// Static, read-only description of one resort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResortConfig {
    /// Stable identifier, e.g. "alpine-1".
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Adult day-pass price in the board's currency.
    #[serde(default)]
    pub day_pass_price: Option<f64>,
    #[serde(default)]
    pub classification: ResortClass,
    /// Lift count from the resort's brochure. Never stands in for live data.
    #[serde(default)]
    pub lifts_total: Option<u32>,
    /// Typical drive time when no live traffic is available.
    #[serde(default)]
    pub static_travel_minutes: Option<u32>,
    /// Lift-status adapter for this resort.
    #[serde(default)]
    pub adapter: AdapterSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResortClass {
    Family,
    #[default]
    AllMountain,
    Glacier,
    Freeride,
}

/// Which lift-status adapter variant serves a resort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    /// No adapter: the resort is listed from static config only.
    #[default]
    None,
    /// An endpoint that already returns a `LiftStatusSnapshot` as JSON.
    JsonFeed { url: String },
    /// A snapshot stored on disk.
    Fixture { path: String },
}

/// Upstream fetch parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Max in-flight adapter calls.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-call deadline.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Upper bound of the random delay before each fan-out task.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

/// Hard ceiling on simultaneous outbound calls regardless of config.
pub const MAX_CONCURRENCY: usize = 16;

/// Freshness window and cache TTL for one domain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DomainCacheConfig {
    /// Age up to which data counts as fresh.
    pub fresh_secs: u64,
    /// Age after which the cache stops serving the entry.
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_lift_cache")]
    pub lift: DomainCacheConfig,

    #[serde(default = "default_weather_cache")]
    pub weather: DomainCacheConfig,

    #[serde(default = "default_traffic_cache")]
    pub traffic: DomainCacheConfig,

    /// Directory for warm-restart snapshots. Disabled when unset.
    #[serde(default)]
    pub snapshot_dir: Option<String>,

    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl CacheConfig {
    pub fn for_domain(&self, domain: Domain) -> DomainCacheConfig {
        match domain {
            Domain::Lift => self.lift,
            Domain::Weather => self.weather,
            Domain::Traffic => self.traffic,
        }
    }
}

/// Local-time hours during which a domain may refresh, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl ActiveWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Wraps midnight, e.g. 22..6.
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Timing configuration (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_lift_interval")]
    pub lift_interval_secs: u64,

    #[serde(default = "default_weather_interval")]
    pub weather_interval_secs: u64,

    #[serde(default = "default_traffic_interval")]
    pub traffic_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default)]
    pub lift_window: Option<ActiveWindow>,

    #[serde(default)]
    pub weather_window: Option<ActiveWindow>,

    #[serde(default = "default_traffic_window")]
    pub traffic_window: Option<ActiveWindow>,
}

impl TimingConfig {
    pub fn interval_secs(&self, domain: Domain) -> u64 {
        match domain {
            Domain::Lift => self.lift_interval_secs,
            Domain::Weather => self.weather_interval_secs,
            Domain::Traffic => self.traffic_interval_secs,
        }
    }

    pub fn window(&self, domain: Domain) -> Option<ActiveWindow> {
        match domain {
            Domain::Lift => self.lift_window,
            Domain::Weather => self.weather_window,
            Domain::Traffic => self.traffic_window,
        }
    }
}

/// Ranking weights and curve parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_availability_weight")]
    pub availability_weight: f64,
    #[serde(default = "default_travel_weight")]
    pub travel_weight: f64,
    #[serde(default = "default_snow_weight")]
    pub snow_weight: f64,
    #[serde(default = "default_comfort_weight")]
    pub comfort_weight: f64,
    #[serde(default = "default_price_weight")]
    pub price_weight: f64,

    /// Travel time up to which no penalty applies.
    #[serde(default = "default_travel_comfort_minutes")]
    pub travel_comfort_minutes: f64,

    /// Depth at which the snow component saturates.
    #[serde(default = "default_snow_saturation_cm")]
    pub snow_saturation_cm: f64,

    /// Scale applied to weather-estimated snow depth.
    #[serde(default = "default_estimated_snow_factor")]
    pub estimated_snow_factor: f64,

    /// Day-pass price at or below which the price component is 1.
    #[serde(default = "default_price_floor")]
    pub price_floor: f64,

    /// Day-pass price at or above which the price component is 0.
    #[serde(default = "default_price_ceiling")]
    pub price_ceiling: f64,

    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: f64,

    #[serde(default = "default_expired_multiplier")]
    pub expired_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSourceConfig {
    #[serde(default = "default_weather_base_url")]
    pub base_url: String,

    #[serde(default = "default_forecast_days")]
    pub forecast_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSourceConfig {
    #[serde(default = "default_traffic_base_url")]
    pub base_url: String,

    /// Outbound request budget.
    #[serde(default = "default_traffic_requests_per_minute")]
    pub requests_per_minute: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────

fn default_utc_offset_minutes() -> i32 {
    60
}

fn default_concurrency() -> usize {
    4
}
fn default_deadline_secs() -> u64 {
    8
}
fn default_jitter_ms() -> u64 {
    250
}

fn default_lift_cache() -> DomainCacheConfig {
    DomainCacheConfig {
        fresh_secs: 30 * 60,
        ttl_secs: 6 * 3600,
    }
}
fn default_weather_cache() -> DomainCacheConfig {
    DomainCacheConfig {
        fresh_secs: 3 * 3600,
        ttl_secs: 12 * 3600,
    }
}
fn default_traffic_cache() -> DomainCacheConfig {
    DomainCacheConfig {
        fresh_secs: 15 * 60,
        ttl_secs: 2 * 3600,
    }
}
fn default_snapshot_interval() -> u64 {
    300
}
fn default_cleanup_interval() -> u64 {
    600
}

fn default_lift_interval() -> u64 {
    1800
}
fn default_weather_interval() -> u64 {
    3 * 3600
}
fn default_traffic_interval() -> u64 {
    900
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_traffic_window() -> Option<ActiveWindow> {
    Some(ActiveWindow {
        start_hour: 6,
        end_hour: 20,
    })
}

fn default_availability_weight() -> f64 {
    0.40
}
fn default_travel_weight() -> f64 {
    0.20
}
fn default_snow_weight() -> f64 {
    0.20
}
fn default_comfort_weight() -> f64 {
    0.10
}
fn default_price_weight() -> f64 {
    0.10
}
fn default_travel_comfort_minutes() -> f64 {
    90.0
}
fn default_snow_saturation_cm() -> f64 {
    150.0
}
fn default_estimated_snow_factor() -> f64 {
    0.8
}
fn default_price_floor() -> f64 {
    30.0
}
fn default_price_ceiling() -> f64 {
    90.0
}
fn default_stale_multiplier() -> f64 {
    0.7
}
fn default_expired_multiplier() -> f64 {
    0.4
}

fn default_weather_base_url() -> String {
    "https://api.open-meteo.com/v1/forecast".into()
}
fn default_forecast_days() -> u32 {
    3
}
fn default_traffic_base_url() -> String {
    "https://maps.googleapis.com/maps/api/distancematrix/json".into()
}
fn default_traffic_requests_per_minute() -> u32 {
    30
}

fn default_origin() -> OriginConfig {
    OriginConfig {
        name: "Zurich".into(),
        lat: 47.3769,
        lon: 8.5417,
    }
}

fn default_resorts() -> Vec<ResortConfig> {
    vec![
        ResortConfig {
            id: "laax".into(),
            name: "Laax".into(),
            lat: 46.8386,
            lon: 9.2567,
            day_pass_price: Some(89.0),
            classification: ResortClass::AllMountain,
            lifts_total: Some(28),
            static_travel_minutes: Some(95),
            adapter: AdapterSpec::None,
        },
        ResortConfig {
            id: "engelberg".into(),
            name: "Engelberg-Titlis".into(),
            lat: 46.8198,
            lon: 8.4075,
            day_pass_price: Some(79.0),
            classification: ResortClass::Glacier,
            lifts_total: Some(25),
            static_travel_minutes: Some(70),
            adapter: AdapterSpec::None,
        },
        ResortConfig {
            id: "flumserberg".into(),
            name: "Flumserberg".into(),
            lat: 47.0917,
            lon: 9.2833,
            day_pass_price: Some(65.0),
            classification: ResortClass::Family,
            lifts_total: Some(17),
            static_travel_minutes: Some(60),
            adapter: AdapterSpec::None,
        },
    ]
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            deadline_secs: default_deadline_secs(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lift: default_lift_cache(),
            weather: default_weather_cache(),
            traffic: default_traffic_cache(),
            snapshot_dir: None,
            snapshot_interval_secs: default_snapshot_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lift_interval_secs: default_lift_interval(),
            weather_interval_secs: default_weather_interval(),
            traffic_interval_secs: default_traffic_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            lift_window: None,
            weather_window: None,
            traffic_window: default_traffic_window(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            availability_weight: default_availability_weight(),
            travel_weight: default_travel_weight(),
            snow_weight: default_snow_weight(),
            comfort_weight: default_comfort_weight(),
            price_weight: default_price_weight(),
            travel_comfort_minutes: default_travel_comfort_minutes(),
            snow_saturation_cm: default_snow_saturation_cm(),
            estimated_snow_factor: default_estimated_snow_factor(),
            price_floor: default_price_floor(),
            price_ceiling: default_price_ceiling(),
            stale_multiplier: default_stale_multiplier(),
            expired_multiplier: default_expired_multiplier(),
        }
    }
}

impl Default for WeatherSourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_weather_base_url(),
            forecast_days: default_forecast_days(),
        }
    }
}

impl Default for TrafficSourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_traffic_base_url(),
            requests_per_minute: default_traffic_requests_per_minute(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            utc_offset_minutes: default_utc_offset_minutes(),
            resorts: default_resorts(),
            fetch: FetchConfig::default(),
            cache: CacheConfig::default(),
            timing: TimingConfig::default(),
            scoring: ScoringConfig::default(),
            weather_source: WeatherSourceConfig::default(),
            traffic_source: TrafficSourceConfig::default(),
            google_maps_api_key: String::new(),
        }
    }
}
