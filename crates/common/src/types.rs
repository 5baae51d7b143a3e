//! Domain types shared across the board.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of traffic samples retained per resort.
pub const TRAFFIC_SAMPLE_CAPACITY: usize = 12;

// ── Domains & freshness ───────────────────────────────────────────────

/// The three independently cached upstream domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Lift,
    Weather,
    Traffic,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Lift, Domain::Weather, Domain::Traffic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lift => "lift",
            Self::Weather => "weather",
            Self::Traffic => "traffic",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How stale a domain's data is relative to that domain's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl Freshness {
    /// Classify an age against a domain's fresh window and its cache TTL.
    ///
    /// Negative ages (clock skew) count as fresh.
    pub fn classify(age: chrono::Duration, fresh_secs: u64, ttl_secs: u64) -> Self {
        let age_secs = age.num_seconds().max(0) as u64;
        if age_secs <= fresh_secs {
            Freshness::Fresh
        } else if age_secs <= ttl_secs {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Classify a capture time; missing data is `Expired`.
    pub fn of(
        captured_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        fresh_secs: u64,
        ttl_secs: u64,
    ) -> Self {
        match captured_at {
            Some(at) => Self::classify(now - at, fresh_secs, ttl_secs),
            None => Freshness::Expired,
        }
    }
}

/// Freshness of each domain for one resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFreshness {
    pub lift: Freshness,
    pub weather: Freshness,
    pub traffic: Freshness,
}

impl DomainFreshness {
    pub fn all(freshness: Freshness) -> Self {
        Self {
            lift: freshness,
            weather: freshness,
            traffic: freshness,
        }
    }

    pub fn get(&self, domain: Domain) -> Freshness {
        match domain {
            Domain::Lift => self.lift,
            Domain::Weather => self.weather,
            Domain::Traffic => self.traffic,
        }
    }
}

/// Values that carry the upstream capture time recorded in cache history.
pub trait Captured {
    fn captured_at(&self) -> Option<DateTime<Utc>>;
}

// ── Lift status ───────────────────────────────────────────────────────

/// Operating state of a lift or slope. Anything else fails deserialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacilityStatus {
    Open,
    Closed,
    Scheduled,
    Hold,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlopeDifficulty {
    Beginner,
    Easy,
    Intermediate,
    Difficult,
    Expert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftFacility {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub status: FacilityStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlopeFacility {
    pub name: String,
    #[serde(default)]
    pub difficulty: Option<SlopeDifficulty>,
    pub status: FacilityStatus,
}

/// Snow depths reported by the resort itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnowReading {
    #[serde(default)]
    pub base_cm: Option<f64>,
    #[serde(default)]
    pub summit_cm: Option<f64>,
    #[serde(default)]
    pub new_snow_cm: Option<f64>,
}

impl SnowReading {
    /// Best single depth figure: summit if reported, else base.
    pub fn depth_cm(&self) -> Option<f64> {
        self.summit_cm.or(self.base_cm)
    }
}

/// Lift/piste status as produced by a resort adapter.
///
/// Counts are signed so that a malformed upstream value survives parsing
/// and is rejected by validation instead of being silently wrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftStatusSnapshot {
    pub resort_id: String,
    #[serde(default)]
    pub lifts_open: Option<i64>,
    #[serde(default)]
    pub lifts_total: Option<i64>,
    #[serde(default)]
    pub lifts: Vec<LiftFacility>,
    #[serde(default)]
    pub slopes: Vec<SlopeFacility>,
    #[serde(default)]
    pub snow: Option<SnowReading>,
    #[serde(default)]
    pub source_url: String,
    pub captured_at: DateTime<Utc>,
}

impl LiftStatusSnapshot {
    /// Open lifts: the explicit count, else derived from the detailed list.
    pub fn open_count(&self) -> Option<i64> {
        self.lifts_open.or_else(|| {
            (!self.lifts.is_empty()).then(|| {
                self.lifts
                    .iter()
                    .filter(|l| l.status == FacilityStatus::Open)
                    .count() as i64
            })
        })
    }

    /// Total lifts: the explicit count, else the detailed list length.
    pub fn total_count(&self) -> Option<i64> {
        self.lifts_total
            .or_else(|| (!self.lifts.is_empty()).then(|| self.lifts.len() as i64))
    }
}

impl Captured for LiftStatusSnapshot {
    fn captured_at(&self) -> Option<DateTime<Utc>> {
        Some(self.captured_at)
    }
}

// ── Weather ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub temp_max_c: f64,
    pub temp_min_c: f64,
    #[serde(default)]
    pub precipitation_mm: f64,
    #[serde(default)]
    pub snowfall_cm: f64,
    #[serde(default)]
    pub wind_max_kmh: f64,
    #[serde(default)]
    pub weather_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentConditions {
    pub temperature_c: f64,
    #[serde(default)]
    pub wind_kmh: f64,
    /// Probability in [0, 1].
    #[serde(default)]
    pub precipitation_probability: f64,
    #[serde(default)]
    pub snow_depth_cm: Option<f64>,
    #[serde(default)]
    pub weather_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub resort_id: String,
    pub forecast_days: Vec<DailyForecast>,
    pub current: CurrentConditions,
    pub captured_at: DateTime<Utc>,
}

impl WeatherSnapshot {
    /// Approximate on-mountain snow depth derived from the forecast feed.
    ///
    /// Uses the modelled snow depth when present, otherwise the summed
    /// forecast snowfall.
    pub fn estimated_snow_depth_cm(&self) -> Option<f64> {
        if let Some(depth) = self.current.snow_depth_cm {
            return Some(depth.max(0.0));
        }
        let fallen: f64 = self.forecast_days.iter().map(|d| d.snowfall_cm.max(0.0)).sum();
        (fallen > 0.0).then_some(fallen)
    }
}

impl Captured for WeatherSnapshot {
    fn captured_at(&self) -> Option<DateTime<Utc>> {
        Some(self.captured_at)
    }
}

// ── Traffic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub at: DateTime<Utc>,
    pub travel_time_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub resort_id: String,
    /// Travel time including current traffic.
    pub travel_time_secs: u64,
    pub traffic_delay_secs: u64,
    pub distance_km: f64,
    #[serde(default)]
    pub recent_samples: VecDeque<TrafficSample>,
    pub captured_at: DateTime<Utc>,
}

impl TrafficSnapshot {
    /// Carry the previous snapshot's samples forward and append this one,
    /// dropping the oldest beyond `TRAFFIC_SAMPLE_CAPACITY`.
    pub fn with_history(mut self, previous: Option<&TrafficSnapshot>) -> Self {
        let mut samples = previous
            .map(|p| p.recent_samples.clone())
            .unwrap_or_default();
        samples.push_back(TrafficSample {
            at: self.captured_at,
            travel_time_secs: self.travel_time_secs,
        });
        while samples.len() > TRAFFIC_SAMPLE_CAPACITY {
            samples.pop_front();
        }
        self.recent_samples = samples;
        self
    }
}

impl Captured for TrafficSnapshot {
    fn captured_at(&self) -> Option<DateTime<Utc>> {
        Some(self.captured_at)
    }
}
