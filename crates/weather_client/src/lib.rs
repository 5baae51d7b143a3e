//! Open-Meteo forecast client.
//!
//! Fetches current conditions and a short daily forecast for a coordinate
//! and converts them to the shared `WeatherSnapshot` format.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::config::WeatherSourceConfig;
use common::{CurrentConditions, DailyForecast, Error, Result, WeatherSnapshot};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

const CURRENT_FIELDS: &str =
    "temperature_2m,wind_speed_10m,precipitation_probability,snow_depth,weather_code";
const DAILY_FIELDS: &str = "temperature_2m_max,temperature_2m_min,precipitation_sum,snowfall_sum,wind_speed_10m_max,weather_code";

/// Weather collaborator: `forecast(lat, lon)`.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// `Ok(None)` means the upstream had nothing for this location.
    async fn forecast(
        &self,
        resort_id: &str,
        lat: f64,
        lon: f64,
        deadline: Instant,
    ) -> Result<Option<WeatherSnapshot>>;

    fn source_url(&self) -> &str;
}

/// Open-Meteo API client.
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
    forecast_days: u32,
}

// ── Open-Meteo response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ForecastResponse {
    #[serde(default)]
    pub current: Option<CurrentBlock>,
    #[serde(default)]
    pub daily: Option<DailyBlock>,
}

#[derive(Debug, Deserialize)]
pub struct CurrentBlock {
    #[serde(default)]
    pub temperature_2m: Option<f64>,
    #[serde(default)]
    pub wind_speed_10m: Option<f64>,
    /// Percent.
    #[serde(default)]
    pub precipitation_probability: Option<f64>,
    /// Metres.
    #[serde(default)]
    pub snow_depth: Option<f64>,
    #[serde(default)]
    pub weather_code: Option<u16>,
}

/// Column-oriented daily forecast; every vector is indexed by `time`.
#[derive(Debug, Deserialize)]
pub struct DailyBlock {
    #[serde(default)]
    pub time: Vec<String>,
    #[serde(default)]
    pub temperature_2m_max: Vec<Option<f64>>,
    #[serde(default)]
    pub temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    pub precipitation_sum: Vec<Option<f64>>,
    #[serde(default)]
    pub snowfall_sum: Vec<Option<f64>>,
    #[serde(default)]
    pub wind_speed_10m_max: Vec<Option<f64>>,
    #[serde(default)]
    pub weather_code: Vec<Option<u16>>,
}

// ── Implementation ────────────────────────────────────────────────────

impl OpenMeteoClient {
    pub fn new(config: &WeatherSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("resort-board/0.1 (lift status aggregator)")
            .pool_max_idle_per_host(4)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build weather HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            forecast_days: config.forecast_days,
        })
    }

    /// Fetch the raw forecast payload for a coordinate.
    pub async fn fetch_forecast(
        &self,
        lat: f64,
        lon: f64,
        deadline: Instant,
    ) -> Result<ForecastResponse> {
        let query = [
            ("latitude", lat.to_string()),
            ("longitude", lon.to_string()),
            ("current", CURRENT_FIELDS.to_string()),
            ("daily", DAILY_FIELDS.to_string()),
            ("forecast_days", self.forecast_days.to_string()),
            ("timezone", "UTC".to_string()),
        ];

        debug!("Fetching Open-Meteo forecast: {} lat={} lon={}", self.base_url, lat, lon);

        let resp = self
            .client
            .get(&self.base_url)
            .query(&query)
            .timeout(deadline.saturating_duration_since(Instant::now()))
            .send()
            .await
            .map_err(|e| Error::Weather(format!("HTTP error for ({lat},{lon}): {e}")))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Weather(format!(
                "Open-Meteo returned {} for ({lat},{lon}): {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Weather(format!("JSON parse error for ({lat},{lon}): {e}")))
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    async fn forecast(
        &self,
        resort_id: &str,
        lat: f64,
        lon: f64,
        deadline: Instant,
    ) -> Result<Option<WeatherSnapshot>> {
        let payload = self.fetch_forecast(lat, lon, deadline).await?;
        Ok(summarize(resort_id, Utc::now(), &payload))
    }

    fn source_url(&self) -> &str {
        &self.base_url
    }
}

fn column<T: Copy>(values: &[Option<T>], idx: usize) -> Option<T> {
    values.get(idx).copied().flatten()
}

/// Convert a payload into a snapshot. Returns `None` when the payload has no
/// current temperature, which Open-Meteo does for out-of-range coordinates.
fn summarize(
    resort_id: &str,
    now: DateTime<Utc>,
    payload: &ForecastResponse,
) -> Option<WeatherSnapshot> {
    let current = payload.current.as_ref()?;
    let temperature_c = current.temperature_2m?;

    let mut forecast_days = Vec::new();
    if let Some(daily) = &payload.daily {
        for (idx, raw_date) in daily.time.iter().enumerate() {
            let Ok(date) = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d") else {
                continue;
            };
            let (Some(max), Some(min)) = (
                column(&daily.temperature_2m_max, idx),
                column(&daily.temperature_2m_min, idx),
            ) else {
                continue;
            };
            forecast_days.push(DailyForecast {
                date,
                temp_max_c: max,
                temp_min_c: min,
                precipitation_mm: column(&daily.precipitation_sum, idx).unwrap_or(0.0),
                snowfall_cm: column(&daily.snowfall_sum, idx).unwrap_or(0.0),
                wind_max_kmh: column(&daily.wind_speed_10m_max, idx).unwrap_or(0.0),
                weather_code: column(&daily.weather_code, idx),
            });
        }
    }

    Some(WeatherSnapshot {
        resort_id: resort_id.to_string(),
        forecast_days,
        current: CurrentConditions {
            temperature_c,
            wind_kmh: current.wind_speed_10m.unwrap_or(0.0),
            precipitation_probability: current
                .precipitation_probability
                .map(|p| (p / 100.0).clamp(0.0, 1.0))
                .unwrap_or(0.0),
            snow_depth_cm: current.snow_depth.map(|m| (m * 100.0).max(0.0)),
            weather_code: current.weather_code,
        },
        captured_at: now,
    })
}
