//! Google Distance Matrix client.
//!
//! Resolves drive time with traffic from one origin to many resorts and
//! converts rows to the shared `TrafficSnapshot` format.

pub mod rate_limit;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::{OriginConfig, TrafficSourceConfig};
use common::{Error, Result, TrafficSnapshot};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use rate_limit::RateLimiter;

/// Destinations per Distance Matrix request.
pub const MAX_DESTINATIONS_PER_REQUEST: usize = 25;

/// A resort as a traffic destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub resort_id: String,
    pub lat: f64,
    pub lon: f64,
}

/// Traffic collaborator: `travel_times(origin, destinations)`.
#[async_trait]
pub trait TrafficSource: Send + Sync {
    /// Snapshots keyed by resort id. Destinations the upstream could not
    /// route are omitted.
    async fn travel_times(
        &self,
        origin: &OriginConfig,
        destinations: &[Destination],
        deadline: Instant,
    ) -> Result<HashMap<String, TrafficSnapshot>>;

    fn source_url(&self) -> &str;

    /// Largest batch a single call accepts.
    fn max_batch(&self) -> usize {
        MAX_DESTINATIONS_PER_REQUEST
    }
}

/// Distance Matrix API client.
#[derive(Debug, Clone)]
pub struct DistanceMatrixClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: RateLimiter,
}

// ── Distance Matrix response types ────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MatrixResponse {
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub rows: Vec<MatrixRow>,
}

#[derive(Debug, Deserialize)]
pub struct MatrixRow {
    #[serde(default)]
    pub elements: Vec<MatrixElement>,
}

#[derive(Debug, Deserialize)]
pub struct MatrixElement {
    pub status: String,
    #[serde(default)]
    pub duration: Option<TextValue>,
    #[serde(default)]
    pub duration_in_traffic: Option<TextValue>,
    #[serde(default)]
    pub distance: Option<TextValue>,
}

#[derive(Debug, Deserialize)]
pub struct TextValue {
    #[serde(default)]
    pub text: String,
    pub value: u64,
}

// ── Implementation ────────────────────────────────────────────────────

impl DistanceMatrixClient {
    pub fn new(config: &TrafficSourceConfig, api_key: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(Error::Config("traffic client requires an API key".into()));
        }

        let client = reqwest::Client::builder()
            .user_agent("resort-board/0.1 (lift status aggregator)")
            .pool_max_idle_per_host(2)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build traffic HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
            limiter: RateLimiter::per_minute(config.requests_per_minute),
        })
    }

    pub async fn fetch_matrix(
        &self,
        origin: &OriginConfig,
        destinations: &[Destination],
        deadline: Instant,
    ) -> Result<MatrixResponse> {
        let joined = destinations
            .iter()
            .map(|d| format!("{},{}", d.lat, d.lon))
            .collect::<Vec<_>>()
            .join("|");
        let query = [
            ("origins", format!("{},{}", origin.lat, origin.lon)),
            ("destinations", joined),
            ("departure_time", "now".to_string()),
            ("units", "metric".to_string()),
            ("key", self.api_key.clone()),
        ];

        // Waiting for budget counts against the caller's deadline.
        self.limiter.wait().await;

        debug!(
            "Fetching Distance Matrix: {} destinations from {}",
            destinations.len(),
            origin.name
        );

        let resp = self
            .client
            .get(&self.base_url)
            .query(&query)
            .timeout(deadline.saturating_duration_since(Instant::now()))
            .send()
            .await
            .map_err(|e| Error::Traffic(format!("HTTP error: {e}")))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Traffic(format!(
                "Distance Matrix returned {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        resp.json()
            .await
            .map_err(|e| Error::Traffic(format!("JSON parse error: {e}")))
    }
}

#[async_trait]
impl TrafficSource for DistanceMatrixClient {
    async fn travel_times(
        &self,
        origin: &OriginConfig,
        destinations: &[Destination],
        deadline: Instant,
    ) -> Result<HashMap<String, TrafficSnapshot>> {
        if destinations.is_empty() {
            return Ok(HashMap::new());
        }
        let matrix = self.fetch_matrix(origin, destinations, deadline).await?;
        to_snapshots(destinations, &matrix, Utc::now())
    }

    fn source_url(&self) -> &str {
        &self.base_url
    }
}

/// Pair matrix elements with their destinations.
fn to_snapshots(
    destinations: &[Destination],
    matrix: &MatrixResponse,
    now: DateTime<Utc>,
) -> Result<HashMap<String, TrafficSnapshot>> {
    if matrix.status != "OK" {
        return Err(Error::Traffic(format!(
            "Distance Matrix status {}: {}",
            matrix.status,
            matrix.error_message.as_deref().unwrap_or("no message")
        )));
    }

    let Some(row) = matrix.rows.first() else {
        return Err(Error::Traffic("Distance Matrix returned no rows".into()));
    };
    if row.elements.len() != destinations.len() {
        return Err(Error::Traffic(format!(
            "Distance Matrix returned {} elements for {} destinations",
            row.elements.len(),
            destinations.len()
        )));
    }

    let mut out = HashMap::new();
    for (dest, element) in destinations.iter().zip(&row.elements) {
        if element.status != "OK" {
            warn!("No route to {}: {}", dest.resort_id, element.status);
            continue;
        }
        let (Some(base), Some(distance)) = (&element.duration, &element.distance) else {
            warn!("Incomplete route element for {}", dest.resort_id);
            continue;
        };
        let with_traffic = element
            .duration_in_traffic
            .as_ref()
            .map(|d| d.value)
            .unwrap_or(base.value);

        out.insert(
            dest.resort_id.clone(),
            TrafficSnapshot {
                resort_id: dest.resort_id.clone(),
                travel_time_secs: with_traffic,
                traffic_delay_secs: with_traffic.saturating_sub(base.value),
                distance_km: distance.value as f64 / 1000.0,
                recent_samples: VecDeque::new(),
                captured_at: now,
            },
        );
    }

    Ok(out)
}
