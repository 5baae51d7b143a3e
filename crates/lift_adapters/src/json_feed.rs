//! Adapter for endpoints that already speak the snapshot format.

use async_trait::async_trait;
use chrono::Utc;
use common::{Error, LiftStatusSnapshot, Result};
use tokio::time::Instant;
use tracing::debug;

use crate::LiftStatusAdapter;

/// Fetches a `LiftStatusSnapshot` as JSON from a fixed URL.
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    client: reqwest::Client,
    resort_id: String,
    url: String,
}

impl JsonFeedAdapter {
    pub fn new(client: reqwest::Client, resort_id: &str, url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("resort {resort_id}: invalid feed url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "resort {resort_id}: feed url must be http(s), got {url}"
            )));
        }

        Ok(Self {
            client,
            resort_id: resort_id.to_string(),
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl LiftStatusAdapter for JsonFeedAdapter {
    async fn fetch(&self, deadline: Instant) -> Result<LiftStatusSnapshot> {
        let budget = deadline.saturating_duration_since(Instant::now());
        debug!("Fetching lift feed for {}: {}", self.resort_id, self.url);

        let resp = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .timeout(budget)
            .send()
            .await
            .map_err(|e| Error::Adapter {
                resort_id: self.resort_id.clone(),
                message: format!("HTTP error: {e}"),
            })?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Adapter {
                resort_id: self.resort_id.clone(),
                message: format!(
                    "feed returned {}: {}",
                    status,
                    body.chars().take(500).collect::<String>()
                ),
            });
        }

        let body = resp.text().await.map_err(|e| Error::Adapter {
            resort_id: self.resort_id.clone(),
            message: format!("body read error: {e}"),
        })?;

        parse_feed(&self.resort_id, &self.url, &body)
    }

    fn source_url(&self) -> &str {
        &self.url
    }
}

/// Parse a feed body, filling in identity fields the feed may omit.
pub(crate) fn parse_feed(resort_id: &str, url: &str, body: &str) -> Result<LiftStatusSnapshot> {
    let mut value: serde_json::Value = serde_json::from_str(body).map_err(|e| Error::Adapter {
        resort_id: resort_id.to_string(),
        message: format!("JSON parse error: {e}"),
    })?;

    if let Some(obj) = value.as_object_mut() {
        obj.entry("resort_id")
            .or_insert_with(|| serde_json::Value::String(resort_id.to_string()));
        obj.entry("captured_at")
            .or_insert_with(|| serde_json::Value::String(Utc::now().to_rfc3339()));
    }

    // Well-formed JSON in the wrong shape is bad data, not a broken upstream.
    let mut snapshot: LiftStatusSnapshot =
        serde_json::from_value(value).map_err(|e| Error::Validation {
            resort_id: resort_id.to_string(),
            issues: vec![format!("unexpected feed shape: {e}")],
        })?;

    if snapshot.source_url.is_empty() {
        snapshot.source_url = url.to_string();
    }

    Ok(snapshot)
}
