//! Adapter that replays a snapshot stored on disk.
//!
//! The capture time is restamped on every read so that a fixture behaves
//! like a live page for offline runs.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use common::{Error, LiftStatusSnapshot, Result};
use tokio::time::Instant;

use crate::json_feed::parse_feed;
use crate::LiftStatusAdapter;

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    resort_id: String,
    path: PathBuf,
    source: String,
}

impl FixtureAdapter {
    pub fn new(resort_id: &str, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::Config(format!(
                "resort {resort_id}: fixture {} does not exist",
                path.display()
            )));
        }
        let source = format!("file://{}", path.display());
        Ok(Self {
            resort_id: resort_id.to_string(),
            path,
            source,
        })
    }
}

#[async_trait]
impl LiftStatusAdapter for FixtureAdapter {
    async fn fetch(&self, _deadline: Instant) -> Result<LiftStatusSnapshot> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Adapter {
                resort_id: self.resort_id.clone(),
                message: format!("fixture read error: {e}"),
            })?;

        let mut snapshot = parse_feed(&self.resort_id, &self.source, &body)?;
        snapshot.captured_at = Utc::now();
        Ok(snapshot)
    }

    fn source_url(&self) -> &str {
        &self.source
    }
}
