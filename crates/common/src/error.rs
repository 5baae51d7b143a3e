//! Unified error type for the resort board.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Adapter error for {resort_id}: {message}")]
    Adapter { resort_id: String, message: String },

    #[error("Invalid snapshot for {resort_id}: {}", .issues.join("; "))]
    Validation {
        resort_id: String,
        issues: Vec<String>,
    },

    #[error("Upstream call for {resort_id} timed out after {after_ms}ms")]
    Timeout { resort_id: String, after_ms: u64 },

    #[error("Batched call for {} resorts ({}) timed out after {after_ms}ms", .resort_ids.len(), .resort_ids.join(", "))]
    BatchTimeout {
        resort_ids: Vec<String>,
        after_ms: u64,
    },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Weather API error: {0}")]
    Weather(String),

    #[error("Traffic API error: {0}")]
    Traffic(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse failure family, used for log fields and per-resort outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Adapter,
    Validation,
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adapter => "adapter",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
        }
    }
}

impl Error {
    /// Classify a per-resort failure. Configuration errors are not per-resort
    /// and map to `None`.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Config(_) => None,
            Self::Validation { .. } => Some(FailureKind::Validation),
            Self::Timeout { .. } | Self::BatchTimeout { .. } => Some(FailureKind::Timeout),
            _ => Some(FailureKind::Adapter),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        let timeout = Error::Timeout {
            resort_id: "alpine-2".into(),
            after_ms: 8000,
        };
        assert_eq!(timeout.failure_kind(), Some(FailureKind::Timeout));

        let batch = Error::BatchTimeout {
            resort_ids: vec!["alpine-1".into(), "alpine-2".into()],
            after_ms: 8000,
        };
        assert_eq!(batch.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(
            batch.to_string(),
            "Batched call for 2 resorts (alpine-1, alpine-2) timed out after 8000ms"
        );

        let invalid = Error::Validation {
            resort_id: "alpine-2".into(),
            issues: vec!["lifts_open > lifts_total".into()],
        };
        assert_eq!(invalid.failure_kind(), Some(FailureKind::Validation));
        assert!(invalid.to_string().contains("lifts_open > lifts_total"));

        assert_eq!(Error::Http("503".into()).failure_kind(), Some(FailureKind::Adapter));
        assert!(Error::Config("missing".into()).failure_kind().is_none());
    }
}
