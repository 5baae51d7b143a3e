//! Day-rotated JSONL journal of board events.
//!
//! One file per local day (`events-YYYY-MM-DD.jsonl`), using the same UTC
//! offset as cache history so a journal day lines up with a history day.

use std::{
    fs::{create_dir_all, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use common::Domain;
use engine::{CacheStatsReport, RefreshOutcome, RefreshReport};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

const BOARD_JOURNAL_DIR: &str = "resort-board";

pub type SharedJournal = Arc<Mutex<EventJournal>>;

/// Everything the board writes to its journal.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoardEvent {
    BoardStart {
        resorts: Vec<String>,
        concurrency: usize,
        deadline_secs: u64,
        lift_interval_secs: u64,
        weather_interval_secs: u64,
        traffic_interval_secs: u64,
    },
    RefreshCycle {
        domain: Domain,
        elapsed_ms: u64,
        resorts: usize,
        updated: usize,
        cached: usize,
        failed: usize,
        no_adapter: usize,
    },
    RefreshFailure {
        domain: Domain,
        resort_id: String,
        outcome: RefreshOutcome,
    },
    Heartbeat {
        cache: CacheStatsReport,
        running: bool,
    },
    BoardShutdown {
        reason: String,
    },
}

impl BoardEvent {
    /// The cycle summary plus one failure event per failed resort.
    pub fn from_report(report: &RefreshReport) -> Vec<BoardEvent> {
        let mut events = vec![BoardEvent::RefreshCycle {
            domain: report.domain,
            elapsed_ms: report.elapsed_ms,
            resorts: report.outcomes.len(),
            updated: report.updated(),
            cached: report.cached(),
            failed: report.failed(),
            no_adapter: report.no_adapter(),
        }];
        events.extend(report.failures().map(|f| BoardEvent::RefreshFailure {
            domain: report.domain,
            resort_id: f.resort_id.clone(),
            outcome: f.outcome.clone(),
        }));
        events
    }
}

#[derive(Serialize)]
struct JournalLine<'a> {
    ts: String,
    local_day: &'a str,
    #[serde(flatten)]
    event: &'a BoardEvent,
}

fn resolve_repo_root() -> Option<PathBuf> {
    let mut cursor = std::env::current_dir().ok()?;
    loop {
        if cursor.join(".git").is_dir() {
            return Some(cursor);
        }
        if !cursor.pop() {
            return None;
        }
    }
}

/// `JOURNAL_DIR/resort-board`, else `<repo root>/JOURNAL/resort-board`.
pub fn resolve_journal_dir() -> PathBuf {
    if let Ok(raw) = std::env::var("JOURNAL_DIR") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join(BOARD_JOURNAL_DIR);
        }
    }

    if let Some(root) = resolve_repo_root() {
        return root.join("JOURNAL").join(BOARD_JOURNAL_DIR);
    }

    PathBuf::from("JOURNAL").join(BOARD_JOURNAL_DIR)
}

pub struct EventJournal {
    dir: PathBuf,
    offset: FixedOffset,
    day_key: String,
    file: File,
}

impl EventJournal {
    pub fn open(dir: PathBuf, offset: FixedOffset) -> std::io::Result<Self> {
        Self::open_at(dir, offset, Utc::now())
    }

    pub fn open_at(dir: PathBuf, offset: FixedOffset, now: DateTime<Utc>) -> std::io::Result<Self> {
        create_dir_all(&dir)?;
        let day_key = local_day(now, offset);
        let file = Self::open_day_file(&dir, &day_key)?;
        Ok(Self {
            dir,
            offset,
            day_key,
            file,
        })
    }

    fn open_day_file(dir: &Path, day_key: &str) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("events-{}.jsonl", day_key)))
    }

    fn rotate_if_needed(&mut self, now: DateTime<Utc>) -> std::io::Result<()> {
        let today = local_day(now, self.offset);
        if today != self.day_key {
            self.file = Self::open_day_file(&self.dir, &today)?;
            self.day_key = today;
        }
        Ok(())
    }

    pub fn record(&mut self, event: &BoardEvent) {
        self.record_at(event, Utc::now());
    }

    /// Append one event. Write failures are logged, never raised.
    pub fn record_at(&mut self, event: &BoardEvent, now: DateTime<Utc>) {
        let write_result = (|| -> std::io::Result<()> {
            self.rotate_if_needed(now)?;
            let line = JournalLine {
                ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
                local_day: &self.day_key,
                event,
            };
            let encoded = serde_json::to_string(&line)?;
            writeln!(self.file, "{}", encoded)?;
            self.file.flush()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            warn!("Event journal write failed: {}", e);
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("events-{}.jsonl", self.day_key))
    }
}

fn local_day(now: DateTime<Utc>, offset: FixedOffset) -> String {
    now.with_timezone(&offset).format("%Y-%m-%d").to_string()
}

pub async fn record(journal: &SharedJournal, event: BoardEvent) {
    journal.lock().await.record(&event);
}
