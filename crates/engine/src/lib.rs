//! Orchestration, caching, fusion and scoring for the resort board.

pub mod cache;
pub mod fusion;
pub mod orchestrator;
pub mod scheduler;
pub mod scoring;
pub mod service;
pub mod validate;

pub use cache::{CacheEntry, CacheStats, Caches, TtlCache};
pub use fusion::{Facilities, FusedResortView, FusionEngine, LiftCount, ResortStatus, SnowSource, SnowView, TravelEstimate};
pub use orchestrator::{FetchOrchestrator, HealthBook, RefreshHealth, RefreshOutcome, RefreshReport, ResortOutcome};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use scoring::{rank, score, RankedResort, ScoreComponent, ScoreResult};
pub use service::{CacheStatsReport, ResortService};
