//! Configuration loader: merges env vars, .env file, and config.toml.

use common::config::{AppConfig, MAX_CONCURRENCY};
use common::Error;
use std::collections::HashSet;
use std::path::Path;

/// Largest real-world UTC offset, in minutes.
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

fn parse_positive_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer > 0")))?;
    if parsed == 0 {
        return Err(Error::Config(format!("{env_name} must be an integer > 0")));
    }
    Ok(parsed)
}

fn parse_offset_minutes(raw: &str, env_name: &str) -> Result<i32, Error> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer number of minutes")))
}

fn validate_config(config: &AppConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    if config.resorts.is_empty() {
        issues.push("resorts must contain at least one resort".into());
    }
    let mut seen = HashSet::new();
    for resort in &config.resorts {
        if resort.id.trim().is_empty() {
            issues.push(format!("resort '{}' has an empty id", resort.name));
        } else if !seen.insert(resort.id.as_str()) {
            issues.push(format!("resort id '{}' is duplicated", resort.id));
        }
        if !(-90.0..=90.0).contains(&resort.lat) || !(-180.0..=180.0).contains(&resort.lon) {
            issues.push(format!("resort '{}' has out-of-range coordinates", resort.id));
        }
        if resort.day_pass_price.is_some_and(|p| p < 0.0) {
            issues.push(format!("resort '{}' day_pass_price must be >= 0", resort.id));
        }
    }
    if !(-90.0..=90.0).contains(&config.origin.lat) || !(-180.0..=180.0).contains(&config.origin.lon)
    {
        issues.push("origin has out-of-range coordinates".into());
    }
    if config.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        issues.push("utc_offset_minutes must be within +/- 840".into());
    }

    if config.fetch.concurrency == 0 || config.fetch.concurrency > MAX_CONCURRENCY {
        issues.push(format!("fetch.concurrency must be in 1..={MAX_CONCURRENCY}"));
    }
    if config.fetch.deadline_secs == 0 {
        issues.push("fetch.deadline_secs must be > 0".into());
    }

    for (name, domain) in [
        ("lift", config.cache.lift),
        ("weather", config.cache.weather),
        ("traffic", config.cache.traffic),
    ] {
        if domain.fresh_secs == 0 {
            issues.push(format!("cache.{name}.fresh_secs must be > 0"));
        }
        if domain.ttl_secs < domain.fresh_secs {
            issues.push(format!("cache.{name}.ttl_secs must be >= cache.{name}.fresh_secs"));
        }
    }
    if config.cache.snapshot_dir.is_some() && config.cache.snapshot_interval_secs == 0 {
        issues.push("cache.snapshot_interval_secs must be > 0".into());
    }
    if config.cache.cleanup_interval_secs == 0 {
        issues.push("cache.cleanup_interval_secs must be > 0".into());
    }

    if config.timing.lift_interval_secs == 0 {
        issues.push("timing.lift_interval_secs must be > 0".into());
    }
    if config.timing.weather_interval_secs == 0 {
        issues.push("timing.weather_interval_secs must be > 0".into());
    }
    if config.timing.traffic_interval_secs == 0 {
        issues.push("timing.traffic_interval_secs must be > 0".into());
    }
    if config.timing.heartbeat_interval_secs == 0 {
        issues.push("timing.heartbeat_interval_secs must be > 0".into());
    }
    for (name, window) in [
        ("lift_window", config.timing.lift_window),
        ("weather_window", config.timing.weather_window),
        ("traffic_window", config.timing.traffic_window),
    ] {
        if let Some(w) = window {
            if w.start_hour > 23 || w.end_hour > 23 {
                issues.push(format!("timing.{name} hours must be in 0..=23"));
            }
            if w.start_hour == w.end_hour {
                issues.push(format!("timing.{name} is empty (start_hour == end_hour)"));
            }
        }
    }

    let s = &config.scoring;
    let weights = [
        ("availability_weight", s.availability_weight),
        ("travel_weight", s.travel_weight),
        ("snow_weight", s.snow_weight),
        ("comfort_weight", s.comfort_weight),
        ("price_weight", s.price_weight),
    ];
    for (name, w) in weights {
        if w < 0.0 {
            issues.push(format!("scoring.{name} must be >= 0"));
        }
    }
    if weights.iter().map(|(_, w)| w.max(0.0)).sum::<f64>() <= 0.0 {
        issues.push("scoring weights must sum to > 0".into());
    }
    if s.price_floor >= s.price_ceiling {
        issues.push("scoring.price_floor must be < scoring.price_ceiling".into());
    }
    if s.travel_comfort_minutes <= 0.0 {
        issues.push("scoring.travel_comfort_minutes must be > 0".into());
    }
    if s.snow_saturation_cm <= 0.0 {
        issues.push("scoring.snow_saturation_cm must be > 0".into());
    }
    if !(0.0..=1.0).contains(&s.estimated_snow_factor) {
        issues.push("scoring.estimated_snow_factor must be in [0,1]".into());
    }
    // Each step down the freshness ladder must cost something.
    if !(0.0..1.0).contains(&s.stale_multiplier) {
        issues.push("scoring.stale_multiplier must be in [0,1)".into());
    }
    if !(0.0..1.0).contains(&s.expired_multiplier) {
        issues.push("scoring.expired_multiplier must be in [0,1)".into());
    }
    if s.expired_multiplier >= s.stale_multiplier {
        issues.push("scoring.expired_multiplier must be < scoring.stale_multiplier".into());
    }

    if config.traffic_source.requests_per_minute == 0 {
        issues.push("traffic_source.requests_per_minute must be > 0".into());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Apply environment overrides through `lookup`, so tests never touch the
/// process environment.
fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), Error> {
    if let Some(key) = lookup("GOOGLE_MAPS_API_KEY") {
        config.google_maps_api_key = key.trim().to_string();
    }
    if let Some(raw) = lookup("RESORT_BOARD_CONCURRENCY") {
        let parsed = parse_positive_u64(&raw, "RESORT_BOARD_CONCURRENCY")?;
        config.fetch.concurrency = usize::try_from(parsed).unwrap_or(usize::MAX);
    }
    if let Some(raw) = lookup("RESORT_BOARD_DEADLINE_SECS") {
        config.fetch.deadline_secs = parse_positive_u64(&raw, "RESORT_BOARD_DEADLINE_SECS")?;
    }
    if let Some(raw) = lookup("RESORT_BOARD_SNAPSHOT_DIR") {
        let trimmed = raw.trim();
        config.cache.snapshot_dir = (!trimmed.is_empty()).then(|| trimmed.to_string());
    }
    if let Some(raw) = lookup("RESORT_BOARD_UTC_OFFSET_MINUTES") {
        config.utc_offset_minutes =
            parse_offset_minutes(&raw, "RESORT_BOARD_UTC_OFFSET_MINUTES")?;
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<Option<AppConfig>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let config = toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    Ok(Some(config))
}

/// Load board configuration from environment and optional config file.
pub fn load_config() -> Result<AppConfig, Error> {
    // 1. Load .env file from project root or parent directories.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. config.toml (or RESORT_BOARD_CONFIG) over defaults.
    let config_path =
        std::env::var("RESORT_BOARD_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let mut config = match read_config_file(Path::new(&config_path))? {
        Some(config) => config,
        None => {
            tracing::info!(path = %config_path, "No config file found, using defaults");
            AppConfig::default()
        }
    };

    // 3. Override with environment variables (highest priority).
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    validate_config(&config)?;

    Ok(config)
}
