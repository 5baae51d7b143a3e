//! Shape and range checks applied to every snapshot before it is cached.

use chrono::{DateTime, Duration, Utc};
use common::{Error, LiftStatusSnapshot, Result, TrafficSnapshot, WeatherSnapshot};

/// Captures further than this in the future are rejected.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

pub trait Validate {
    /// Every problem found; empty means the value is usable.
    fn issues(&self, resort_id: &str, now: DateTime<Utc>) -> Vec<String>;
}

/// Reject `value` with a validation error listing all of its issues.
pub fn ensure_valid<T: Validate>(value: &T, resort_id: &str, now: DateTime<Utc>) -> Result<()> {
    let issues = value.issues(resort_id, now);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation {
            resort_id: resort_id.to_string(),
            issues,
        })
    }
}

fn check_common(
    issues: &mut Vec<String>,
    expected_id: &str,
    actual_id: &str,
    captured_at: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    if actual_id != expected_id {
        issues.push(format!("resort_id {actual_id:?} does not match {expected_id:?}"));
    }
    if captured_at - now > Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        issues.push(format!("captured_at {captured_at} is in the future"));
    }
}

fn check_non_negative(issues: &mut Vec<String>, field: &str, value: f64) {
    if !value.is_finite() || value < 0.0 {
        issues.push(format!("{field} must be a non-negative number, got {value}"));
    }
}

impl Validate for LiftStatusSnapshot {
    fn issues(&self, resort_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut issues = Vec::new();
        check_common(&mut issues, resort_id, &self.resort_id, self.captured_at, now);

        if let Some(open) = self.lifts_open {
            if open < 0 {
                issues.push(format!("lifts_open is negative ({open})"));
            }
        }
        if let Some(total) = self.lifts_total {
            if total < 0 {
                issues.push(format!("lifts_total is negative ({total})"));
            }
        }
        if let (Some(open), Some(total)) = (self.open_count(), self.total_count()) {
            if open > total {
                issues.push(format!("lifts_open ({open}) exceeds lifts_total ({total})"));
            }
        }

        if self.lifts.iter().any(|l| l.name.trim().is_empty()) {
            issues.push("lift with empty name".into());
        }
        if self.slopes.iter().any(|s| s.name.trim().is_empty()) {
            issues.push("slope with empty name".into());
        }

        if let Some(snow) = &self.snow {
            for (field, value) in [
                ("snow.base_cm", snow.base_cm),
                ("snow.summit_cm", snow.summit_cm),
                ("snow.new_snow_cm", snow.new_snow_cm),
            ] {
                if let Some(v) = value {
                    check_non_negative(&mut issues, field, v);
                }
            }
        }
        issues
    }
}

impl Validate for WeatherSnapshot {
    fn issues(&self, resort_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut issues = Vec::new();
        check_common(&mut issues, resort_id, &self.resort_id, self.captured_at, now);

        let current = &self.current;
        if !current.temperature_c.is_finite() || !(-80.0..=60.0).contains(&current.temperature_c) {
            issues.push(format!("temperature {} out of range", current.temperature_c));
        }
        check_non_negative(&mut issues, "wind_kmh", current.wind_kmh);
        if !(0.0..=1.0).contains(&current.precipitation_probability) {
            issues.push(format!(
                "precipitation_probability {} outside [0, 1]",
                current.precipitation_probability
            ));
        }
        if let Some(depth) = current.snow_depth_cm {
            check_non_negative(&mut issues, "snow_depth_cm", depth);
        }

        for day in &self.forecast_days {
            if day.temp_min_c > day.temp_max_c {
                issues.push(format!("{}: temp_min above temp_max", day.date));
            }
            check_non_negative(&mut issues, "precipitation_mm", day.precipitation_mm);
            check_non_negative(&mut issues, "snowfall_cm", day.snowfall_cm);
            check_non_negative(&mut issues, "wind_max_kmh", day.wind_max_kmh);
        }
        issues
    }
}

impl Validate for TrafficSnapshot {
    fn issues(&self, resort_id: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut issues = Vec::new();
        check_common(&mut issues, resort_id, &self.resort_id, self.captured_at, now);

        if self.travel_time_secs == 0 {
            issues.push("travel_time_secs is zero".into());
        }
        if self.traffic_delay_secs > self.travel_time_secs {
            issues.push("traffic delay exceeds travel time".into());
        }
        check_non_negative(&mut issues, "distance_km", self.distance_km);
        issues
    }
}
