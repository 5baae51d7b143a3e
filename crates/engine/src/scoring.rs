//! Deterministic 0-100 desirability score per resort.
//!
//! Five weighted components, each a signal in [0, 1] scaled by the
//! freshness of the domain it came from. A missing signal contributes 0 and
//! the remaining weights are not renormalised, so a resort never scores
//! higher for knowing less.

use common::config::ScoringConfig;
use common::{Domain, DomainFreshness, Freshness};
use serde::Serialize;

use crate::fusion::{FusedResortView, SnowSource, TravelEstimate};

/// Comfortable temperature band, degrees Celsius.
const COMFORT_MIN_C: f64 = -12.0;
const COMFORT_MAX_C: f64 = 4.0;
/// Wind speed above which comfort starts to drop.
const COMFORT_WIND_KMH: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreComponent {
    pub label: &'static str,
    /// Domain the signal came from; `None` for static config.
    pub domain: Option<Domain>,
    pub weight: f64,
    pub signal: Option<f64>,
    pub freshness: Freshness,
    pub multiplier: f64,
    /// Points this component adds to the total.
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub total: f64,
    pub components: Vec<ScoreComponent>,
    pub freshness: DomainFreshness,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedResort {
    pub rank: usize,
    pub view: FusedResortView,
    pub score: ScoreResult,
}

fn multiplier(freshness: Freshness, cfg: &ScoringConfig) -> f64 {
    match freshness {
        Freshness::Fresh => 1.0,
        Freshness::Stale => cfg.stale_multiplier,
        Freshness::Expired => cfg.expired_multiplier,
    }
}

fn availability_signal(view: &FusedResortView) -> Option<f64> {
    let open = view.lifts_open?;
    let total = view.lifts_total?.value();
    if total == 0 {
        return None;
    }
    Some((f64::from(open) / f64::from(total)).clamp(0.0, 1.0))
}

/// Full marks up to the comfort threshold, then hyperbolic decay.
fn travel_signal(minutes: f64, cfg: &ScoringConfig) -> f64 {
    let threshold = cfg.travel_comfort_minutes.max(1.0);
    if minutes <= threshold {
        1.0
    } else {
        1.0 / (1.0 + (minutes - threshold) / threshold)
    }
}

fn snow_signal(depth_cm: f64, source: SnowSource, cfg: &ScoringConfig) -> f64 {
    let saturation = cfg.snow_saturation_cm.max(1.0);
    let base = (depth_cm / saturation).clamp(0.0, 1.0);
    match source {
        SnowSource::Measured => base,
        SnowSource::Estimated => base * cfg.estimated_snow_factor.clamp(0.0, 1.0),
    }
}

fn comfort_signal(temperature_c: f64, precipitation_probability: f64, wind_kmh: f64) -> f64 {
    let cold = (COMFORT_MIN_C - temperature_c).max(0.0) / 10.0;
    let warm = (temperature_c - COMFORT_MAX_C).max(0.0) / 10.0;
    let wet = 0.5 * precipitation_probability.clamp(0.0, 1.0);
    let windy = (wind_kmh - COMFORT_WIND_KMH).max(0.0) / 40.0;
    (1.0 - cold - warm - wet - windy).clamp(0.0, 1.0)
}

fn price_signal(price: f64, cfg: &ScoringConfig) -> f64 {
    if price <= cfg.price_floor {
        1.0
    } else if price >= cfg.price_ceiling || cfg.price_ceiling <= cfg.price_floor {
        0.0
    } else {
        1.0 - (price - cfg.price_floor) / (cfg.price_ceiling - cfg.price_floor)
    }
}

/// Score one view. Pure: the same inputs always give the same result.
pub fn score(view: &FusedResortView, freshness: &DomainFreshness, cfg: &ScoringConfig) -> ScoreResult {
    let travel_freshness = match view.travel {
        TravelEstimate::Live { .. } => freshness.traffic,
        TravelEstimate::Estimated { .. } => Freshness::Expired,
    };
    let snow_domain = match view.snow.as_ref().map(|s| s.source) {
        Some(SnowSource::Estimated) => Domain::Weather,
        _ => Domain::Lift,
    };

    let inputs = [
        (
            "availability",
            Some(Domain::Lift),
            cfg.availability_weight,
            availability_signal(view),
            freshness.lift,
        ),
        (
            "travel",
            Some(Domain::Traffic),
            cfg.travel_weight,
            Some(travel_signal(view.travel.minutes(), cfg)),
            travel_freshness,
        ),
        (
            "snow",
            Some(snow_domain),
            cfg.snow_weight,
            view.snow.as_ref().map(|s| snow_signal(s.depth_cm, s.source, cfg)),
            freshness.get(snow_domain),
        ),
        (
            "comfort",
            Some(Domain::Weather),
            cfg.comfort_weight,
            view.weather.as_ref().map(|w| {
                comfort_signal(
                    w.current.temperature_c,
                    w.current.precipitation_probability,
                    w.current.wind_kmh,
                )
            }),
            freshness.weather,
        ),
        (
            "price",
            None,
            cfg.price_weight,
            view.day_pass_price.map(|p| price_signal(p, cfg)),
            Freshness::Fresh,
        ),
    ];

    let weight_sum: f64 = inputs.iter().map(|(_, _, w, _, _)| w.max(0.0)).sum();

    let components: Vec<ScoreComponent> = inputs
        .into_iter()
        .map(|(label, domain, weight, signal, fresh)| {
            let weight = weight.max(0.0);
            let m = multiplier(fresh, cfg);
            let contribution = match signal {
                Some(s) if weight_sum > 0.0 => 100.0 * weight * s * m / weight_sum,
                _ => 0.0,
            };
            ScoreComponent {
                label,
                domain,
                weight,
                signal,
                freshness: fresh,
                multiplier: m,
                contribution,
            }
        })
        .collect();

    let total = components
        .iter()
        .map(|c| c.contribution)
        .sum::<f64>()
        .clamp(0.0, 100.0);

    ScoreResult {
        total,
        components,
        freshness: *freshness,
    }
}

/// Score and order views, best first. Ties break on resort id.
pub fn rank(views: Vec<FusedResortView>, cfg: &ScoringConfig) -> Vec<RankedResort> {
    let mut scored: Vec<(FusedResortView, ScoreResult)> = views
        .into_iter()
        .map(|v| {
            let s = score(&v, &v.freshness, cfg);
            (v, s)
        })
        .collect();

    scored.sort_by(|(va, sa), (vb, sb)| {
        sb.total
            .total_cmp(&sa.total)
            .then_with(|| va.resort_id.cmp(&vb.resort_id))
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (view, score))| RankedResort {
            rank: i + 1,
            view,
            score,
        })
        .collect()
}
