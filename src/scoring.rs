//! # Recommendation Scorer
//!
//! Ranks nearby venues for a subject from five bounded signals:
//!
//! | Signal | Source | Shape |
//! |--------|--------|-------|
//! | popularity | total visits | log-scaled, saturates at `popularity_saturation` |
//! | heat | visits at this hour + recent visits | hour share blended with half-life decay |
//! | friends | distinct friends who visited | `1 - 2^(-n / friend_half_saturation)` |
//! | vibe | live tile histogram + visit vibes | share of the wanted vibe |
//! | distance | distance from the query point | `exp(-d / distance_scale_m)`, zero outside radius |
//!
//! Every signal is a standalone function in [0, 1]. The final score is the
//! weighted mean under the weight set for the query's vibe (or the default
//! set), so it is in [0, 1] too.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::visits::VenueVisitStats;
use crate::{GpsPoint, SubjectId};

const SECS_PER_HOUR: f64 = 3600.0;

// =============================================================================
// Configuration
// =============================================================================

/// Relative importance of each signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub popularity: f64,
    pub heat: f64,
    pub friends: f64,
    pub vibe: f64,
    pub distance: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self { popularity: 0.25, heat: 0.2, friends: 0.2, vibe: 0.15, distance: 0.2 }
    }
}

impl SignalWeights {
    fn total(&self) -> f64 {
        self.popularity + self.heat + self.friends + self.vibe + self.distance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Weights used when the query's vibe has no dedicated set.
    pub default_weights: SignalWeights,
    /// Per-vibe weight sets, e.g. "party" leaning on heat.
    pub vibe_weights: BTreeMap<String, SignalWeights>,
    /// Visit count that maps to a popularity of 1.0 (default: 200).
    pub popularity_saturation: f64,
    /// Half-life of a visit's contribution to heat (default: 24h).
    pub heat_half_life_hours: f64,
    /// Share of heat coming from the hour-of-day profile (default: 0.5).
    pub heat_hour_weight: f64,
    /// Friend count giving a friends signal of 0.5 (default: 2).
    pub friend_half_saturation: f64,
    /// Share of the vibe signal coming from live tiles vs history (default: 0.6).
    pub live_vibe_weight: f64,
    /// Search radius when the caller gives none (default: 2000m).
    pub default_radius_m: f64,
    /// Distance at which the distance signal falls to 1/e (default: 800m).
    pub distance_scale_m: f64,
    /// Maximum recommendations returned (default: 20).
    pub max_results: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let vibe_weights = BTreeMap::from([
            (
                "party".to_string(),
                SignalWeights { popularity: 0.15, heat: 0.35, friends: 0.2, vibe: 0.2, distance: 0.1 },
            ),
            (
                "study".to_string(),
                SignalWeights { popularity: 0.1, heat: 0.05, friends: 0.1, vibe: 0.35, distance: 0.4 },
            ),
        ]);
        Self {
            default_weights: SignalWeights::default(),
            vibe_weights,
            popularity_saturation: 200.0,
            heat_half_life_hours: 24.0,
            heat_hour_weight: 0.5,
            friend_half_saturation: 2.0,
            live_vibe_weight: 0.6,
            default_radius_m: 2_000.0,
            distance_scale_m: 800.0,
            max_results: 20,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        let sets = std::iter::once(&self.default_weights).chain(self.vibe_weights.values());
        for w in sets {
            let parts = [w.popularity, w.heat, w.friends, w.vibe, w.distance];
            if parts.iter().any(|p| !p.is_finite() || *p < 0.0) || w.total() <= 0.0 {
                return Err(Error::Config("scoring weights must be non-negative with a positive sum".into()));
            }
        }
        if self.popularity_saturation <= 0.0 || self.heat_half_life_hours <= 0.0 || self.friend_half_saturation <= 0.0 {
            return Err(Error::Config("scoring saturation and half-life values must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.heat_hour_weight) || !(0.0..=1.0).contains(&self.live_vibe_weight) {
            return Err(Error::Config("scoring blend weights must be in [0, 1]".into()));
        }
        if self.default_radius_m <= 0.0 || self.distance_scale_m <= 0.0 {
            return Err(Error::Config("scoring distances must be positive".into()));
        }
        Ok(())
    }

    pub fn weights_for(&self, vibe: Option<&str>) -> &SignalWeights {
        vibe.and_then(|v| self.vibe_weights.get(v)).unwrap_or(&self.default_weights)
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Log-scaled visit count, 1.0 at `saturation` visits and above.
pub fn popularity_signal(visits: u32, saturation: f64) -> f64 {
    if saturation <= 0.0 {
        return 0.0;
    }
    ((visits as f64).ln_1p() / saturation.ln_1p()).clamp(0.0, 1.0)
}

/// `base * 2^(-age / half_life)`; negative ages count as fresh.
pub fn decayed_weight(base: f64, age_hours: f64, half_life_hours: f64) -> f64 {
    if half_life_hours <= 0.0 || age_hours < 0.0 {
        return base;
    }
    base * 2f64.powf(-age_hours / half_life_hours)
}

/// How busy a venue is right now.
///
/// Blends the share of historic visits falling in `hour` with a recency term
/// built from half-life-decayed visits, `sum / (sum + 1)`.
pub fn heat_signal(stats: &VenueVisitStats, hour: u32, now: i64, config: &ScoringConfig) -> f64 {
    if stats.total_visits == 0 {
        return 0.0;
    }
    let hour_share = stats.hourly.get(hour as usize).copied().unwrap_or(0) as f64 / stats.total_visits as f64;
    let decayed: f64 = stats
        .visit_times
        .iter()
        .map(|t| decayed_weight(1.0, (now - t) as f64 / SECS_PER_HOUR, config.heat_half_life_hours))
        .sum();
    let recency = decayed / (decayed + 1.0);
    let w = config.heat_hour_weight;
    (w * hour_share + (1.0 - w) * recency).clamp(0.0, 1.0)
}

/// Saturating in the number of distinct friends who visited.
pub fn friend_signal(friend_visitors: usize, half_saturation: f64) -> f64 {
    if half_saturation <= 0.0 {
        return 0.0;
    }
    1.0 - 2f64.powf(-(friend_visitors as f64) / half_saturation)
}

fn share(histogram: &BTreeMap<String, u32>, wanted: &str) -> Option<f64> {
    let total: u32 = histogram.values().sum();
    (total > 0).then(|| histogram.get(wanted).copied().unwrap_or(0) as f64 / total as f64)
}

/// Share of `wanted` among the venue's live and historic vibes.
///
/// When only one source has data it is used alone; with neither, or no
/// wanted vibe, the signal is zero.
pub fn vibe_signal(
    wanted: Option<&str>,
    live: &BTreeMap<String, u32>,
    history: &BTreeMap<String, u32>,
    live_weight: f64,
) -> f64 {
    let Some(wanted) = wanted else {
        return 0.0;
    };
    match (share(live, wanted), share(history, wanted)) {
        (Some(l), Some(h)) => live_weight * l + (1.0 - live_weight) * h,
        (Some(l), None) => l,
        (None, Some(h)) => h,
        (None, None) => 0.0,
    }
}

/// Exponential decay with distance; zero beyond `radius_m`.
pub fn distance_signal(distance_m: f64, radius_m: f64, scale_m: f64) -> f64 {
    if distance_m > radius_m || scale_m <= 0.0 {
        return 0.0;
    }
    (-distance_m.max(0.0) / scale_m).exp()
}

// =============================================================================
// Scoring
// =============================================================================

/// A recommendation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreQuery {
    pub subject_id: Option<SubjectId>,
    pub center: GpsPoint,
    pub radius_m: f64,
    pub vibe: Option<String>,
    /// Keep only venues carrying at least one of these tags. Empty keeps all.
    pub tags: BTreeSet<String>,
    pub now: i64,
    /// UTC hour of `now`.
    pub hour: u32,
}

/// Everything known about one candidate venue.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringInput {
    pub venue_id: String,
    pub name: String,
    pub distance_m: f64,
    pub visits: VenueVisitStats,
    pub friend_visitors: usize,
    /// Vibe histogram of the live tile containing the venue.
    pub live_vibes: BTreeMap<String, u32>,
    /// Normalized venue tags.
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub popularity: f64,
    pub heat: f64,
    pub friends: f64,
    pub vibe: f64,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueScore {
    pub venue_id: String,
    pub name: String,
    pub score: f64,
    pub distance_m: f64,
    pub breakdown: SignalBreakdown,
}

/// Compute all five signals for one candidate.
pub fn signals(query: &ScoreQuery, input: &ScoringInput, config: &ScoringConfig) -> SignalBreakdown {
    SignalBreakdown {
        popularity: popularity_signal(input.visits.total_visits, config.popularity_saturation),
        heat: heat_signal(&input.visits, query.hour, query.now, config),
        friends: friend_signal(input.friend_visitors, config.friend_half_saturation),
        vibe: vibe_signal(query.vibe.as_deref(), &input.live_vibes, &input.visits.vibes, config.live_vibe_weight),
        distance: distance_signal(input.distance_m, query.radius_m, config.distance_scale_m),
    }
}

/// Weighted mean of the signals, in [0, 1].
pub fn combine(breakdown: &SignalBreakdown, weights: &SignalWeights) -> f64 {
    let total = weights.total();
    if total <= 0.0 {
        return 0.0;
    }
    let sum = weights.popularity * breakdown.popularity
        + weights.heat * breakdown.heat
        + weights.friends * breakdown.friends
        + weights.vibe * breakdown.vibe
        + weights.distance * breakdown.distance;
    (sum / total).clamp(0.0, 1.0)
}

/// Whether `tags` satisfies the query's any-of tag filter.
pub fn matches_tags(wanted: &BTreeSet<String>, tags: &BTreeSet<String>) -> bool {
    wanted.is_empty() || !wanted.is_disjoint(tags)
}

/// Score and rank candidates: score descending, then distance ascending,
/// then venue id. Candidates outside the query radius or without any of the
/// wanted tags are dropped.
pub fn score(query: &ScoreQuery, candidates: &[ScoringInput], config: &ScoringConfig) -> Vec<VenueScore> {
    let weights = config.weights_for(query.vibe.as_deref());
    let mut scored: Vec<VenueScore> = candidates
        .iter()
        .filter(|c| c.distance_m <= query.radius_m)
        .filter(|c| matches_tags(&query.tags, &c.tags))
        .map(|c| {
            let breakdown = signals(query, c, config);
            VenueScore {
                venue_id: c.venue_id.clone(),
                name: c.name.clone(),
                score: combine(&breakdown, weights),
                distance_m: c.distance_m,
                breakdown,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.distance_m.total_cmp(&b.distance_m))
            .then_with(|| a.venue_id.cmp(&b.venue_id))
    });
    scored.truncate(config.max_results);
    scored
}
