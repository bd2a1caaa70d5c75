//! # Venue Identity Resolver
//!
//! Matches venues imported from external providers against the canonical
//! venue table so the same place is never listed twice.
//!
//! A candidate is scored against every known venue within `search_radius_m`,
//! and only venues within `radius_m` can match:
//! - venues that pass both thresholds outrank ones that do not
//! - name similarity is trigram Jaccard (the same measure Postgres `pg_trgm`
//!   uses), so word order and small typos barely matter
//! - address similarity (normalized Damerau-Levenshtein) only breaks ties
//!   between names that score within `near_tie_epsilon` of each other
//! - remaining ties go to the closer venue, then the lower venue id
//!
//! Every resolution appends a [`DedupeDecision`] row recording the scores
//! and thresholds used.
//!
//! ## Example
//!
//! ```rust
//! use presence_engine::venue::{trigram_similarity, decide, MatchScores, MatchThresholds};
//!
//! assert!(trigram_similarity("Blue Bottle Coffee", "blue bottle coffee") > 0.99);
//!
//! let thresholds = MatchThresholds::default();
//! let close = MatchScores { name_similarity: 0.95, address_similarity: None, distance_m: 10.0 };
//! assert!(decide(&close, &thresholds));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};
use parking_lot::RwLock;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geo_utils::{bounds_around, haversine_distance, validate_point};
use crate::GpsPoint;

// =============================================================================
// Types
// =============================================================================

/// A venue as delivered by a provider, before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueCandidate {
    pub provider: String,
    pub provider_id: String,
    pub name: String,
    pub address: Option<String>,
    pub location: GpsPoint,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl VenueCandidate {
    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() || self.provider_id.trim().is_empty() {
            return Err(Error::InvalidInput("venue candidate needs provider and provider_id".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput(format!("venue {}:{} has no name", self.provider, self.provider_id)));
        }
        validate_point(self.location.latitude, self.location.longitude)?;
        Ok(())
    }
}

/// Canonical venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: String,
    pub provider: String,
    pub provider_id: String,
    pub name: String,
    pub address: Option<String>,
    pub location: GpsPoint,
    pub tags: BTreeSet<String>,
}

impl Venue {
    fn from_candidate(id: String, candidate: &VenueCandidate) -> Self {
        Self {
            id,
            provider: candidate.provider.clone(),
            provider_id: candidate.provider_id.clone(),
            name: candidate.name.trim().to_string(),
            address: candidate.address.clone(),
            location: candidate.location,
            tags: normalize_tags(&candidate.tags),
        }
    }
}

/// Maps a provider's id onto a canonical venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueAlias {
    pub provider: String,
    pub provider_id: String,
    pub venue_id: String,
}

/// Deterministic venue id for a provider record.
pub fn venue_id_for(provider: &str, provider_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{}:{}", provider, provider_id).as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchThresholds {
    /// Minimum name similarity for a match (default: 0.8).
    pub name_threshold: f64,
    /// Maximum distance for a match (default: 50m).
    pub radius_m: f64,
    /// Venues scored, and logged as near misses, around a candidate
    /// (default: 1000m).
    pub search_radius_m: f64,
    /// Name scores this close count as tied (default: 0.05).
    pub near_tie_epsilon: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self { name_threshold: 0.8, radius_m: 50.0, search_radius_m: 1_000.0, near_tie_epsilon: 0.05 }
    }
}

impl MatchThresholds {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.name_threshold) {
            return Err(Error::Config(format!("venue.name_threshold must be in [0, 1], got {}", self.name_threshold)));
        }
        if !(self.radius_m.is_finite() && self.radius_m > 0.0) || self.near_tie_epsilon < 0.0 {
            return Err(Error::Config("venue.radius_m must be positive and near_tie_epsilon non-negative".into()));
        }
        if !(self.search_radius_m.is_finite() && self.search_radius_m >= self.radius_m) {
            return Err(Error::Config("venue.search_radius_m must be at least venue.radius_m".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScores {
    pub name_similarity: f64,
    pub address_similarity: Option<f64>,
    pub distance_m: f64,
}

/// Match iff the name is similar enough AND the venue is close enough.
pub fn decide(scores: &MatchScores, thresholds: &MatchThresholds) -> bool {
    scores.name_similarity >= thresholds.name_threshold && scores.distance_m <= thresholds.radius_m
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// An alias for this provider id already existed.
    AliasHit,
    Matched,
    Created,
}

/// Audit row written for every resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeDecision {
    pub run_id: String,
    pub provider: String,
    pub provider_id: String,
    pub candidate_name: String,
    pub compared_venue_id: Option<String>,
    pub scores: Option<MatchScores>,
    pub decision: DecisionKind,
    pub venue_id: String,
    pub thresholds: MatchThresholds,
    pub evaluated_at: i64,
}

/// Outcome of a pure evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Best-ranked venue within the radius and its scores.
    pub best: Option<(Venue, MatchScores)>,
    pub is_match: bool,
}

/// What happened to an imported venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Matched { venue_id: String },
    Created { venue_id: String },
    /// The provider could not be reached; retry on a later import.
    Pending { provider_id: String, reason: String },
}

impl Resolution {
    pub fn venue_id(&self) -> Option<&str> {
        match self {
            Self::Matched { venue_id } | Self::Created { venue_id } => Some(venue_id),
            Self::Pending { .. } => None,
        }
    }
}

// =============================================================================
// Similarity
// =============================================================================

/// Trigram set of a string, padded per word the way `pg_trgm` does.
fn trigrams(s: &str) -> BTreeSet<String> {
    let lowered = s.to_lowercase();
    let mut grams = BTreeSet::new();
    for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for window in padded.windows(3) {
            grams.insert(window.iter().collect());
        }
    }
    grams
}

/// Jaccard similarity of the two strings' trigram sets, in [0, 1].
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let (ta, tb) = (trigrams(a), trigrams(b));
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f64 / union as f64
}

fn normalize_address(address: &str) -> String {
    let lowered = address.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| match w {
            "street" => "st",
            "avenue" => "ave",
            "road" => "rd",
            "boulevard" => "blvd",
            "drive" => "dr",
            "place" => "pl",
            "square" => "sq",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity of two postal addresses after normalisation, in [0, 1].
pub fn address_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_damerau_levenshtein(&normalize_address(a), &normalize_address(b))
}

pub(crate) fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect()
}

fn score(candidate: &VenueCandidate, venue: &Venue) -> MatchScores {
    let address_similarity = match (&candidate.address, &venue.address) {
        (Some(a), Some(b)) => Some(address_similarity(a, b)),
        _ => None,
    };
    MatchScores {
        name_similarity: trigram_similarity(&candidate.name, &venue.name),
        address_similarity,
        distance_m: haversine_distance(&candidate.location, &venue.location),
    }
}

// =============================================================================
// Resolver
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct VenuePoint {
    venue_id: String,
    lat: f64,
    lng: f64,
}

impl RTreeObject for VenuePoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

impl PointDistance for VenuePoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.lat - point[0];
        let dlng = self.lng - point[1];
        dlat * dlat + dlng * dlng
    }
}

#[derive(Debug, Default)]
struct VenueTable {
    venues: BTreeMap<String, Venue>,
    aliases: HashMap<(String, String), String>,
    tree: RTree<VenuePoint>,
}

impl VenueTable {
    fn insert(&mut self, venue: Venue) {
        if let Some(old) = self.venues.get(&venue.id) {
            self.tree.remove(&VenuePoint {
                venue_id: old.id.clone(),
                lat: old.location.latitude,
                lng: old.location.longitude,
            });
        }
        self.tree.insert(VenuePoint {
            venue_id: venue.id.clone(),
            lat: venue.location.latitude,
            lng: venue.location.longitude,
        });
        self.aliases.insert((venue.provider.clone(), venue.provider_id.clone()), venue.id.clone());
        self.venues.insert(venue.id.clone(), venue);
    }

    fn within(&self, center: &GpsPoint, radius_m: f64) -> Vec<(&Venue, f64)> {
        let b = bounds_around(center, radius_m);
        let envelope = AABB::from_corners([b.min_lat, b.min_lng], [b.max_lat, b.max_lng]);
        self.tree
            .locate_in_envelope(&envelope)
            .filter_map(|vp| self.venues.get(&vp.venue_id))
            .filter_map(|v| {
                let d = haversine_distance(center, &v.location);
                (d <= radius_m).then_some((v, d))
            })
            .collect()
    }
}

/// Canonical venue table, alias map and dedupe audit log.
#[derive(Debug, Default)]
pub struct VenueResolver {
    thresholds: MatchThresholds,
    table: RwLock<VenueTable>,
    decisions: RwLock<Vec<DedupeDecision>>,
}

impl VenueResolver {
    pub fn new(thresholds: MatchThresholds) -> Self {
        Self { thresholds, table: RwLock::new(VenueTable::default()), decisions: RwLock::new(Vec::new()) }
    }

    pub fn thresholds(&self) -> &MatchThresholds {
        &self.thresholds
    }

    /// Add a canonical venue directly (seed data, admin tools).
    pub fn insert_venue(&self, venue: Venue) -> Result<()> {
        validate_point(venue.location.latitude, venue.location.longitude)?;
        self.table.write().insert(venue);
        Ok(())
    }

    pub fn venue(&self, venue_id: &str) -> Option<Venue> {
        self.table.read().venues.get(venue_id).cloned()
    }

    pub fn contains(&self, venue_id: &str) -> bool {
        self.table.read().venues.contains_key(venue_id)
    }

    /// Canonical venue already aliased to this provider record.
    pub fn alias(&self, provider: &str, provider_id: &str) -> Option<String> {
        self.table.read().aliases.get(&(provider.to_string(), provider_id.to_string())).cloned()
    }

    /// Provider records aliased to `venue_id`, sorted by provider then id.
    pub fn aliases_for(&self, venue_id: &str) -> Vec<VenueAlias> {
        let mut aliases: Vec<VenueAlias> = self
            .table
            .read()
            .aliases
            .iter()
            .filter(|(_, v)| v.as_str() == venue_id)
            .map(|((provider, provider_id), v)| VenueAlias {
                provider: provider.clone(),
                provider_id: provider_id.clone(),
                venue_id: v.clone(),
            })
            .collect();
        aliases.sort_by(|a, b| (&a.provider, &a.provider_id).cmp(&(&b.provider, &b.provider_id)));
        aliases
    }

    /// Venues within `radius_m` of `center`, closest first.
    pub fn venues_within(&self, center: &GpsPoint, radius_m: f64) -> Vec<(Venue, f64)> {
        let table = self.table.read();
        let mut hits: Vec<(Venue, f64)> = table.within(center, radius_m).into_iter().map(|(v, d)| (v.clone(), d)).collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
        hits
    }

    pub fn len(&self) -> usize {
        self.table.read().venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rank known venues against `candidate` without changing anything.
    ///
    /// The result does not depend on the order venues were inserted.
    pub fn evaluate(&self, candidate: &VenueCandidate) -> Result<Evaluation> {
        candidate.validate()?;
        let table = self.table.read();
        let thresholds = &self.thresholds;

        let scored: Vec<(&Venue, MatchScores)> = table
            .within(&candidate.location, thresholds.search_radius_m)
            .into_iter()
            .map(|(v, _)| (v, score(candidate, v)))
            .collect();

        // A far venue with a better name must not hide a close one that matches.
        let (passing, near_misses): (Vec<_>, Vec<_>) = scored.into_iter().partition(|(_, s)| decide(s, thresholds));
        let pool = if passing.is_empty() { near_misses } else { passing };

        let Some(top_name) = pool.iter().map(|(_, s)| s.name_similarity).max_by(|a, b| a.total_cmp(b)) else {
            return Ok(Evaluation { best: None, is_match: false });
        };

        let best = pool
            .into_iter()
            .filter(|(_, s)| s.name_similarity >= top_name - thresholds.near_tie_epsilon)
            .min_by(|(va, sa), (vb, sb)| {
                let (aa, ab) = (sa.address_similarity.unwrap_or(0.0), sb.address_similarity.unwrap_or(0.0));
                ab.total_cmp(&aa)
                    .then_with(|| sa.distance_m.total_cmp(&sb.distance_m))
                    .then_with(|| va.id.cmp(&vb.id))
            })
            .map(|(v, s)| (v.clone(), s));

        let is_match = best.as_ref().map_or(false, |(_, s)| decide(s, thresholds));
        Ok(Evaluation { best, is_match })
    }

    /// Resolve `candidate` to a canonical venue, creating one if nothing
    /// matches, and record the decision under `run_id`.
    pub fn resolve(&self, candidate: &VenueCandidate, run_id: &str, now: i64) -> Result<Resolution> {
        candidate.validate()?;

        if let Some(venue_id) = self.alias(&candidate.provider, &candidate.provider_id) {
            let scores = self.venue(&venue_id).map(|v| score(candidate, &v));
            self.record(candidate, run_id, now, Some(venue_id.clone()), scores, DecisionKind::AliasHit, &venue_id);
            return Ok(Resolution::Matched { venue_id });
        }

        let evaluation = self.evaluate(candidate)?;
        let compared = evaluation.best.as_ref().map(|(v, _)| v.id.clone());
        let scores = evaluation.best.as_ref().map(|(_, s)| *s);

        if let (true, Some((venue, _))) = (evaluation.is_match, &evaluation.best) {
            let mut table = self.table.write();
            table
                .aliases
                .insert((candidate.provider.clone(), candidate.provider_id.clone()), venue.id.clone());
            if let Some(canonical) = table.venues.get_mut(&venue.id) {
                canonical.tags.extend(normalize_tags(&candidate.tags));
            }
            drop(table);

            debug!("[VenueResolver] {}:{} matched {}", candidate.provider, candidate.provider_id, venue.id);
            self.record(candidate, run_id, now, compared, scores, DecisionKind::Matched, &venue.id);
            return Ok(Resolution::Matched { venue_id: venue.id.clone() });
        }

        let venue_id = venue_id_for(&candidate.provider, &candidate.provider_id);
        self.table.write().insert(Venue::from_candidate(venue_id.clone(), candidate));
        info!("[VenueResolver] Created venue {} for {}:{}", venue_id, candidate.provider, candidate.provider_id);
        self.record(candidate, run_id, now, compared, scores, DecisionKind::Created, &venue_id);
        Ok(Resolution::Created { venue_id })
    }

    /// Audit rows for one import run, in resolution order.
    pub fn decisions(&self, run_id: &str) -> Vec<DedupeDecision> {
        self.decisions.read().iter().filter(|d| d.run_id == run_id).cloned().collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        candidate: &VenueCandidate,
        run_id: &str,
        now: i64,
        compared_venue_id: Option<String>,
        scores: Option<MatchScores>,
        decision: DecisionKind,
        venue_id: &str,
    ) {
        self.decisions.write().push(DedupeDecision {
            run_id: run_id.to_string(),
            provider: candidate.provider.clone(),
            provider_id: candidate.provider_id.clone(),
            candidate_name: candidate.name.clone(),
            compared_venue_id,
            scores,
            decision,
            venue_id: venue_id.to_string(),
            thresholds: self.thresholds.clone(),
            evaluated_at: now,
        });
    }
}
