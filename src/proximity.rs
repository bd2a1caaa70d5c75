//! # Proximity Detector
//!
//! Tracks every pair of live subjects that come within the proximity radius
//! and turns their distance history into Enter/Sustain/Exit events.
//!
//! Each pair runs a small state machine:
//!
//! ```text
//!   Idle ──in range──▶ Forming ──held sustain_after_secs──▶ Sustained (Enter)
//!    ▲                   │                                   │    ▲
//!    └──out of range─────┘                         out of range   back in range
//!    ▲                                                       ▼    │
//!    └────────────── grace elapsed (Exit) ─────────────── Cooling ┘
//! ```
//!
//! A pair emits at most one Enter per sustained period and exactly one Exit
//! when that period ends. Pairs are sharded by key hash; each shard sits
//! behind its own lock so one pair's transitions are always serialized.
//! Entering Forming also publishes a short-lived ripple.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geo_utils::{build_rtree, points_within};
use crate::presence::{Presence, Visibility};
use crate::tiles::BuildBudget;
use crate::{Bounds, GpsPoint, SubjectId};

// =============================================================================
// Pair identity
// =============================================================================

/// Unordered pair of subjects, stored lower id first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub a: SubjectId,
    pub b: SubjectId,
}

impl PairKey {
    pub fn new(x: impl Into<SubjectId>, y: impl Into<SubjectId>) -> Self {
        let (x, y) = (x.into(), y.into());
        if x <= y { Self { a: x, b: y } } else { Self { a: y, b: x } }
    }

    pub fn contains(&self, subject_id: &str) -> bool {
        self.a == subject_id || self.b == subject_id
    }

    /// The member that isn't `subject_id`.
    pub fn other(&self, subject_id: &str) -> Option<&str> {
        if self.a == subject_id {
            Some(&self.b)
        } else if self.b == subject_id {
            Some(&self.a)
        } else {
            None
        }
    }

    fn shard(&self, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() % shards.max(1) as u64) as usize
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.a, self.b)
    }
}

// =============================================================================
// Configuration and events
// =============================================================================

/// Detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Pair distance that counts as "together" (default: 25m).
    pub radius_m: f64,
    /// Time in range before Enter fires (default: 120s).
    pub sustain_after_secs: i64,
    /// Spacing of Sustain events while together (default: 60s).
    pub sustain_interval_secs: i64,
    /// Grace window after separating before Exit fires (default: 120s).
    pub cooling_grace_secs: i64,
    /// Rows not refreshed within this window are treated as gone (default: 180s).
    pub stale_after_secs: i64,
    /// Accuracy assumed for pings that report none (default: 20m).
    pub default_accuracy_m: f64,
    /// Lifetime of a ripple signal (default: 600s).
    pub ripple_ttl_secs: i64,
    /// Number of independently locked pair shards (default: 16).
    pub shards: usize,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            radius_m: 25.0,
            sustain_after_secs: 120,
            sustain_interval_secs: 60,
            cooling_grace_secs: 120,
            stale_after_secs: 180,
            default_accuracy_m: 20.0,
            ripple_ttl_secs: 600,
            shards: 16,
        }
    }
}

impl ProximityConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.radius_m.is_finite() && self.radius_m > 0.0) {
            return Err(Error::Config(format!("proximity.radius_m must be positive, got {}", self.radius_m)));
        }
        if self.sustain_interval_secs <= 0 || self.sustain_after_secs < 0 || self.cooling_grace_secs < 0 {
            return Err(Error::Config("proximity durations must be non-negative (interval positive)".into()));
        }
        if self.shards == 0 {
            return Err(Error::Config("proximity.shards must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityEventKind {
    Enter,
    Sustain,
    Exit,
}

/// Append-only proximity fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    pub pair: PairKey,
    pub kind: ProximityEventKind,
    pub timestamp: i64,
    pub distance_m: f64,
    pub confidence: f64,
    pub venue_id: Option<String>,
}

/// Short-lived two-party proximity signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RippleSignal {
    pub pair: PairKey,
    pub centroid: GpsPoint,
    pub venue_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Result of one detector tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub completed: bool,
    pub pairs_in_range: usize,
    pub events: Vec<ProximityEvent>,
    pub ripples: usize,
}

// =============================================================================
// Pair state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairPhase {
    Idle,
    Forming,
    Sustained,
    Cooling,
}

/// What one tick saw for a pair in range.
#[derive(Debug, Clone, PartialEq)]
struct Observation {
    distance_m: f64,
    confidence: f64,
    centroid: GpsPoint,
    venue_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct PairTrack {
    phase: PairPhase,
    phase_since: i64,
    last_emitted_at: i64,
    last_distance_m: f64,
    last_confidence: f64,
    venue_id: Option<String>,
}

impl PairTrack {
    fn idle() -> Self {
        Self {
            phase: PairPhase::Idle,
            phase_since: 0,
            last_emitted_at: 0,
            last_distance_m: 0.0,
            last_confidence: 0.0,
            venue_id: None,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct StepOutput {
    event: Option<ProximityEventKind>,
    ripple: bool,
}

/// Advance one pair by one tick.
fn step(track: &mut PairTrack, seen: Option<&Observation>, now: i64, config: &ProximityConfig) -> StepOutput {
    let mut out = StepOutput::default();

    if let Some(obs) = seen {
        track.last_distance_m = obs.distance_m;
        track.last_confidence = obs.confidence;
        if obs.venue_id.is_some() {
            track.venue_id = obs.venue_id.clone();
        }
    }

    match (track.phase, seen.is_some()) {
        (PairPhase::Idle, true) => {
            track.phase = PairPhase::Forming;
            track.phase_since = now;
            out.ripple = true;
        }
        (PairPhase::Idle, false) => {}
        (PairPhase::Forming, true) => {
            if now - track.phase_since >= config.sustain_after_secs {
                track.phase = PairPhase::Sustained;
                track.phase_since = now;
                track.last_emitted_at = now;
                out.event = Some(ProximityEventKind::Enter);
            }
        }
        (PairPhase::Forming, false) => {
            track.phase = PairPhase::Idle;
            track.phase_since = now;
        }
        (PairPhase::Sustained, true) | (PairPhase::Cooling, true) => {
            if track.phase == PairPhase::Cooling {
                track.phase = PairPhase::Sustained;
                track.phase_since = now;
            }
            if now - track.last_emitted_at >= config.sustain_interval_secs {
                track.last_emitted_at = now;
                out.event = Some(ProximityEventKind::Sustain);
            }
        }
        (PairPhase::Sustained, false) => {
            track.phase = PairPhase::Cooling;
            track.phase_since = now;
        }
        (PairPhase::Cooling, false) => {
            if now - track.phase_since >= config.cooling_grace_secs {
                track.phase = PairPhase::Idle;
                track.phase_since = now;
                out.event = Some(ProximityEventKind::Exit);
            }
        }
    }

    out
}

/// Confidence in [0, 1] that two subjects really are together.
///
/// Falls as the combined accuracy radius grows relative to the proximity
/// radius and as the pair drifts towards the edge of that radius.
pub fn pair_confidence(distance_m: f64, accuracy_a: f64, accuracy_b: f64, radius_m: f64) -> f64 {
    if radius_m <= 0.0 {
        return 0.0;
    }
    let accuracy_term = radius_m / (radius_m + accuracy_a.max(0.0) + accuracy_b.max(0.0));
    let closeness = 1.0 - 0.5 * (distance_m / radius_m).clamp(0.0, 1.0);
    (accuracy_term * closeness).clamp(0.0, 1.0)
}

// =============================================================================
// Ripple board
// =============================================================================

/// Live ripple signals, newest last.
#[derive(Debug, Default)]
pub struct RippleBoard {
    signals: RwLock<Vec<RippleSignal>>,
}

impl RippleBoard {
    pub fn publish(&self, signal: RippleSignal) {
        self.signals.write().push(signal);
    }

    /// Unexpired ripples in `bbox` created within the last `recency_secs`,
    /// newest first.
    pub fn ripples_near(&self, bbox: &Bounds, recency_secs: i64, now: i64) -> Vec<RippleSignal> {
        let mut hits: Vec<RippleSignal> = self
            .signals
            .read()
            .iter()
            .filter(|s| now <= s.expires_at && now - s.created_at <= recency_secs)
            .filter(|s| bbox.contains(&s.centroid))
            .cloned()
            .collect();
        hits.sort_by(|x, y| y.created_at.cmp(&x.created_at).then_with(|| x.pair.cmp(&y.pair)));
        hits
    }

    /// Drop expired ripples. Returns how many were removed.
    pub fn prune(&self, now: i64) -> usize {
        let mut signals = self.signals.write();
        let before = signals.len();
        signals.retain(|s| now <= s.expires_at);
        before - signals.len()
    }

    pub fn len(&self) -> usize {
        self.signals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Detector
// =============================================================================

type Shard = Mutex<HashMap<PairKey, PairTrack>>;

/// Append-only event log. Sequence numbers are assigned under the write
/// lock, so readers can resume from a position regardless of the
/// timestamps the events carry.
#[derive(Debug, Default)]
struct EventLog {
    next_seq: u64,
    entries: Vec<(u64, ProximityEvent)>,
}

/// Sharded pair tracker plus the append-only event log.
#[derive(Debug)]
pub struct ProximityDetector {
    config: ProximityConfig,
    shards: Vec<Shard>,
    events: RwLock<EventLog>,
    ripples: RippleBoard,
}

impl Default for ProximityDetector {
    fn default() -> Self {
        Self::new(ProximityConfig::default())
    }
}

impl ProximityDetector {
    pub fn new(config: ProximityConfig) -> Self {
        let shards = (0..config.shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { config, shards, events: RwLock::new(EventLog::default()), ripples: RippleBoard::default() }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn ripples(&self) -> &RippleBoard {
        &self.ripples
    }

    /// Current phase of a pair.
    pub fn phase(&self, pair: &PairKey) -> PairPhase {
        let shard = &self.shards[pair.shard(self.shards.len())];
        shard.lock().get(pair).map_or(PairPhase::Idle, |t| t.phase)
    }

    /// Run one detection pass over `snapshot`.
    ///
    /// Shards are processed one at a time (concurrently with `parallel`); the
    /// budget is checked between shards and untouched shards simply wait for
    /// the next tick.
    pub fn tick(&self, snapshot: &[Presence], now: i64, budget: &BuildBudget) -> Result<TickReport> {
        let observations = self.observe(snapshot, now);
        let pairs_in_range = observations.len();

        let mut per_shard: Vec<Vec<(PairKey, Observation)>> = vec![Vec::new(); self.shards.len()];
        for (pair, obs) in observations {
            let idx = pair.shard(self.shards.len());
            per_shard[idx].push((pair, obs));
        }

        let results = self.advance_shards(per_shard, now, budget);
        let completed = results.iter().all(|r| r.is_some());

        let mut events: Vec<ProximityEvent> = Vec::new();
        let mut ripples: Vec<RippleSignal> = Vec::new();
        for (shard_events, shard_ripples) in results.into_iter().flatten() {
            events.extend(shard_events);
            ripples.extend(shard_ripples);
        }
        events.sort_by(|x, y| x.pair.cmp(&y.pair).then_with(|| x.kind.cmp(&y.kind)));
        ripples.sort_by(|x, y| x.pair.cmp(&y.pair));

        let ripple_count = ripples.len();
        for ripple in ripples {
            self.ripples.publish(ripple);
        }
        {
            let mut log = self.events.write();
            for event in &events {
                let seq = log.next_seq;
                log.next_seq += 1;
                log.entries.push((seq, event.clone()));
            }
        }

        if !events.is_empty() {
            info!("[ProximityDetector] {} events from {} pairs in range", events.len(), pairs_in_range);
        } else {
            debug!("[ProximityDetector] Tick at {}: {} pairs in range", now, pairs_in_range);
        }

        Ok(TickReport { completed, pairs_in_range, events, ripples: ripple_count })
    }

    /// Events logged at or after sequence `from`, plus the sequence to resume
    /// from next time.
    pub fn events_since(&self, from: u64) -> (Vec<ProximityEvent>, u64) {
        let log = self.events.read();
        let start = log.entries.partition_point(|(seq, _)| *seq < from);
        let events = log.entries[start..].iter().map(|(_, e)| e.clone()).collect();
        (events, log.next_seq)
    }

    /// Every event still in the log for `pair`.
    pub fn events_for(&self, pair: &PairKey) -> Vec<ProximityEvent> {
        self.events.read().entries.iter().map(|(_, e)| e).filter(|e| &e.pair == pair).cloned().collect()
    }

    /// Drop entries below sequence `before_seq` whose timestamp is older
    /// than `cutoff`. Returns how many were removed.
    pub fn truncate(&self, before_seq: u64, cutoff: i64) -> usize {
        let mut log = self.events.write();
        let before = log.entries.len();
        log.entries.retain(|(seq, e)| *seq >= before_seq || e.timestamp >= cutoff);
        before - log.entries.len()
    }

    /// Pairs within radius right now, keyed canonically.
    fn observe(&self, snapshot: &[Presence], now: i64) -> BTreeMap<PairKey, Observation> {
        let live: Vec<&Presence> = snapshot
            .iter()
            .filter(|p| !p.is_expired(now))
            .filter(|p| p.visibility != Visibility::Hidden)
            .filter(|p| now - p.updated_at <= self.config.stale_after_secs)
            .collect();
        let points: Vec<GpsPoint> = live.iter().map(|p| p.location).collect();
        let tree = build_rtree(&points);

        let mut pairs = BTreeMap::new();
        for (i, a) in live.iter().enumerate() {
            for (j, distance) in points_within(&tree, &points, &a.location, self.config.radius_m) {
                let b = live[j];
                if a.subject_id >= b.subject_id {
                    continue;
                }
                let confidence = pair_confidence(
                    distance,
                    a.accuracy_m.unwrap_or(self.config.default_accuracy_m),
                    b.accuracy_m.unwrap_or(self.config.default_accuracy_m),
                    self.config.radius_m,
                );
                let venue_id = match (&a.venue_id, &b.venue_id) {
                    (Some(x), Some(y)) if x == y => Some(x.clone()),
                    _ => None,
                };
                let centroid = GpsPoint::new(
                    (points[i].latitude + b.location.latitude) / 2.0,
                    (points[i].longitude + b.location.longitude) / 2.0,
                );
                pairs.insert(
                    PairKey::new(a.subject_id.as_str(), b.subject_id.as_str()),
                    Observation { distance_m: distance, confidence, centroid, venue_id },
                );
            }
        }
        pairs
    }

    #[cfg(feature = "parallel")]
    fn advance_shards(
        &self,
        per_shard: Vec<Vec<(PairKey, Observation)>>,
        now: i64,
        budget: &BuildBudget,
    ) -> Vec<Option<(Vec<ProximityEvent>, Vec<RippleSignal>)>> {
        use rayon::prelude::*;

        per_shard
            .into_par_iter()
            .enumerate()
            .map(|(idx, seen)| (!budget.is_exhausted()).then(|| self.advance_shard(idx, seen, now)))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn advance_shards(
        &self,
        per_shard: Vec<Vec<(PairKey, Observation)>>,
        now: i64,
        budget: &BuildBudget,
    ) -> Vec<Option<(Vec<ProximityEvent>, Vec<RippleSignal>)>> {
        per_shard
            .into_iter()
            .enumerate()
            .map(|(idx, seen)| (!budget.is_exhausted()).then(|| self.advance_shard(idx, seen, now)))
            .collect()
    }

    fn advance_shard(
        &self,
        idx: usize,
        seen: Vec<(PairKey, Observation)>,
        now: i64,
    ) -> (Vec<ProximityEvent>, Vec<RippleSignal>) {
        let mut tracks = self.shards[idx].lock();
        let mut seen: HashMap<PairKey, Observation> = seen.into_iter().collect();

        let mut keys: Vec<PairKey> = tracks.keys().cloned().collect();
        keys.extend(seen.keys().filter(|k| !tracks.contains_key(*k)).cloned());
        keys.sort();

        let mut events = Vec::new();
        let mut ripples = Vec::new();
        for key in keys {
            let obs = seen.remove(&key);
            let track = tracks.entry(key.clone()).or_insert_with(PairTrack::idle);
            let out = step(track, obs.as_ref(), now, &self.config);

            if let Some(kind) = out.event {
                events.push(ProximityEvent {
                    pair: key.clone(),
                    kind,
                    timestamp: now,
                    distance_m: track.last_distance_m,
                    confidence: track.last_confidence,
                    venue_id: track.venue_id.clone(),
                });
            }
            if out.ripple {
                if let Some(obs) = &obs {
                    ripples.push(RippleSignal {
                        pair: key.clone(),
                        centroid: obs.centroid,
                        venue_id: obs.venue_id.clone(),
                        created_at: now,
                        expires_at: now + self.config.ripple_ttl_secs,
                    });
                }
            }
            if track.phase == PairPhase::Idle {
                tracks.remove(&key);
            }
        }
        (events, ripples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_point;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn row(id: &str, location: GpsPoint, ts: i64) -> Presence {
        Presence {
            subject_id: id.into(),
            location,
            accuracy_m: Some(5.0),
            vibe: None,
            visibility: Visibility::Public,
            venue_id: None,
            updated_at: ts,
            expires_at: ts + 900,
        }
    }

    fn origin() -> GpsPoint {
        GpsPoint::new(40.4168, -3.7038)
    }

    fn together(ts: i64) -> Vec<Presence> {
        vec![row("bob", origin(), ts), row("alice", offset_point(&origin(), 10.0, 0.0), ts)]
    }

    fn apart(ts: i64) -> Vec<Presence> {
        vec![row("bob", origin(), ts), row("alice", offset_point(&origin(), 500.0, 0.0), ts)]
    }

    fn kinds(events: &[ProximityEvent]) -> Vec<ProximityEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_pair_key_is_canonical() {
        assert_eq!(PairKey::new("bob", "alice"), PairKey::new("alice", "bob"));
        let key = PairKey::new("bob", "alice");
        assert_eq!(key.a, "alice");
        assert_eq!(key.other("alice"), Some("bob"));
        assert_eq!(key.other("carol"), None);
        assert_eq!(key.to_string(), "alice|bob");
    }

    #[test]
    fn test_enter_fires_once_after_sustain_period() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited();
        let pair = PairKey::new("alice", "bob");

        let first = detector.tick(&together(0), 0, &budget).unwrap();
        assert!(first.events.is_empty());
        assert_eq!(first.ripples, 1);
        assert_eq!(detector.phase(&pair), PairPhase::Forming);

        assert!(detector.tick(&together(60), 60, &budget).unwrap().events.is_empty());
        let enter = detector.tick(&together(120), 120, &budget).unwrap();
        assert_eq!(kinds(&enter.events), vec![ProximityEventKind::Enter]);

        let mut later = Vec::new();
        for t in (150..=300).step_by(30) {
            later.extend(detector.tick(&together(t), t, &budget).unwrap().events);
        }
        assert!(later.iter().all(|e| e.kind == ProximityEventKind::Sustain));
        assert_eq!(later.len(), 3);
    }

    #[test]
    fn test_event_log_resumes_by_sequence() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited();
        for t in [0, 60, 120, 180] {
            detector.tick(&together(t), t, &budget).unwrap();
        }
        let (first, next) = detector.events_since(0);
        assert_eq!(kinds(&first), vec![ProximityEventKind::Enter, ProximityEventKind::Sustain]);
        assert_eq!(next, 2);

        detector.tick(&together(240), 240, &budget).unwrap();
        let (rest, next) = detector.events_since(next);
        assert_eq!(kinds(&rest), vec![ProximityEventKind::Sustain]);
        assert_eq!(next, 3);
        assert!(detector.events_since(next).0.is_empty());

        // Only entries below the sequence and past the cutoff go.
        assert_eq!(detector.truncate(2, 1_000), 2);
        assert_eq!(detector.events_since(0).0.len(), 1);
        assert_eq!(detector.truncate(3, 0), 0);
    }

    #[test]
    fn test_forming_pair_separates_silently() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited();
        detector.tick(&together(0), 0, &budget).unwrap();
        let report = detector.tick(&apart(30), 30, &budget).unwrap();
        assert!(report.events.is_empty());
        assert_eq!(detector.phase(&PairKey::new("alice", "bob")), PairPhase::Idle);
    }

    #[test]
    fn test_brief_gap_does_not_reenter() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited();
        for t in [0, 60, 120] {
            detector.tick(&together(t), t, &budget).unwrap();
        }
        let cooling = detector.tick(&apart(150), 150, &budget).unwrap();
        assert!(cooling.events.is_empty());
        assert_eq!(detector.phase(&PairKey::new("alice", "bob")), PairPhase::Cooling);

        let back = detector.tick(&together(180), 180, &budget).unwrap();
        assert_eq!(kinds(&back.events), vec![ProximityEventKind::Sustain]);

        let all = detector.events_for(&PairKey::new("alice", "bob"));
        assert_eq!(all.iter().filter(|e| e.kind == ProximityEventKind::Enter).count(), 1);
    }

    #[test]
    fn test_exit_after_grace() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited();
        for t in [0, 60, 120] {
            detector.tick(&together(t), t, &budget).unwrap();
        }
        assert!(detector.tick(&apart(180), 180, &budget).unwrap().events.is_empty());
        assert!(detector.tick(&apart(240), 240, &budget).unwrap().events.is_empty());
        let exit = detector.tick(&apart(300), 300, &budget).unwrap();
        assert_eq!(kinds(&exit.events), vec![ProximityEventKind::Exit]);
        assert!(detector.tick(&apart(360), 360, &budget).unwrap().events.is_empty());
    }

    #[test]
    fn test_stale_rows_count_as_separated() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited();
        for t in [0, 60, 120] {
            detector.tick(&together(t), t, &budget).unwrap();
        }
        // Rows stop updating; once stale the pair cools then exits.
        detector.tick(&together(120), 400, &budget).unwrap();
        let exit = detector.tick(&together(120), 520, &budget).unwrap();
        assert_eq!(kinds(&exit.events), vec![ProximityEventKind::Exit]);
    }

    #[test]
    fn test_hidden_subjects_not_paired() {
        let detector = ProximityDetector::default();
        let mut rows = together(0);
        rows[0].visibility = Visibility::Hidden;
        let report = detector.tick(&rows, 0, &BuildBudget::unlimited()).unwrap();
        assert_eq!(report.pairs_in_range, 0);
    }

    #[test]
    fn test_shared_venue_carried_on_events_and_ripples() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited();
        let with_venue = |ts| {
            let mut rows = together(ts);
            for r in &mut rows {
                r.venue_id = Some("cafe".into());
            }
            rows
        };
        detector.tick(&with_venue(0), 0, &budget).unwrap();
        let enter = detector.tick(&with_venue(120), 120, &budget).unwrap();
        assert_eq!(enter.events[0].venue_id.as_deref(), Some("cafe"));

        let bbox = crate::geo_utils::bounds_around(&origin(), 100.0);
        let ripples = detector.ripples().ripples_near(&bbox, 600, 120);
        assert_eq!(ripples.len(), 1);
        assert_eq!(ripples[0].venue_id.as_deref(), Some("cafe"));
    }

    #[test]
    fn test_ripples_expire() {
        let board = RippleBoard::default();
        board.publish(RippleSignal {
            pair: PairKey::new("a", "b"),
            centroid: origin(),
            venue_id: None,
            created_at: 100,
            expires_at: 700,
        });
        let bbox = crate::geo_utils::bounds_around(&origin(), 50.0);
        assert_eq!(board.ripples_near(&bbox, 600, 700).len(), 1);
        assert!(board.ripples_near(&bbox, 60, 700).is_empty());
        assert!(board.ripples_near(&bbox, 600, 701).is_empty());
        assert_eq!(board.prune(701), 1);
        assert!(board.is_empty());
    }

    #[test]
    fn test_confidence_bounds() {
        let close = pair_confidence(1.0, 5.0, 5.0, 25.0);
        let fuzzy = pair_confidence(1.0, 50.0, 50.0, 25.0);
        let edge = pair_confidence(24.0, 5.0, 5.0, 25.0);
        assert!(close > fuzzy);
        assert!(close > edge);
        assert!((0.0..=1.0).contains(&fuzzy));
    }

    #[test]
    fn test_cancelled_tick_leaves_state_untouched() {
        let detector = ProximityDetector::default();
        let budget = BuildBudget::unlimited().with_cancel(Arc::new(AtomicBool::new(true)));
        let report = detector.tick(&together(0), 0, &budget).unwrap();
        assert!(!report.completed);
        assert_eq!(detector.phase(&PairKey::new("alice", "bob")), PairPhase::Idle);
    }

    #[test]
    fn test_config_validation() {
        assert!(ProximityConfig::default().validate().is_ok());
        assert!(ProximityConfig { radius_m: 0.0, ..Default::default() }.validate().is_err());
        assert!(ProximityConfig { shards: 0, ..Default::default() }.validate().is_err());
    }
}
