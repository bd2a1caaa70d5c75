//! # Presence Engine
//!
//! The service surface: one value owning every store and tracker, with
//! command methods for ingestion and venue resolution, query methods for
//! the map and recommendation screens, and batch entry points the
//! [`scheduler`](crate::scheduler) drives.
//!
//! Ownership rules the database used to enforce live here as explicit
//! checks: callers may only write their own presence, and a presence row
//! may only reference a venue the resolver knows.
//!
//! ```rust
//! use std::sync::Arc;
//! use presence_engine::{GpsPoint, PresenceEngine, PresencePing, NoFriends};
//! use presence_engine::config::EngineConfig;
//!
//! let engine = PresenceEngine::new(EngineConfig::default(), Arc::new(NoFriends)).unwrap();
//! let ping = PresencePing::new("alice", GpsPoint::new(51.5074, -0.1278), 1_700_000_000).with_vibe("chill");
//! let outcome = engine.upsert_presence("alice", &ping, 1_700_000_000).unwrap();
//! assert!(outcome.written);
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Days;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::crossed::{day_of, hour_of, CrossedPath, CrossedPathLedger, MaterializeReport};
use crate::debounce::{should_write, WriteReason};
use crate::error::{Error, Result};
use crate::geo_utils::validate_point;
use crate::guard::RateLimiter;
use crate::import::VenueImporter;
use crate::presence::{FriendGraph, Presence, PresencePing, PresenceStore, Visibility, VisibilityFilter};
use crate::proximity::{ProximityDetector, RippleSignal, TickReport};
use crate::scoring::{score, ScoreQuery, ScoringInput, VenueScore};
use crate::spatial::hex_key;
use crate::tiles::{BuildBudget, BuildReport, BuildScope, TileBuilder, VibeCluster};
use crate::venue::{normalize_tags, Resolution, VenueCandidate, VenueResolver};
use crate::visits::VisitLedger;
use crate::waves::{SocialCluster, SweepReport, WaveTracker};
use crate::{Bounds, GpsPoint, SubjectId};

/// Result of [`PresenceEngine::upsert_presence`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// Whether the ping changed the stored row.
    pub written: bool,
    pub reason: WriteReason,
    /// The subject's row after ingestion.
    pub presence: Option<Presence>,
    /// Wave the subject belongs to after ingestion.
    pub wave_id: Option<String>,
}

/// Optional narrowing for [`PresenceEngine::nearby_users`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NearbyFilters {
    pub friends_only: bool,
    pub vibe: Option<String>,
}

/// Optional narrowing for [`PresenceEngine::personalized_recs`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecFilters {
    pub vibe: Option<String>,
    /// Venue must carry at least one of these tags (case-insensitive).
    /// Empty means no tag filter.
    pub tags: Vec<String>,
    /// Search radius; the scoring default when absent.
    pub radius_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyUser {
    pub subject_id: SubjectId,
    pub location: GpsPoint,
    pub distance_m: f64,
    pub vibe: Option<String>,
    pub venue_id: Option<String>,
    pub updated_at: i64,
}

/// What one expiry sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub presence_rows: usize,
    pub ripples: usize,
    pub proximity_events: usize,
    pub crossed_paths: usize,
    pub visits: usize,
}

const SECS_PER_DAY: i64 = 86_400;

pub struct PresenceEngine {
    config: EngineConfig,
    store: PresenceStore,
    tiles: TileBuilder,
    detector: ProximityDetector,
    crossed: CrossedPathLedger,
    waves: WaveTracker,
    resolver: Arc<VenueResolver>,
    importer: VenueImporter,
    visits: VisitLedger,
    ingest_limiter: RateLimiter,
    friends: Arc<dyn FriendGraph>,
    /// Event log sequence the next materialization starts from.
    crossed_watermark: Mutex<u64>,
    /// An interrupted incremental build lost its dirty set.
    needs_global_build: AtomicBool,
}

impl PresenceEngine {
    pub fn new(config: EngineConfig, friends: Arc<dyn FriendGraph>) -> Result<Self> {
        config.validate()?;
        let resolver = Arc::new(VenueResolver::new(config.venue.clone()));
        let importer = VenueImporter::new(
            Arc::clone(&resolver),
            config.import.clone(),
            config.breaker.clone(),
            config.provider_rate.clone(),
        );

        info!(
            "[PresenceEngine] Starting: ttl {}s, proximity radius {}m, tile resolutions {:?}",
            config.presence.ttl_secs, config.proximity.radius_m, config.tiles.resolutions
        );

        Ok(Self {
            store: PresenceStore::new(config.presence.clone()),
            tiles: TileBuilder::new(config.tiles.clone()),
            detector: ProximityDetector::new(config.proximity.clone()),
            crossed: CrossedPathLedger::new(),
            waves: WaveTracker::new(config.waves.clone()),
            resolver,
            importer,
            visits: VisitLedger::new(),
            ingest_limiter: RateLimiter::new(config.ingest_rate.clone()),
            friends,
            crossed_watermark: Mutex::new(0),
            needs_global_build: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &PresenceStore {
        &self.store
    }

    pub fn tiles(&self) -> &TileBuilder {
        &self.tiles
    }

    pub fn detector(&self) -> &ProximityDetector {
        &self.detector
    }

    pub fn resolver(&self) -> &Arc<VenueResolver> {
        &self.resolver
    }

    /// Provider import pipeline sharing this engine's venue table.
    pub fn importer(&self) -> &VenueImporter {
        &self.importer
    }

    pub fn visits(&self) -> &VisitLedger {
        &self.visits
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Ingest a ping from `caller`.
    ///
    /// Rejects writes on behalf of other subjects, rate-limits per subject,
    /// checks the venue reference and then lets the debounce gate decide
    /// whether the row changes.
    pub fn upsert_presence(&self, caller: &str, ping: &PresencePing, now: i64) -> Result<IngestOutcome> {
        if caller != ping.subject_id {
            return Err(Error::Unauthorized(format!("{} cannot write presence for {}", caller, ping.subject_id)));
        }
        ping.validate()?;
        self.ingest_limiter.check(&ping.subject_id, now)?;
        if let Some(venue_id) = &ping.venue_id {
            if !self.resolver.contains(venue_id) {
                return Err(Error::UnknownVenue(venue_id.clone()));
            }
        }

        let current = self.store.get(&ping.subject_id, now);
        let decision = should_write(current.as_ref(), ping, &self.config.debounce);
        if !decision.write {
            debug!("[PresenceEngine] {} ping debounced ({:?})", ping.subject_id, decision.reason);
            return Ok(IngestOutcome {
                written: false,
                reason: decision.reason,
                presence: current,
                wave_id: self.waves.wave_of(&ping.subject_id).map(|w| w.id),
            });
        }

        let outcome = self.store.upsert(ping, None)?;
        let row = outcome.presence().clone();
        if !outcome.was_written() {
            return Ok(IngestOutcome {
                written: false,
                reason: WriteReason::OutOfOrder,
                presence: Some(row),
                wave_id: self.waves.wave_of(&ping.subject_id).map(|w| w.id),
            });
        }

        self.visits.record_presence(&row);
        let wave_id = self.waves.observe(&row, now);

        Ok(IngestOutcome { written: true, reason: decision.reason, presence: Some(row), wave_id })
    }

    /// Visibility toggle from the identity service, for the caller's own row.
    pub fn set_visibility(&self, caller: &str, subject_id: &str, visibility: Visibility) -> Result<()> {
        if caller != subject_id {
            return Err(Error::Unauthorized(format!("{} cannot change visibility of {}", caller, subject_id)));
        }
        self.store.set_visibility(subject_id, visibility);
        info!("[PresenceEngine] {} visibility set to {:?}", subject_id, visibility);
        Ok(())
    }

    /// Resolve one provider venue against the canonical table.
    pub fn resolve_venue(&self, candidate: &VenueCandidate, run_id: &str, now: i64) -> Result<Resolution> {
        self.resolver.resolve(candidate, run_id, now)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Live subjects within `radius_m` that `viewer` may see, closest first.
    pub fn nearby_users(
        &self,
        viewer: &str,
        lat: f64,
        lng: f64,
        radius_m: f64,
        filters: &NearbyFilters,
        now: i64,
    ) -> Result<Vec<NearbyUser>> {
        let center = validate_point(lat, lng)?;
        let filter = VisibilityFilter {
            viewer: Some(viewer.to_string()),
            friends_only: filters.friends_only,
            vibe: filters.vibe.clone(),
        };
        let hits = self.store.nearby(&center, radius_m, &filter, self.friends.as_ref(), now)?;
        Ok(hits
            .into_iter()
            .map(|(p, distance_m)| NearbyUser {
                subject_id: p.subject_id,
                location: p.location,
                distance_m,
                vibe: p.vibe,
                venue_id: p.venue_id,
                updated_at: p.updated_at,
            })
            .collect())
    }

    /// Vibe clusters in `bbox`, largest first.
    pub fn vibe_clusters(&self, bbox: &Bounds, resolution: u8, now: i64) -> Result<Vec<VibeCluster>> {
        if self.tiles.is_maintained(resolution) {
            self.tiles.vibe_clusters(bbox, resolution, &[], now)
        } else {
            let snapshot = self.store.snapshot(now);
            self.tiles.vibe_clusters(bbox, resolution, &snapshot, now)
        }
    }

    /// Venues near a point ranked on crowd signals alone.
    pub fn trending_venues(&self, lat: f64, lng: f64, radius_m: f64, now: i64) -> Result<Vec<VenueScore>> {
        self.rank_venues(None, lat, lng, radius_m, None, BTreeSet::new(), now)
    }

    /// Venues near a point ranked for `subject`, including friend visits
    /// and the requested vibe, narrowed to the requested tags.
    pub fn personalized_recs(&self, subject: &str, lat: f64, lng: f64, filters: &RecFilters, now: i64) -> Result<Vec<VenueScore>> {
        let radius_m = filters.radius_m.unwrap_or(self.config.scoring.default_radius_m);
        let tags = normalize_tags(&filters.tags);
        self.rank_venues(Some(subject), lat, lng, radius_m, filters.vibe.clone(), tags, now)
    }

    /// Ripples in `bbox` from the last `recency_secs` that `viewer` may see.
    ///
    /// Every member other than the viewer must be live and visible to them.
    /// With `friends_only`, at least one member must be the viewer or one of
    /// their friends.
    pub fn ripple_signals_near(
        &self,
        viewer: &str,
        bbox: &Bounds,
        recency_secs: i64,
        friends_only: bool,
        now: i64,
    ) -> Vec<RippleSignal> {
        let filter = VisibilityFilter::viewer(viewer);
        let friends = self.friends.as_ref();

        self.detector
            .ripples()
            .ripples_near(bbox, recency_secs, now)
            .into_iter()
            .filter(|r| {
                let members = [r.pair.a.as_str(), r.pair.b.as_str()];
                let visible = members.iter().filter(|m| **m != viewer).all(|m| {
                    self.store.get(m, now).map_or(false, |p| filter.allows(&p, friends))
                });
                let related = members.iter().any(|m| *m == viewer || friends.is_friend(viewer, m));
                visible && (!friends_only || related)
            })
            .collect()
    }

    /// Active waves in `bbox` with at least `min_size` members.
    pub fn waves_near(&self, bbox: &Bounds, min_size: usize) -> Vec<SocialCluster> {
        self.waves.waves_near(bbox, min_size)
    }

    /// Crossed paths for `subject` on the UTC day containing `now`.
    pub fn crossed_paths_today(&self, subject: &str, now: i64) -> Vec<CrossedPath> {
        match day_of(now) {
            Some(day) => self.crossed.crossed_paths_on(subject, day),
            None => Vec::new(),
        }
    }

    // =========================================================================
    // Batch jobs
    // =========================================================================

    /// Refresh tiles touched since the previous build.
    pub fn run_tile_build(&self, now: i64, budget: &BuildBudget) -> Result<BuildReport> {
        let dirty = self.store.take_dirty();
        let scope = if self.needs_global_build.swap(false, Ordering::Relaxed) {
            BuildScope::Global
        } else {
            BuildScope::Cells(dirty)
        };

        let snapshot = self.store.snapshot(now);
        let report = self.tiles.build(&snapshot, &scope, budget, now)?;
        if !report.completed {
            // The drained points are gone; the next build covers everything.
            self.needs_global_build.store(true, Ordering::Relaxed);
        }
        Ok(report)
    }

    pub fn run_proximity_tick(&self, now: i64, budget: &BuildBudget) -> Result<TickReport> {
        let snapshot = self.store.snapshot(now);
        self.detector.tick(&snapshot, now, budget)
    }

    /// Fold proximity events logged since the previous run into the
    /// crossed-path ledger.
    ///
    /// Progress is tracked by log sequence, not by event time, so a tick
    /// that was still running when the previous pass read the log is picked
    /// up here.
    pub fn materialize_crossed_paths(&self, now: i64) -> MaterializeReport {
        let mut watermark = self.crossed_watermark.lock();
        let (events, next) = self.detector.events_since(*watermark);
        let report = self.crossed.materialize(&events);
        *watermark = next;

        if report.created > 0 || report.updated > 0 {
            info!(
                "[PresenceEngine] Crossed paths at {}: {} created, {} updated",
                now, report.created, report.updated
            );
        }
        report
    }

    pub fn sweep_waves(&self, now: i64) -> SweepReport {
        let snapshot = self.store.snapshot(now);
        self.waves.sweep(&snapshot, now)
    }

    /// Delete expired presence, ripples and already-materialized events.
    pub fn expire_stale(&self, now: i64) -> ExpiryReport {
        let presence_rows = self.store.expire_stale(now);
        let ripples = self.detector.ripples().prune(now);
        let retention = &self.config.retention;
        let materialized = *self.crossed_watermark.lock();
        let proximity_events = self.detector.truncate(materialized, now - retention.event_secs);
        let crossed_paths = day_of(now)
            .and_then(|today| today.checked_sub_days(Days::new(retention.crossed_path_days)))
            .map_or(0, |cutoff| self.crossed.prune_before(cutoff));
        let visit_days = i64::try_from(retention.visit_days).unwrap_or(i64::MAX / SECS_PER_DAY);
        let visits = self.visits.prune_before(now.saturating_sub(visit_days.saturating_mul(SECS_PER_DAY)));
        self.ingest_limiter.prune(now);

        let report = ExpiryReport { presence_rows, ripples, proximity_events, crossed_paths, visits };
        if report != ExpiryReport::default() {
            debug!("[PresenceEngine] Expiry sweep: {:?}", report);
        }
        report
    }

    fn rank_venues(
        &self,
        subject: Option<&str>,
        lat: f64,
        lng: f64,
        radius_m: f64,
        vibe: Option<String>,
        tags: BTreeSet<String>,
        now: i64,
    ) -> Result<Vec<VenueScore>> {
        let center = validate_point(lat, lng)?;
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(Error::InvalidInput(format!("radius must be positive, got {}", radius_m)));
        }
        let hour = hour_of(now).ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {}", now)))?;

        // Live vibes come from the finest maintained tile over each venue.
        let live_resolution = self.tiles.config().resolutions.iter().copied().max();
        let inputs: Vec<ScoringInput> = self
            .resolver
            .venues_within(&center, radius_m)
            .into_iter()
            .map(|(venue, distance_m)| {
                let live_vibes = live_resolution
                    .and_then(|res| hex_key(venue.location.latitude, venue.location.longitude, res).ok())
                    .and_then(|key| self.tiles.tile(&key))
                    .map(|t| t.vibe_histogram)
                    .unwrap_or_default();
                let friend_visitors =
                    subject.map_or(0, |s| self.visits.friends_who_visited(&venue.id, s, self.friends.as_ref()));
                ScoringInput {
                    visits: self.visits.stats(&venue.id).unwrap_or_default(),
                    venue_id: venue.id,
                    name: venue.name,
                    distance_m,
                    friend_visitors,
                    live_vibes,
                    tags: venue.tags,
                }
            })
            .collect();

        let query = ScoreQuery { subject_id: subject.map(str::to_string), center, radius_m, vibe, tags, now, hour };
        Ok(score(&query, &inputs, &self.config.scoring))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce::MovementClass;
    use crate::geo_utils::{bounds_around, offset_point};
    use crate::guard::RateLimitConfig;
    use crate::presence::{NoFriends, StaticFriendGraph};
    use crate::proximity::{PairKey, ProximityEventKind};

    // 2024-03-15T10:00:00Z
    const MORNING: i64 = 1_710_496_800;

    fn origin() -> GpsPoint {
        GpsPoint::new(51.5074, -0.1278)
    }

    fn engine() -> PresenceEngine {
        PresenceEngine::new(EngineConfig::default(), Arc::new(NoFriends)).unwrap()
    }

    fn engine_with_friends(graph: Arc<StaticFriendGraph>) -> PresenceEngine {
        PresenceEngine::new(EngineConfig::default(), graph).unwrap()
    }

    fn walk(engine: &PresenceEngine, subject: &str, at: GpsPoint, ts: i64) -> IngestOutcome {
        let ping = PresencePing::new(subject, at, ts).with_movement(MovementClass::Walking);
        engine.upsert_presence(subject, &ping, ts).unwrap()
    }

    fn create_venue(engine: &PresenceEngine, id: &str, name: &str, at: GpsPoint) -> String {
        let candidate = VenueCandidate {
            provider: "osm".into(),
            provider_id: id.into(),
            name: name.into(),
            address: None,
            location: at,
            tags: vec![],
        };
        engine.resolve_venue(&candidate, "seed", MORNING).unwrap().venue_id().unwrap().to_string()
    }

    fn create_tagged_venue(engine: &PresenceEngine, id: &str, name: &str, at: GpsPoint, tags: &[&str]) -> String {
        let candidate = VenueCandidate {
            provider: "osm".into(),
            provider_id: id.into(),
            name: name.into(),
            address: None,
            location: at,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        engine.resolve_venue(&candidate, "seed", MORNING).unwrap().venue_id().unwrap().to_string()
    }

    #[test]
    fn test_rejects_writes_for_other_subjects() {
        let engine = engine();
        let ping = PresencePing::new("bob", origin(), MORNING);
        assert!(matches!(engine.upsert_presence("alice", &ping, MORNING), Err(Error::Unauthorized(_))));
        assert!(matches!(engine.set_visibility("alice", "bob", Visibility::Hidden), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_rejects_unknown_venue() {
        let engine = engine();
        let ping = PresencePing::new("alice", origin(), MORNING).with_venue("nowhere");
        assert!(matches!(engine.upsert_presence("alice", &ping, MORNING), Err(Error::UnknownVenue(_))));

        let venue = create_venue(&engine, "1", "The Lamb", origin());
        let ping = PresencePing::new("alice", origin(), MORNING).with_venue(venue.clone());
        let outcome = engine.upsert_presence("alice", &ping, MORNING).unwrap();
        assert_eq!(outcome.presence.unwrap().venue_id, Some(venue.clone()));
        assert_eq!(engine.visits().stats(&venue).unwrap().total_visits, 1);
    }

    #[test]
    fn test_replayed_ping_is_one_row() {
        let engine = engine();
        let ping = PresencePing::new("alice", origin(), MORNING).with_vibe("chill");
        assert!(engine.upsert_presence("alice", &ping, MORNING).unwrap().written);

        let replay = engine.upsert_presence("alice", &ping, MORNING + 1).unwrap();
        assert!(!replay.written);
        assert_eq!(replay.reason, WriteReason::Suppressed);
        assert_eq!(engine.store().len(), 1);
        assert_eq!(engine.store().get("alice", MORNING + 1).unwrap().vibe.as_deref(), Some("chill"));
    }

    #[test]
    fn test_ingest_rate_limit() {
        let config = EngineConfig {
            ingest_rate: RateLimitConfig { max_requests: 2, window_secs: 60 },
            ..Default::default()
        };
        let engine = PresenceEngine::new(config, Arc::new(NoFriends)).unwrap();
        let ping = PresencePing::new("alice", origin(), MORNING);
        engine.upsert_presence("alice", &ping, MORNING).unwrap();
        engine.upsert_presence("alice", &ping, MORNING + 1).unwrap();
        assert!(matches!(
            engine.upsert_presence("alice", &ping, MORNING + 2),
            Err(Error::RateLimited { .. })
        ));
    }

    #[test]
    fn test_nearby_users_respects_visibility() {
        let graph = Arc::new(StaticFriendGraph::new());
        graph.befriend("alice", "carol");
        let engine = engine_with_friends(Arc::clone(&graph));

        walk(&engine, "alice", origin(), MORNING);
        walk(&engine, "bob", offset_point(&origin(), 50.0, 0.0), MORNING);
        let carol = PresencePing::new("carol", offset_point(&origin(), 80.0, 0.0), MORNING)
            .with_visibility(Visibility::FriendsOnly);
        engine.upsert_presence("carol", &carol, MORNING).unwrap();
        let dave = PresencePing::new("dave", offset_point(&origin(), 10.0, 0.0), MORNING)
            .with_visibility(Visibility::Hidden);
        engine.upsert_presence("dave", &dave, MORNING).unwrap();

        let everyone = engine.nearby_users("alice", 51.5074, -0.1278, 200.0, &NearbyFilters::default(), MORNING).unwrap();
        let ids: Vec<&str> = everyone.iter().map(|u| u.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "carol"]);

        let friends = NearbyFilters { friends_only: true, vibe: None };
        let ids: Vec<String> = engine
            .nearby_users("alice", 51.5074, -0.1278, 200.0, &friends, MORNING)
            .unwrap()
            .into_iter()
            .map(|u| u.subject_id)
            .collect();
        assert_eq!(ids, vec!["carol".to_string()]);

        engine.set_visibility("bob", "bob", Visibility::Hidden).unwrap();
        let ids: Vec<String> = engine
            .nearby_users("alice", 51.5074, -0.1278, 200.0, &NearbyFilters::default(), MORNING)
            .unwrap()
            .into_iter()
            .map(|u| u.subject_id)
            .collect();
        assert_eq!(ids, vec!["carol".to_string()]);
    }

    #[test]
    fn test_end_to_end_proximity_and_crossed_path() {
        let engine = engine();
        let budget = BuildBudget::unlimited();
        let near = offset_point(&origin(), 15.0, 0.0);

        // Together for three minutes.
        for minute in 0..=3 {
            let ts = MORNING + minute * 60;
            walk(&engine, "alice", origin(), ts);
            walk(&engine, "bob", near, ts);
            engine.run_proximity_tick(ts, &budget).unwrap();
        }

        // Bob walks off; the pair cools down and exits.
        let far = offset_point(&origin(), 1_000.0, 0.0);
        for minute in 4..=6 {
            let ts = MORNING + minute * 60;
            walk(&engine, "alice", origin(), ts);
            walk(&engine, "bob", far, ts);
            engine.run_proximity_tick(ts, &budget).unwrap();
        }

        let events = engine.detector().events_for(&PairKey::new("alice", "bob"));
        let count = |kind| events.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(ProximityEventKind::Enter), 1);
        assert!(count(ProximityEventKind::Sustain) >= 1);
        assert_eq!(count(ProximityEventKind::Exit), 1);

        let report = engine.materialize_crossed_paths(MORNING + 400);
        assert_eq!(report.created, 1);
        assert_eq!(engine.crossed_paths_today("alice", MORNING + 400).len(), 1);
        assert_eq!(engine.crossed_paths_today("bob", MORNING + 400).len(), 1);

        // Running again over the same window adds nothing.
        let again = engine.materialize_crossed_paths(MORNING + 400);
        assert_eq!(again, MaterializeReport::default());
        assert_eq!(engine.crossed_paths_today("alice", MORNING + 400).len(), 1);
    }

    #[test]
    fn test_tile_build_feeds_vibe_clusters() {
        let engine = engine();
        for (i, vibe) in ["party", "party", "chill"].iter().enumerate() {
            let subject = format!("user-{}", i);
            let ping = PresencePing::new(subject.as_str(), origin(), MORNING).with_vibe(*vibe);
            engine.upsert_presence(&subject, &ping, MORNING).unwrap();
        }

        let report = engine.run_tile_build(MORNING, &BuildBudget::unlimited()).unwrap();
        assert!(report.completed);
        assert!(report.cells_upserted > 0);

        let bbox = bounds_around(&origin(), 500.0);
        let clusters = engine.vibe_clusters(&bbox, 10, MORNING).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].total_members, 3);
        assert_eq!(clusters[0].dominant_vibe.as_deref(), Some("party"));

        // Hiding a member refreshes the cell on the next build.
        engine.set_visibility("user-0", "user-0", Visibility::Hidden).unwrap();
        engine.run_tile_build(MORNING + 10, &BuildBudget::unlimited()).unwrap();
        let clusters = engine.vibe_clusters(&bbox, 10, MORNING + 10).unwrap();
        assert_eq!(clusters[0].total_members, 2);
    }

    #[test]
    fn test_personalized_recs_use_friend_visits() {
        let graph = Arc::new(StaticFriendGraph::new());
        graph.befriend("alice", "bob");
        let engine = engine_with_friends(Arc::clone(&graph));

        let pub_a = create_venue(&engine, "1", "The Lamb", offset_point(&origin(), 300.0, 0.0));
        let pub_b = create_venue(&engine, "2", "The Crown", offset_point(&origin(), -300.0, 0.0));

        let ping = PresencePing::new("bob", offset_point(&origin(), 300.0, 0.0), MORNING).with_venue(pub_a.clone());
        engine.upsert_presence("bob", &ping, MORNING).unwrap();

        let recs = engine.personalized_recs("alice", 51.5074, -0.1278, &RecFilters::default(), MORNING + 60).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].venue_id, pub_a);
        assert!(recs[0].breakdown.friends > 0.0);
        assert_eq!(recs[1].venue_id, pub_b);
        assert_eq!(recs[1].breakdown.friends, 0.0);

        let trending = engine.trending_venues(51.5074, -0.1278, 1_000.0, MORNING + 60).unwrap();
        assert_eq!(trending[0].venue_id, pub_a);
        assert_eq!(trending[0].breakdown.friends, 0.0);
    }

    #[test]
    fn test_ripples_filtered_for_viewer() {
        let graph = Arc::new(StaticFriendGraph::new());
        graph.befriend("alice", "bob");
        let engine = engine_with_friends(Arc::clone(&graph));

        walk(&engine, "bob", origin(), MORNING);
        walk(&engine, "carol", offset_point(&origin(), 10.0, 0.0), MORNING);
        walk(&engine, "dan", offset_point(&origin(), 2_000.0, 0.0), MORNING);
        walk(&engine, "erin", offset_point(&origin(), 2_010.0, 0.0), MORNING);
        engine.run_proximity_tick(MORNING, &BuildBudget::unlimited()).unwrap();

        let bbox = bounds_around(&origin(), 5_000.0);
        assert_eq!(engine.ripple_signals_near("alice", &bbox, 600, false, MORNING).len(), 2);

        let friends = engine.ripple_signals_near("alice", &bbox, 600, true, MORNING);
        assert_eq!(friends.len(), 1);
        assert!(friends[0].pair.contains("bob"));

        engine.set_visibility("carol", "carol", Visibility::Hidden).unwrap();
        assert_eq!(engine.ripple_signals_near("alice", &bbox, 600, false, MORNING).len(), 1);
    }

    #[test]
    fn test_expire_stale_clears_presence() {
        let engine = engine();
        walk(&engine, "alice", origin(), MORNING);
        let report = engine.expire_stale(MORNING + 901);
        assert_eq!(report.presence_rows, 1);
        assert!(engine.store().is_empty());
    }

    #[test]
    fn test_materialization_picks_up_tick_that_finished_late() {
        let engine = engine();
        let budget = BuildBudget::unlimited();
        let near = offset_point(&origin(), 15.0, 0.0);

        for minute in 0..=1 {
            let ts = MORNING + minute * 60;
            walk(&engine, "alice", origin(), ts);
            walk(&engine, "bob", near, ts);
            engine.run_proximity_tick(ts, &budget).unwrap();
        }
        walk(&engine, "alice", origin(), MORNING + 120);
        walk(&engine, "bob", near, MORNING + 120);

        // The crossed-path job reads the log before the minute-2 tick lands.
        assert_eq!(engine.materialize_crossed_paths(MORNING + 123), MaterializeReport::default());
        let tick = engine.run_proximity_tick(MORNING + 120, &budget).unwrap();
        let kinds: Vec<ProximityEventKind> = tick.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ProximityEventKind::Enter]);

        // Bob leaves straight away, so no Sustain ever follows.
        let far = offset_point(&origin(), 1_000.0, 0.0);
        for minute in 3..=6 {
            let ts = MORNING + minute * 60;
            walk(&engine, "alice", origin(), ts);
            walk(&engine, "bob", far, ts);
            engine.run_proximity_tick(ts, &budget).unwrap();
            engine.materialize_crossed_paths(ts + 3);
        }

        let paths = engine.crossed_paths_today("alice", MORNING + 400);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].first_seen_at, MORNING + 120);
        assert_eq!(paths[0].sightings, 1);
    }

    #[test]
    fn test_personalized_recs_tag_filter() {
        let graph = Arc::new(StaticFriendGraph::new());
        graph.befriend("alice", "bob");
        let engine = engine_with_friends(Arc::clone(&graph));

        let pub_id = create_tagged_venue(&engine, "1", "The Lamb", offset_point(&origin(), 100.0, 0.0), &["Pub"]);
        let cafe_id =
            create_tagged_venue(&engine, "2", "Bean There", offset_point(&origin(), -600.0, 0.0), &["coffee", "wifi"]);
        let ping = PresencePing::new("bob", offset_point(&origin(), 100.0, 0.0), MORNING).with_venue(pub_id.clone());
        engine.upsert_presence("bob", &ping, MORNING).unwrap();

        let all = engine.personalized_recs("alice", 51.5074, -0.1278, &RecFilters::default(), MORNING + 60).unwrap();
        assert_eq!(all[0].venue_id, pub_id);
        assert_eq!(all.len(), 2);

        let coffee = RecFilters { tags: vec![" Coffee ".into(), "brunch".into()], ..Default::default() };
        let recs = engine.personalized_recs("alice", 51.5074, -0.1278, &coffee, MORNING + 60).unwrap();
        let ids: Vec<&str> = recs.iter().map(|r| r.venue_id.as_str()).collect();
        assert_eq!(ids, vec![cafe_id.as_str()]);
    }

    #[test]
    fn test_expire_stale_prunes_old_visits() {
        let engine = engine();
        let venue = create_venue(&engine, "1", "The Lamb", origin());
        let ping = PresencePing::new("alice", origin(), MORNING).with_venue(venue.clone());
        engine.upsert_presence("alice", &ping, MORNING).unwrap();

        assert_eq!(engine.expire_stale(MORNING + 86_400).visits, 0);
        assert_eq!(engine.visits().stats(&venue).unwrap().total_visits, 1);

        let retention = engine.config().retention.visit_days as i64 * 86_400;
        let report = engine.expire_stale(MORNING + retention + 1);
        assert_eq!(report.visits, 1);
        assert!(engine.visits().stats(&venue).is_none());
    }
}
