//! # Presence Store
//!
//! Keyed, TTL-expiring record of each subject's last known location, vibe
//! and visibility.
//!
//! - One row per subject; writes are last-write-wins by ping timestamp, with
//!   equal timestamps replaced in arrival order.
//! - Expiry uses a single predicate ([`Presence::is_expired`]) for both the
//!   periodic sweep and lazy filtering on read.
//! - Visibility is resolved at read time from the subject's latest toggle,
//!   so a row written while public is never served after the subject hides.
//! - A coarse geohash index narrows `nearby` scans to a 3×3 block of cells.
//! - Every write remembers the old and new location in a dirty set, which
//!   the tile builder drains for incremental refreshes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::debounce::MovementClass;
use crate::error::{Error, Result};
use crate::geo_utils::{haversine_distance, validate_point};
use crate::spatial::{geohash_key, geohash_neighbors, precision_for_radius};
use crate::{GpsPoint, SubjectId};

/// Who may see a subject's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    FriendsOnly,
    Hidden,
}

/// An incoming location ping, as received from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePing {
    pub subject_id: SubjectId,
    pub location: GpsPoint,
    /// Horizontal accuracy radius reported by the device, metres.
    pub accuracy_m: Option<f64>,
    pub vibe: Option<String>,
    /// `None` keeps the subject's current visibility.
    pub visibility: Option<Visibility>,
    pub venue_id: Option<String>,
    /// Declared movement class; inferred from speed when absent.
    pub movement: Option<MovementClass>,
    /// Device timestamp, Unix seconds.
    pub timestamp: i64,
}

impl PresencePing {
    pub fn new(subject_id: impl Into<SubjectId>, location: GpsPoint, timestamp: i64) -> Self {
        Self {
            subject_id: subject_id.into(),
            location,
            accuracy_m: None,
            vibe: None,
            visibility: None,
            venue_id: None,
            movement: None,
            timestamp,
        }
    }

    pub fn with_vibe(mut self, vibe: impl Into<String>) -> Self {
        self.vibe = Some(vibe.into());
        self
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_venue(mut self, venue_id: impl Into<String>) -> Self {
        self.venue_id = Some(venue_id.into());
        self
    }

    pub fn with_movement(mut self, movement: MovementClass) -> Self {
        self.movement = Some(movement);
        self
    }

    /// Reject malformed payloads before they reach the store.
    pub fn validate(&self) -> Result<()> {
        if self.subject_id.trim().is_empty() {
            return Err(Error::InvalidInput("subject_id is empty".into()));
        }
        validate_point(self.location.latitude, self.location.longitude)?;
        if let Some(acc) = self.accuracy_m {
            if !acc.is_finite() || acc < 0.0 {
                return Err(Error::InvalidInput(format!("accuracy must be >= 0, got {}", acc)));
            }
        }
        if matches!(&self.vibe, Some(v) if v.trim().is_empty()) {
            return Err(Error::InvalidInput("vibe is empty".into()));
        }
        Ok(())
    }
}

/// A subject's live presence row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub subject_id: SubjectId,
    pub location: GpsPoint,
    pub accuracy_m: Option<f64>,
    pub vibe: Option<String>,
    pub visibility: Visibility,
    pub venue_id: Option<String>,
    pub updated_at: i64,
    pub expires_at: i64,
}

impl Presence {
    /// The one expiry predicate shared by sweeps and reads.
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// Result of [`PresenceStore::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// The ping replaced (or created) the row.
    Written(Presence),
    /// A newer row already exists; it is returned unchanged.
    Superseded(Presence),
}

impl UpsertOutcome {
    pub fn presence(&self) -> &Presence {
        match self {
            Self::Written(p) | Self::Superseded(p) => p,
        }
    }

    pub fn was_written(&self) -> bool {
        matches!(self, Self::Written(_))
    }
}

/// Friendship predicate supplied by the social graph service.
pub trait FriendGraph: Send + Sync {
    fn is_friend(&self, a: &str, b: &str) -> bool;
}

/// A graph where nobody is friends with anybody.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFriends;

impl FriendGraph for NoFriends {
    fn is_friend(&self, _a: &str, _b: &str) -> bool {
        false
    }
}

/// Symmetric in-memory friendship set.
#[derive(Debug, Default)]
pub struct StaticFriendGraph {
    edges: RwLock<HashSet<(String, String)>>,
}

impl StaticFriendGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn befriend(&self, a: &str, b: &str) {
        self.edges.write().insert(ordered(a, b));
    }

    pub fn unfriend(&self, a: &str, b: &str) {
        self.edges.write().remove(&ordered(a, b));
    }
}

impl FriendGraph for StaticFriendGraph {
    fn is_friend(&self, a: &str, b: &str) -> bool {
        self.edges.read().contains(&ordered(a, b))
    }
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a <= b { (a.to_string(), b.to_string()) } else { (b.to_string(), a.to_string()) }
}

/// Read-time filter for presence queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisibilityFilter {
    /// The subject asking. Anonymous viewers only see public rows.
    pub viewer: Option<SubjectId>,
    /// Only return the viewer's friends.
    pub friends_only: bool,
    /// Only return subjects currently broadcasting this vibe.
    pub vibe: Option<String>,
}

impl VisibilityFilter {
    pub fn viewer(viewer: impl Into<SubjectId>) -> Self {
        Self { viewer: Some(viewer.into()), ..Self::default() }
    }

    /// Whether `viewer` may see `presence` given its effective visibility.
    pub fn allows(&self, presence: &Presence, friends: &dyn FriendGraph) -> bool {
        let is_friend = |viewer: &str| friends.is_friend(viewer, &presence.subject_id);

        if let Some(vibe) = &self.vibe {
            if presence.vibe.as_deref() != Some(vibe.as_str()) {
                return false;
            }
        }

        match (presence.visibility, self.viewer.as_deref()) {
            (Visibility::Hidden, _) => false,
            (Visibility::FriendsOnly, Some(viewer)) => is_friend(viewer),
            (Visibility::FriendsOnly, None) => false,
            (Visibility::Public, Some(viewer)) => !self.friends_only || is_friend(viewer),
            (Visibility::Public, None) => !self.friends_only,
        }
    }
}

/// Store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Row lifetime after the last accepted ping (default: 900s).
    pub ttl_secs: i64,
    /// Geohash precision of the secondary index (default: 6, ~1.2 × 0.6 km).
    pub index_precision: usize,
    /// Dirty-set size beyond which incremental tile refresh gives up and
    /// a global rebuild is cheaper (default: 50,000).
    pub max_dirty_points: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            index_precision: 6,
            max_dirty_points: 50_000,
        }
    }
}

/// Points touched since the last drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtySet {
    pub points: Vec<GpsPoint>,
    /// The set overflowed and was truncated; refresh everything.
    pub overflowed: bool,
}

/// Geohash cell -> subjects currently indexed there.
#[derive(Debug, Default)]
struct CellIndex {
    cells: BTreeMap<String, BTreeSet<SubjectId>>,
}

impl CellIndex {
    fn insert(&mut self, key: String, subject: &str) {
        self.cells.entry(key).or_default().insert(subject.to_string());
    }

    fn remove(&mut self, key: &str, subject: &str) {
        if let Some(members) = self.cells.get_mut(key) {
            members.remove(subject);
            if members.is_empty() {
                self.cells.remove(key);
            }
        }
    }

    /// Subjects indexed under any cell starting with one of `prefixes`.
    fn members_under(&self, prefixes: &BTreeSet<String>) -> BTreeSet<SubjectId> {
        let mut ids = BTreeSet::new();
        for prefix in prefixes {
            for (_, members) in self
                .cells
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
            {
                ids.extend(members.iter().cloned());
            }
        }
        ids
    }
}

impl DirtySet {
    fn mark(&mut self, point: GpsPoint, limit: usize) {
        if self.points.len() >= limit {
            self.overflowed = true;
        } else {
            self.points.push(point);
        }
    }
}

/// Thread-safe presence table.
///
/// Rows live in a `DashMap`, so a write only locks its own shard. The cell
/// index and dirty set sit behind their own short-held locks and are always
/// taken after a row shard, never before. Batch readers walk the map shard
/// by shard and never hold a lock that ingestion needs for long.
#[derive(Debug)]
pub struct PresenceStore {
    rows: DashMap<SubjectId, Presence>,
    index: RwLock<CellIndex>,
    dirty: Mutex<DirtySet>,
    /// Latest visibility toggle per subject (identity service).
    visibility: DashMap<SubjectId, Visibility>,
    config: PresenceConfig,
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

impl PresenceStore {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            rows: DashMap::new(),
            index: RwLock::new(CellIndex::default()),
            dirty: Mutex::new(DirtySet::default()),
            visibility: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn cell_of(&self, location: &GpsPoint) -> Result<String> {
        geohash_key(location.latitude, location.longitude, self.config.index_precision)
    }

    fn mark_dirty(&self, points: &[GpsPoint]) {
        let limit = self.config.max_dirty_points;
        let mut dirty = self.dirty.lock();
        for point in points {
            dirty.mark(*point, limit);
        }
    }

    /// Insert or replace the subject's row.
    ///
    /// `ttl_secs` overrides the configured lifetime when given. A superseded
    /// ping changes nothing, including the subject's visibility.
    pub fn upsert(&self, ping: &PresencePing, ttl_secs: Option<i64>) -> Result<UpsertOutcome> {
        ping.validate()?;
        let ttl = ttl_secs.unwrap_or(self.config.ttl_secs);
        if ttl <= 0 {
            return Err(Error::InvalidInput(format!("ttl must be positive, got {}", ttl)));
        }
        let key = self.cell_of(&ping.location)?;

        // The entry holds the subject's shard until the row is replaced.
        let entry = self.rows.entry(ping.subject_id.clone());
        let previous = match &entry {
            Entry::Occupied(existing) => Some(existing.get().clone()),
            Entry::Vacant(_) => None,
        };
        if let Some(existing) = &previous {
            if ping.timestamp < existing.updated_at {
                drop(entry);
                debug!(
                    "[PresenceStore] Ignoring out-of-order ping for {} ({} < {})",
                    ping.subject_id, ping.timestamp, existing.updated_at
                );
                return Ok(UpsertOutcome::Superseded(self.effective(existing.clone())));
            }
        }

        if let Some(visibility) = ping.visibility {
            self.visibility.insert(ping.subject_id.clone(), visibility);
        }
        let visibility = ping
            .visibility
            .or_else(|| previous.as_ref().map(|p| p.visibility))
            .unwrap_or_default();

        let row = Presence {
            subject_id: ping.subject_id.clone(),
            location: ping.location,
            accuracy_m: ping.accuracy_m,
            vibe: ping.vibe.clone(),
            visibility,
            venue_id: ping.venue_id.clone(),
            updated_at: ping.timestamp,
            expires_at: ping.timestamp + ttl,
        };

        {
            let mut index = self.index.write();
            if let Some(old) = &previous {
                let old_key = self.cell_of(&old.location)?;
                if old_key != key {
                    index.remove(&old_key, &old.subject_id);
                }
            }
            index.insert(key, &row.subject_id);
        }
        match &previous {
            Some(old) => self.mark_dirty(&[old.location, row.location]),
            None => self.mark_dirty(&[row.location]),
        }
        entry.insert(row.clone());

        Ok(UpsertOutcome::Written(self.effective(row)))
    }

    /// The subject's live row, if any.
    pub fn get(&self, subject_id: &str, now: i64) -> Option<Presence> {
        let row = self.rows.get(subject_id).map(|r| r.value().clone())?;
        if row.is_expired(now) {
            return None;
        }
        Some(self.effective(row))
    }

    /// Record a visibility toggle from the identity service.
    ///
    /// A change marks the subject's cell dirty so the next tile build stops
    /// (or starts) counting them.
    pub fn set_visibility(&self, subject_id: &str, visibility: Visibility) {
        let previous = self.visibility.insert(subject_id.to_string(), visibility);
        if previous == Some(visibility) {
            return;
        }
        let location = self.rows.get(subject_id).map(|p| p.location);
        if let Some(location) = location {
            self.mark_dirty(&[location]);
        }
    }

    /// Live rows within `radius_m` of `center`, closest first, filtered for
    /// the viewer. The viewer's own row is never included.
    pub fn nearby(
        &self,
        center: &GpsPoint,
        radius_m: f64,
        filter: &VisibilityFilter,
        friends: &dyn FriendGraph,
        now: i64,
    ) -> Result<Vec<(Presence, f64)>> {
        validate_point(center.latitude, center.longitude)?;
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(Error::InvalidInput(format!("radius must be positive, got {}", radius_m)));
        }

        let precision = precision_for_radius(radius_m, center.latitude).min(self.config.index_precision);
        let block = geohash_neighbors(&geohash_key(center.latitude, center.longitude, precision)?)?;

        let ids = self.index.read().members_under(&block);
        let candidates: Vec<Presence> = ids
            .iter()
            .filter_map(|id| self.rows.get(id).map(|r| r.value().clone()))
            .collect();

        let mut hits: Vec<(Presence, f64)> = candidates
            .into_iter()
            .filter(|p| !p.is_expired(now))
            .filter(|p| filter.viewer.as_deref() != Some(p.subject_id.as_str()))
            .map(|p| self.effective(p))
            .filter(|p| filter.allows(p, friends))
            .filter_map(|p| {
                let d = haversine_distance(center, &p.location);
                (d <= radius_m).then_some((p, d))
            })
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.subject_id.cmp(&b.0.subject_id)));
        Ok(hits)
    }

    /// All live rows with effective visibility, ordered by subject id.
    pub fn snapshot(&self, now: i64) -> Vec<Presence> {
        let live: Vec<Presence> = self
            .rows
            .iter()
            .filter(|r| !r.value().is_expired(now))
            .map(|r| r.value().clone())
            .collect();
        let mut rows: Vec<Presence> = live.into_iter().map(|p| self.effective(p)).collect();
        rows.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        rows
    }

    /// Delete expired rows. Returns how many were removed.
    ///
    /// Candidates are collected first; each is then re-checked under its own
    /// shard, so a row refreshed in between survives.
    pub fn expire_stale(&self, now: i64) -> usize {
        let candidates: Vec<SubjectId> = self
            .rows
            .iter()
            .filter(|r| r.value().is_expired(now))
            .map(|r| r.key().clone())
            .collect();

        let removed = candidates
            .iter()
            .filter(|id| self.remove_where(id, |row| row.is_expired(now)).is_some())
            .count();

        if removed > 0 {
            debug!("[PresenceStore] Expired {} rows", removed);
        }
        removed
    }

    /// Remove a subject's row outright (account deletion, sign-out).
    pub fn remove(&self, subject_id: &str) -> Option<Presence> {
        self.remove_where(subject_id, |_| true)
    }

    fn remove_where(&self, subject_id: &str, predicate: impl FnOnce(&Presence) -> bool) -> Option<Presence> {
        let Entry::Occupied(entry) = self.rows.entry(subject_id.to_string()) else {
            return None;
        };
        if !predicate(entry.get()) {
            return None;
        }
        if let Ok(key) = self.cell_of(&entry.get().location) {
            self.index.write().remove(&key, subject_id);
        }
        let (_, row) = entry.remove_entry();
        self.mark_dirty(&[row.location]);
        Some(row)
    }

    /// Drain the points touched since the previous call.
    pub fn take_dirty(&self) -> DirtySet {
        std::mem::take(&mut *self.dirty.lock())
    }

    /// Number of rows, including ones not yet swept.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn effective(&self, mut row: Presence) -> Presence {
        if let Some(toggle) = self.visibility.get(&row.subject_id) {
            row.visibility = *toggle;
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_point;

    fn origin() -> GpsPoint {
        GpsPoint::new(40.7128, -74.0060)
    }

    fn ping(id: &str, location: GpsPoint, ts: i64) -> PresencePing {
        PresencePing::new(id, location, ts)
    }

    #[test]
    fn test_upsert_then_get() {
        let store = PresenceStore::default();
        let outcome = store.upsert(&ping("alice", origin(), 1_000).with_vibe("chill"), None).unwrap();
        assert!(outcome.was_written());

        let row = store.get("alice", 1_000).unwrap();
        assert_eq!(row.vibe.as_deref(), Some("chill"));
        assert_eq!(row.expires_at, 1_900);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let store = PresenceStore::default();
        let p = ping("alice", origin(), 1_000).with_vibe("party");
        for _ in 0..5 {
            store.upsert(&p, None).unwrap();
        }
        assert_eq!(store.len(), 1);
        let row = store.get("alice", 1_000).unwrap();
        assert_eq!(row.location, origin());
        assert_eq!(row.updated_at, 1_000);
        assert_eq!(store.snapshot(1_000).len(), 1);
    }

    #[test]
    fn test_older_ping_is_superseded() {
        let store = PresenceStore::default();
        store.upsert(&ping("alice", origin(), 2_000).with_vibe("new"), None).unwrap();
        let outcome = store.upsert(&ping("alice", origin(), 1_000).with_vibe("old"), None).unwrap();

        assert!(!outcome.was_written());
        assert_eq!(outcome.presence().vibe.as_deref(), Some("new"));
    }

    #[test]
    fn test_superseded_ping_keeps_visibility() {
        let store = PresenceStore::default();
        let o = origin();
        store.upsert(&ping("bob", o, 2_000).with_visibility(Visibility::Public), None).unwrap();
        let outcome = store.upsert(&ping("bob", o, 1_000).with_visibility(Visibility::Hidden), None).unwrap();

        assert!(!outcome.was_written());
        assert_eq!(outcome.presence().visibility, Visibility::Public);
        assert_eq!(store.get("bob", 2_000).unwrap().visibility, Visibility::Public);
        let seen = store.nearby(&o, 100.0, &VisibilityFilter::viewer("alice"), &NoFriends, 2_000).unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_concurrent_writers_and_sweeps() {
        let store = PresenceStore::default();
        let o = origin();
        std::thread::scope(|scope| {
            for w in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..200 {
                        let id = format!("w{}-{}", w, i % 50);
                        let at = offset_point(&o, (i * 7) as f64, (w * 100) as f64);
                        store.upsert(&ping(&id, at, 1_000 + i as i64), None).unwrap();
                    }
                });
            }
            let store = &store;
            scope.spawn(move || {
                for _ in 0..50 {
                    store.snapshot(1_100);
                    store.expire_stale(1_100);
                    store.take_dirty();
                }
            });
        });

        assert_eq!(store.len(), 200);
        assert_eq!(store.snapshot(1_200).len(), 200);
        // Every row is indexed exactly where it now sits.
        let hits = store.nearby(&o, 5_000.0, &VisibilityFilter::default(), &NoFriends, 1_200).unwrap();
        assert_eq!(hits.len(), 200);
        assert_eq!(store.expire_stale(10_000), 200);
        assert!(store.index.read().cells.is_empty());
    }

    #[test]
    fn test_equal_timestamp_replaces() {
        let store = PresenceStore::default();
        store.upsert(&ping("alice", origin(), 1_000).with_vibe("a"), None).unwrap();
        store.upsert(&ping("alice", origin(), 1_000).with_vibe("b"), None).unwrap();
        assert_eq!(store.get("alice", 1_000).unwrap().vibe.as_deref(), Some("b"));
    }

    #[test]
    fn test_expiry_predicate_agrees() {
        let store = PresenceStore::default();
        store.upsert(&ping("alice", origin(), 1_000), Some(60)).unwrap();

        assert!(store.get("alice", 1_060).is_some());
        assert!(store.get("alice", 1_061).is_none());
        assert_eq!(store.expire_stale(1_060), 0);
        assert_eq!(store.expire_stale(1_061), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_ping_rejected() {
        let store = PresenceStore::default();
        let bad = ping("alice", GpsPoint::new(120.0, 0.0), 1);
        assert!(matches!(store.upsert(&bad, None), Err(Error::InvalidCoordinates { .. })));
        let bad = ping("", origin(), 1);
        assert!(matches!(store.upsert(&bad, None), Err(Error::InvalidInput(_))));
        let bad = ping("alice", origin(), 1).with_accuracy(-3.0);
        assert!(store.upsert(&bad, None).is_err());
    }

    #[test]
    fn test_nearby_radius_and_order() {
        let store = PresenceStore::default();
        let o = origin();
        store.upsert(&ping("near", offset_point(&o, 50.0, 0.0), 100), None).unwrap();
        store.upsert(&ping("mid", offset_point(&o, 0.0, 300.0), 100), None).unwrap();
        store.upsert(&ping("far", offset_point(&o, 3_000.0, 0.0), 100), None).unwrap();

        let hits = store.nearby(&o, 500.0, &VisibilityFilter::default(), &NoFriends, 100).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(p, _)| p.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
    }

    #[test]
    fn test_nearby_across_cell_boundary_with_large_radius() {
        let store = PresenceStore::default();
        let o = origin();
        store.upsert(&ping("ring", offset_point(&o, 4_000.0, 4_000.0), 100), None).unwrap();
        let hits = store.nearby(&o, 6_000.0, &VisibilityFilter::default(), &NoFriends, 100).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_visibility_toggle_hides_existing_row() {
        let store = PresenceStore::default();
        let o = origin();
        store.upsert(&ping("bob", offset_point(&o, 10.0, 0.0), 100), None).unwrap();
        store.set_visibility("bob", Visibility::Hidden);

        let filter = VisibilityFilter::viewer("alice");
        assert!(store.nearby(&o, 100.0, &filter, &NoFriends, 100).unwrap().is_empty());
        assert!(store.snapshot(100).iter().all(|p| p.visibility == Visibility::Hidden));
    }

    #[test]
    fn test_friends_only_visibility() {
        let store = PresenceStore::default();
        let friends = StaticFriendGraph::new();
        friends.befriend("alice", "bob");
        let o = origin();
        store
            .upsert(&ping("bob", offset_point(&o, 10.0, 0.0), 100).with_visibility(Visibility::FriendsOnly), None)
            .unwrap();

        let alice = store.nearby(&o, 100.0, &VisibilityFilter::viewer("alice"), &friends, 100).unwrap();
        let carol = store.nearby(&o, 100.0, &VisibilityFilter::viewer("carol"), &friends, 100).unwrap();
        let anon = store.nearby(&o, 100.0, &VisibilityFilter::default(), &friends, 100).unwrap();
        assert_eq!(alice.len(), 1);
        assert!(carol.is_empty());
        assert!(anon.is_empty());
    }

    #[test]
    fn test_viewer_excluded_and_vibe_filter() {
        let store = PresenceStore::default();
        let o = origin();
        store.upsert(&ping("alice", o, 100).with_vibe("chill"), None).unwrap();
        store.upsert(&ping("bob", offset_point(&o, 5.0, 0.0), 100).with_vibe("party"), None).unwrap();
        store.upsert(&ping("carol", offset_point(&o, 8.0, 0.0), 100).with_vibe("chill"), None).unwrap();

        let filter = VisibilityFilter { vibe: Some("chill".into()), ..VisibilityFilter::viewer("alice") };
        let hits = store.nearby(&o, 100.0, &filter, &NoFriends, 100).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(p, _)| p.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["carol"]);
    }

    #[test]
    fn test_moving_subject_reindexed() {
        let store = PresenceStore::default();
        let o = origin();
        store.upsert(&ping("alice", o, 100), None).unwrap();
        let far = offset_point(&o, 20_000.0, 0.0);
        store.upsert(&ping("alice", far, 200), None).unwrap();

        assert!(store.nearby(&o, 200.0, &VisibilityFilter::default(), &NoFriends, 200).unwrap().is_empty());
        assert_eq!(store.nearby(&far, 200.0, &VisibilityFilter::default(), &NoFriends, 200).unwrap().len(), 1);
    }

    #[test]
    fn test_dirty_set_drains() {
        let store = PresenceStore::default();
        store.upsert(&ping("alice", origin(), 100), None).unwrap();
        store.upsert(&ping("alice", offset_point(&origin(), 100.0, 0.0), 200), None).unwrap();

        let dirty = store.take_dirty();
        assert_eq!(dirty.points.len(), 3);
        assert!(!dirty.overflowed);
        assert!(store.take_dirty().points.is_empty());
    }
}
