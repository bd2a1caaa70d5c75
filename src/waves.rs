//! # Waves
//!
//! Multi-member proximity groups that form, stabilise and fade.
//!
//! Pings are assigned greedily: a subject joins the nearest wave whose
//! centroid is within `join_radius_m`, or seeds a new one. The periodic
//! [`WaveTracker::sweep`] then repairs what greedy assignment gets wrong:
//! it drops stale members, splits waves whose members drifted into separate
//! groups, merges waves that overlap, and advances each wave's lifecycle:
//!
//! ```text
//! Forming ──(≥ min_size for stable_after_secs)──▶ Stable
//!    │                                              │
//!    └──── no membership change for cooldown_after_secs ──▶ Cooldown ──▶ expired
//! ```
//!
//! A membership change on a cooling wave revives it as Forming.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geo_utils::{bounds_around, bounds_overlap, compute_center, haversine_distance};
use crate::presence::{Presence, Visibility};
use crate::{Bounds, GpsPoint, SubjectId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveConfig {
    /// Distance from a wave's centroid within which a ping joins it (default: 75m).
    pub join_radius_m: f64,
    /// Single-link distance that keeps members in one wave (default: 120m).
    pub split_distance_m: f64,
    /// Share of the smaller wave inside the larger's catchment that triggers
    /// a merge (default: 0.5).
    pub merge_overlap: f64,
    /// Members needed before a wave can stabilise (default: 3).
    pub min_size: usize,
    /// How long `min_size` must hold before Forming becomes Stable (default: 300s).
    pub stable_after_secs: i64,
    /// Quiet period before a wave cools down (default: 900s).
    pub cooldown_after_secs: i64,
    /// Time in Cooldown before the wave is dropped (default: 1800s).
    pub expire_after_secs: i64,
    /// Members whose presence is older than this are dropped (default: 300s).
    pub stale_member_secs: i64,
}

impl Default for WaveConfig {
    fn default() -> Self {
        Self {
            join_radius_m: 75.0,
            split_distance_m: 120.0,
            merge_overlap: 0.5,
            min_size: 3,
            stable_after_secs: 300,
            cooldown_after_secs: 900,
            expire_after_secs: 1800,
            stale_member_secs: 300,
        }
    }
}

impl WaveConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.join_radius_m > 0.0 && self.split_distance_m > 0.0) {
            return Err(Error::Config("wave radii must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.merge_overlap) {
            return Err(Error::Config(format!("waves.merge_overlap must be in [0, 1], got {}", self.merge_overlap)));
        }
        if self.min_size < 2 {
            return Err(Error::Config("waves.min_size must be at least 2".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveState {
    Forming,
    Stable,
    Cooldown,
}

/// A wave as exposed to queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialCluster {
    pub id: String,
    pub members: BTreeSet<SubjectId>,
    pub state: WaveState,
    pub size: usize,
    pub centroid: GpsPoint,
    pub first_seen_at: i64,
    pub last_membership_change_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
struct Wave {
    cluster: SocialCluster,
    state_since: i64,
    /// When the wave last reached `min_size`, cleared when it drops below.
    qualified_since: Option<i64>,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub dropped_members: usize,
    pub splits: usize,
    pub merges: usize,
    pub stabilized: usize,
    pub cooled: usize,
    pub expired: usize,
}

#[derive(Debug, Default)]
struct WaveTable {
    waves: BTreeMap<String, Wave>,
    member_of: HashMap<SubjectId, String>,
    positions: HashMap<SubjectId, GpsPoint>,
}

impl WaveTable {
    fn centroid_of(&self, members: &BTreeSet<SubjectId>) -> Option<GpsPoint> {
        compute_center(members.iter().filter_map(|m| self.positions.get(m)))
    }

    fn refresh(&mut self, id: &str, now: i64) {
        let Some(members) = self.waves.get(id).map(|w| w.cluster.members.clone()) else {
            return;
        };
        let centroid = self.centroid_of(&members);
        if let Some(wave) = self.waves.get_mut(id) {
            if let Some(c) = centroid {
                wave.cluster.centroid = c;
            }
            wave.cluster.size = members.len();
            wave.cluster.updated_at = now;
        }
    }

    fn touch_membership(&mut self, id: &str, now: i64) {
        if let Some(wave) = self.waves.get_mut(id) {
            wave.cluster.last_membership_change_at = now;
            if wave.cluster.state == WaveState::Cooldown {
                wave.cluster.state = WaveState::Forming;
                wave.state_since = now;
            }
        }
    }

    fn leave(&mut self, subject: &str, now: i64) -> bool {
        let Some(id) = self.member_of.remove(subject) else {
            return false;
        };
        if let Some(wave) = self.waves.get_mut(&id) {
            wave.cluster.members.remove(subject);
        }
        self.touch_membership(&id, now);
        self.refresh(&id, now);
        true
    }

    fn join(&mut self, subject: &str, id: &str, now: i64) {
        if let Some(wave) = self.waves.get_mut(id) {
            wave.cluster.members.insert(subject.to_string());
        }
        self.member_of.insert(subject.to_string(), id.to_string());
        self.touch_membership(id, now);
        self.refresh(id, now);
    }

    fn seed(&mut self, members: BTreeSet<SubjectId>, now: i64) -> String {
        let id = Uuid::new_v4().to_string();
        let centroid = self.centroid_of(&members).unwrap_or(GpsPoint::new(0.0, 0.0));
        for m in &members {
            self.member_of.insert(m.clone(), id.clone());
        }
        let cluster = SocialCluster {
            id: id.clone(),
            size: members.len(),
            members,
            state: WaveState::Forming,
            centroid,
            first_seen_at: now,
            last_membership_change_at: now,
            updated_at: now,
        };
        self.waves.insert(id.clone(), Wave { cluster, state_since: now, qualified_since: None });
        id
    }
}

/// Live waves and their members.
#[derive(Debug, Default)]
pub struct WaveTracker {
    config: WaveConfig,
    table: RwLock<WaveTable>,
}

impl WaveTracker {
    pub fn new(config: WaveConfig) -> Self {
        Self { config, table: RwLock::new(WaveTable::default()) }
    }

    pub fn config(&self) -> &WaveConfig {
        &self.config
    }

    /// Assign a fresh presence row to a wave. Returns the wave id, or `None`
    /// when the row is hidden or expired and the subject was removed.
    pub fn observe(&self, presence: &Presence, now: i64) -> Option<String> {
        let mut table = self.table.write();
        let subject = presence.subject_id.as_str();

        if presence.is_expired(now) || presence.visibility == Visibility::Hidden {
            table.positions.remove(subject);
            table.leave(subject, now);
            return None;
        }
        table.positions.insert(subject.to_string(), presence.location);

        if let Some(current) = table.member_of.get(subject).cloned() {
            let still_close = table
                .waves
                .get(&current)
                .map(|w| haversine_distance(&w.cluster.centroid, &presence.location) <= self.config.join_radius_m)
                .unwrap_or(false);
            if still_close {
                table.refresh(&current, now);
                return Some(current);
            }
            table.leave(subject, now);
        }

        let nearest = table
            .waves
            .values()
            .filter(|w| !w.cluster.members.is_empty())
            .map(|w| (haversine_distance(&w.cluster.centroid, &presence.location), &w.cluster.id))
            .filter(|(d, _)| *d <= self.config.join_radius_m)
            .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, id)| id.clone());

        match nearest {
            Some(id) => {
                table.join(subject, &id, now);
                Some(id)
            }
            None => Some(table.seed(BTreeSet::from([subject.to_string()]), now)),
        }
    }

    /// Periodic maintenance. `snapshot` is the current presence table.
    pub fn sweep(&self, snapshot: &[Presence], now: i64) -> SweepReport {
        let mut report = SweepReport::default();
        let mut table = self.table.write();

        // 1. Refresh positions and drop members that went stale or dark.
        let live: HashMap<&str, &Presence> = snapshot
            .iter()
            .filter(|p| !p.is_expired(now) && p.visibility != Visibility::Hidden)
            .filter(|p| now - p.updated_at <= self.config.stale_member_secs)
            .map(|p| (p.subject_id.as_str(), p))
            .collect();
        let tracked: Vec<SubjectId> = table.member_of.keys().cloned().collect();
        for subject in tracked {
            match live.get(subject.as_str()) {
                Some(p) => {
                    table.positions.insert(subject, p.location);
                }
                None => {
                    table.positions.remove(&subject);
                    table.leave(&subject, now);
                    report.dropped_members += 1;
                }
            }
        }

        // 2. Split waves whose members no longer form one group.
        let ids: Vec<String> = table.waves.keys().cloned().collect();
        for id in &ids {
            let components = match table.waves.get(id) {
                Some(w) => single_link_components(&w.cluster.members, &table.positions, self.config.split_distance_m),
                None => continue,
            };
            if components.len() < 2 {
                continue;
            }
            let mut components = components.into_iter();
            // Largest component keeps the id; the rest become new waves.
            let Some(keep) = components.next() else { continue };
            if let Some(wave) = table.waves.get_mut(id) {
                wave.cluster.members = keep;
            }
            table.touch_membership(id, now);
            for part in components {
                table.seed(part, now);
                report.splits += 1;
            }
        }

        // 3. Refresh centroids, drop empty waves.
        let ids: Vec<String> = table.waves.keys().cloned().collect();
        for id in &ids {
            table.refresh(id, now);
        }
        table.waves.retain(|_, w| !w.cluster.members.is_empty());

        // 4. Merge overlapping waves, larger absorbs smaller.
        while let Some((keep, absorb)) = self.find_merge(&table) {
            let members = table.waves.remove(&absorb).map(|w| w.cluster.members).unwrap_or_default();
            for m in &members {
                table.member_of.insert(m.clone(), keep.clone());
            }
            if let Some(wave) = table.waves.get_mut(&keep) {
                wave.cluster.members.extend(members);
            }
            table.touch_membership(&keep, now);
            table.refresh(&keep, now);
            report.merges += 1;
        }

        // 5. Lifecycle.
        let config = &self.config;
        for wave in table.waves.values_mut() {
            if wave.cluster.size >= config.min_size {
                wave.qualified_since.get_or_insert(now);
            } else {
                wave.qualified_since = None;
                if wave.cluster.state == WaveState::Stable {
                    wave.cluster.state = WaveState::Forming;
                    wave.state_since = now;
                }
            }

            let quiet_for = now - wave.cluster.last_membership_change_at;
            match wave.cluster.state {
                WaveState::Forming | WaveState::Stable if quiet_for >= config.cooldown_after_secs => {
                    wave.cluster.state = WaveState::Cooldown;
                    wave.state_since = now;
                    report.cooled += 1;
                }
                WaveState::Forming => {
                    if matches!(wave.qualified_since, Some(t) if now - t >= config.stable_after_secs) {
                        wave.cluster.state = WaveState::Stable;
                        wave.state_since = now;
                        report.stabilized += 1;
                    }
                }
                _ => {}
            }
        }

        let expired: Vec<String> = table
            .waves
            .values()
            .filter(|w| w.cluster.state == WaveState::Cooldown && now - w.state_since >= config.expire_after_secs)
            .map(|w| w.cluster.id.clone())
            .collect();
        for id in &expired {
            if let Some(wave) = table.waves.remove(id) {
                for m in &wave.cluster.members {
                    table.member_of.remove(m);
                    table.positions.remove(m);
                }
            }
        }
        report.expired = expired.len();

        if report.splits + report.merges + report.expired > 0 {
            info!(
                "[WaveTracker] Sweep: {} splits, {} merges, {} expired, {} live",
                report.splits,
                report.merges,
                report.expired,
                table.waves.len()
            );
        } else {
            debug!("[WaveTracker] Sweep: {:?}", report);
        }
        report
    }

    /// Active (non-cooling) waves whose catchment touches `bbox`, with at
    /// least `min_size` members, largest first.
    pub fn waves_near(&self, bbox: &Bounds, min_size: usize) -> Vec<SocialCluster> {
        let reaches = |c: &SocialCluster| {
            let catchment = bounds_around(&c.centroid, self.config.join_radius_m);
            bounds_overlap(&catchment, bbox, 0.0, c.centroid.latitude)
        };
        let mut waves: Vec<SocialCluster> = self
            .table
            .read()
            .waves
            .values()
            .map(|w| &w.cluster)
            .filter(|c| c.state != WaveState::Cooldown && c.size >= min_size && reaches(c))
            .cloned()
            .collect();
        waves.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.id.cmp(&b.id)));
        waves
    }

    pub fn wave_of(&self, subject_id: &str) -> Option<SocialCluster> {
        let table = self.table.read();
        let id = table.member_of.get(subject_id)?;
        table.waves.get(id).map(|w| w.cluster.clone())
    }

    pub fn get(&self, id: &str) -> Option<SocialCluster> {
        self.table.read().waves.get(id).map(|w| w.cluster.clone())
    }

    pub fn len(&self) -> usize {
        self.table.read().waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First pair (in id order) where the smaller wave sits mostly inside the
    /// larger one's catchment.
    fn find_merge(&self, table: &WaveTable) -> Option<(String, String)> {
        let waves: Vec<&Wave> = table.waves.values().collect();
        for (i, x) in waves.iter().enumerate() {
            for y in &waves[i + 1..] {
                let (big, small) = if rank(x) >= rank(y) { (x, y) } else { (y, x) };
                if small.cluster.members.is_empty() {
                    continue;
                }
                let inside = small
                    .cluster
                    .members
                    .iter()
                    .filter_map(|m| table.positions.get(m))
                    .filter(|p| haversine_distance(&big.cluster.centroid, p) <= self.config.join_radius_m)
                    .count();
                let overlap = inside as f64 / small.cluster.members.len() as f64;
                if overlap >= self.config.merge_overlap {
                    return Some((big.cluster.id.clone(), small.cluster.id.clone()));
                }
            }
        }
        None
    }
}

/// Bigger first, then older, then lower id.
fn rank(wave: &Wave) -> (usize, std::cmp::Reverse<i64>, std::cmp::Reverse<&str>) {
    (
        wave.cluster.size,
        std::cmp::Reverse(wave.cluster.first_seen_at),
        std::cmp::Reverse(wave.cluster.id.as_str()),
    )
}

/// Connected groups of members where neighbours are within `link_m`,
/// largest first (ties by smallest member id).
fn single_link_components(
    members: &BTreeSet<SubjectId>,
    positions: &HashMap<SubjectId, GpsPoint>,
    link_m: f64,
) -> Vec<BTreeSet<SubjectId>> {
    let located: Vec<(&SubjectId, &GpsPoint)> =
        members.iter().filter_map(|m| positions.get(m).map(|p| (m, p))).collect();

    let mut parent: HashMap<String, String> = located.iter().map(|(m, _)| ((*m).clone(), (*m).clone())).collect();
    for (i, (a, pa)) in located.iter().enumerate() {
        for (b, pb) in &located[i + 1..] {
            if haversine_distance(pa, pb) <= link_m {
                union(&mut parent, a, b);
            }
        }
    }

    let mut groups: BTreeMap<String, BTreeSet<SubjectId>> = BTreeMap::new();
    for (m, _) in &located {
        let root = find(&mut parent, m);
        groups.entry(root).or_default().insert((*m).clone());
    }

    let mut components: Vec<BTreeSet<SubjectId>> = groups.into_values().collect();
    components.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.iter().next().cmp(&b.iter().next())));
    components
}

fn find(parent: &mut HashMap<String, String>, id: &str) -> String {
    let current = parent.get(id).cloned().unwrap_or_else(|| id.to_string());
    if current == id {
        return current;
    }
    let root = find(parent, &current);
    parent.insert(id.to_string(), root.clone());
    root
}

fn union(parent: &mut HashMap<String, String>, a: &str, b: &str) {
    let root_a = find(parent, a);
    let root_b = find(parent, b);
    if root_a != root_b {
        // Keep the smaller id as root so components are stable.
        if root_a < root_b {
            parent.insert(root_b, root_a);
        } else {
            parent.insert(root_a, root_b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::{bounds_around, offset_point};

    fn row(id: &str, location: GpsPoint, ts: i64) -> Presence {
        Presence {
            subject_id: id.into(),
            location,
            accuracy_m: None,
            vibe: None,
            visibility: Visibility::Public,
            venue_id: None,
            updated_at: ts,
            expires_at: ts + 900,
        }
    }

    fn origin() -> GpsPoint {
        GpsPoint::new(-33.8688, 151.2093)
    }

    fn gather(tracker: &WaveTracker, ids: &[&str], ts: i64) -> Vec<Presence> {
        let rows: Vec<Presence> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| row(id, offset_point(&origin(), i as f64 * 5.0, 0.0), ts))
            .collect();
        for r in &rows {
            tracker.observe(r, ts);
        }
        rows
    }

    #[test]
    fn test_nearby_pings_join_one_wave() {
        let tracker = WaveTracker::default();
        gather(&tracker, &["a", "b", "c"], 0);
        assert_eq!(tracker.len(), 1);
        let wave = tracker.wave_of("b").unwrap();
        assert_eq!(wave.size, 3);
        assert_eq!(wave.state, WaveState::Forming);
    }

    #[test]
    fn test_far_ping_seeds_new_wave_and_moving_away_leaves() {
        let tracker = WaveTracker::default();
        gather(&tracker, &["a", "b"], 0);
        let far = offset_point(&origin(), 2_000.0, 0.0);
        tracker.observe(&row("c", far, 0), 0);
        assert_eq!(tracker.len(), 2);

        tracker.observe(&row("b", far, 10), 10);
        assert_eq!(tracker.wave_of("a").unwrap().size, 1);
        assert_eq!(tracker.wave_of("b").unwrap().id, tracker.wave_of("c").unwrap().id);
    }

    #[test]
    fn test_forming_becomes_stable_then_cools_and_expires() {
        let tracker = WaveTracker::default();
        let rows = gather(&tracker, &["a", "b", "c"], 0);
        assert_eq!(tracker.sweep(&rows, 0).stabilized, 0);

        let refreshed: Vec<Presence> = rows.iter().map(|r| Presence { updated_at: 300, expires_at: 1_200, ..r.clone() }).collect();
        assert_eq!(tracker.sweep(&refreshed, 300).stabilized, 1);
        assert_eq!(tracker.wave_of("a").unwrap().state, WaveState::Stable);

        let refreshed: Vec<Presence> = rows.iter().map(|r| Presence { updated_at: 900, expires_at: 1_800, ..r.clone() }).collect();
        assert_eq!(tracker.sweep(&refreshed, 900).cooled, 1);
        assert!(tracker.waves_near(&bounds_around(&origin(), 500.0), 1).is_empty());

        let refreshed: Vec<Presence> = rows.iter().map(|r| Presence { updated_at: 2_700, expires_at: 3_600, ..r.clone() }).collect();
        assert_eq!(tracker.sweep(&refreshed, 2_700).expired, 1);
        assert!(tracker.is_empty());
        assert!(tracker.wave_of("a").is_none());
    }

    #[test]
    fn test_stale_members_dropped() {
        let tracker = WaveTracker::default();
        let rows = gather(&tracker, &["a", "b", "c"], 0);
        let only_a = vec![Presence { updated_at: 400, ..rows[0].clone() }];
        let report = tracker.sweep(&only_a, 400);
        assert_eq!(report.dropped_members, 2);
        assert_eq!(tracker.wave_of("a").unwrap().size, 1);
    }

    #[test]
    fn test_split_when_members_drift_apart() {
        let tracker = WaveTracker::default();
        let mut rows = gather(&tracker, &["a", "b", "c", "d"], 0);
        // c and d walk off together without new pings being assigned.
        rows[2].location = offset_point(&origin(), 1_000.0, 0.0);
        rows[3].location = offset_point(&origin(), 1_005.0, 0.0);

        let report = tracker.sweep(&rows, 10);
        assert_eq!(report.splits, 1);
        assert_eq!(tracker.len(), 2);
        assert_ne!(tracker.wave_of("a").unwrap().id, tracker.wave_of("c").unwrap().id);
        assert_eq!(tracker.wave_of("d").unwrap().size, 2);
    }

    #[test]
    fn test_overlapping_waves_merge() {
        let tracker = WaveTracker::default();
        gather(&tracker, &["a", "b", "c"], 0);
        // Seed a second wave just outside the join radius, then let its
        // member drift next to the first wave between pings.
        let outside = offset_point(&origin(), 0.0, 90.0);
        tracker.observe(&row("z", outside, 0), 0);
        assert_eq!(tracker.len(), 2);

        let mut rows: Vec<Presence> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, id)| row(id, offset_point(&origin(), i as f64 * 5.0, 0.0), 5))
            .collect();
        rows.push(row("z", offset_point(&origin(), 0.0, 20.0), 5));

        let report = tracker.sweep(&rows, 5);
        assert_eq!(report.merges, 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.wave_of("z").unwrap().size, 4);
    }

    #[test]
    fn test_waves_near_filters_by_size_and_box() {
        let tracker = WaveTracker::default();
        gather(&tracker, &["a", "b", "c"], 0);
        tracker.observe(&row("solo", offset_point(&origin(), 0.0, 3_000.0), 0), 0);

        let everywhere = bounds_around(&origin(), 10_000.0);
        assert_eq!(tracker.waves_near(&everywhere, 3).len(), 1);
        assert_eq!(tracker.waves_near(&everywhere, 1).len(), 2);
        assert!(tracker.waves_near(&bounds_around(&offset_point(&origin(), 5_000.0, 0.0), 100.0), 1).is_empty());
    }

    #[test]
    fn test_hidden_subject_leaves() {
        let tracker = WaveTracker::default();
        gather(&tracker, &["a", "b"], 0);
        let mut hidden = row("b", origin(), 10);
        hidden.visibility = Visibility::Hidden;
        assert!(tracker.observe(&hidden, 10).is_none());
        assert_eq!(tracker.wave_of("a").unwrap().size, 1);
        assert!(tracker.wave_of("b").is_none());
    }

    #[test]
    fn test_single_link_components() {
        let o = origin();
        let positions: HashMap<SubjectId, GpsPoint> = [
            ("a", o),
            ("b", offset_point(&o, 100.0, 0.0)),
            ("c", offset_point(&o, 200.0, 0.0)),
            ("x", offset_point(&o, 5_000.0, 0.0)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let members: BTreeSet<SubjectId> = positions.keys().cloned().collect();
        let parts = single_link_components(&members, &positions, 120.0);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
    }
}
