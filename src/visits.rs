//! Venue visit ledger.
//!
//! Presence rows that carry a venue id count as a visit. Visits are
//! deduplicated per subject, venue and clock hour, so a subject sitting in
//! a cafe all afternoon counts once per hour rather than once per ping.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crossed::hour_of;
use crate::presence::{FriendGraph, Presence};
use crate::SubjectId;

/// Aggregated visit facts for one venue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VenueVisitStats {
    pub total_visits: u32,
    /// Visits per UTC hour of day.
    pub hourly: [u32; 24],
    /// Vibes the visitors were broadcasting.
    pub vibes: BTreeMap<String, u32>,
    pub visitors: BTreeSet<SubjectId>,
    /// Visit timestamps, oldest first.
    pub visit_times: Vec<i64>,
}

#[derive(Debug, Clone)]
struct Visit {
    subject_id: SubjectId,
    timestamp: i64,
    hour: u32,
    vibe: Option<String>,
}

#[derive(Debug, Default)]
struct VisitTable {
    /// Visits per venue, oldest first.
    by_venue: HashMap<String, Vec<Visit>>,
    seen: HashSet<(SubjectId, String, i64)>,
}

fn summarize(visits: &[Visit]) -> VenueVisitStats {
    let mut stats = VenueVisitStats::default();
    for visit in visits {
        stats.total_visits += 1;
        stats.hourly[visit.hour as usize] += 1;
        if let Some(vibe) = &visit.vibe {
            *stats.vibes.entry(vibe.clone()).or_insert(0) += 1;
        }
        stats.visitors.insert(visit.subject_id.clone());
        stats.visit_times.push(visit.timestamp);
    }
    stats
}

#[derive(Debug, Default)]
pub struct VisitLedger {
    table: RwLock<VisitTable>,
}

impl VisitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit. Returns false when the same subject was already
    /// counted at this venue in this clock hour.
    pub fn record(&self, subject_id: &str, venue_id: &str, timestamp: i64, vibe: Option<&str>) -> bool {
        let Some(hour) = hour_of(timestamp) else {
            return false;
        };
        let bucket = timestamp.div_euclid(3600);

        let mut table = self.table.write();
        if !table.seen.insert((subject_id.to_string(), venue_id.to_string(), bucket)) {
            return false;
        }

        let visits = table.by_venue.entry(venue_id.to_string()).or_default();
        let at = visits.partition_point(|v| v.timestamp <= timestamp);
        visits.insert(
            at,
            Visit { subject_id: subject_id.to_string(), timestamp, hour, vibe: vibe.map(str::to_string) },
        );

        debug!("[VisitLedger] {} visited {} at hour {}", subject_id, venue_id, hour);
        true
    }

    /// Record the visit implied by a presence row, if it names a venue.
    pub fn record_presence(&self, presence: &Presence) -> bool {
        match &presence.venue_id {
            Some(venue_id) => self.record(&presence.subject_id, venue_id, presence.updated_at, presence.vibe.as_deref()),
            None => false,
        }
    }

    pub fn stats(&self, venue_id: &str) -> Option<VenueVisitStats> {
        self.table.read().by_venue.get(venue_id).map(|visits| summarize(visits))
    }

    /// Distinct friends of `subject_id` who have visited `venue_id`.
    pub fn friends_who_visited(&self, venue_id: &str, subject_id: &str, friends: &dyn FriendGraph) -> usize {
        let table = self.table.read();
        let Some(visits) = table.by_venue.get(venue_id) else {
            return 0;
        };
        let visitors: HashSet<&str> = visits.iter().map(|v| v.subject_id.as_str()).collect();
        visitors.into_iter().filter(|v| *v != subject_id && friends.is_friend(subject_id, v)).count()
    }

    /// Forget visits older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: i64) -> usize {
        let mut table = self.table.write();
        let mut removed = 0;
        table.by_venue.retain(|_, visits| {
            let keep_from = visits.partition_point(|v| v.timestamp < cutoff);
            *visits = visits.split_off(keep_from);
            removed += keep_from;
            !visits.is_empty()
        });
        let cutoff_bucket = cutoff.div_euclid(3600);
        table.seen.retain(|(_, _, bucket)| *bucket >= cutoff_bucket);

        if removed > 0 {
            debug!("[VisitLedger] Pruned {} visits before {}", removed, cutoff);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.table.read().by_venue.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::StaticFriendGraph;

    // 2024-03-15T18:00:00Z
    const EVENING: i64 = 1_710_525_600;

    #[test]
    fn test_dedup_per_hour() {
        let ledger = VisitLedger::new();
        assert!(ledger.record("alice", "cafe", EVENING, Some("chill")));
        assert!(!ledger.record("alice", "cafe", EVENING + 600, Some("chill")));
        assert!(ledger.record("alice", "cafe", EVENING + 3_600, None));
        assert!(ledger.record("bob", "cafe", EVENING + 600, Some("party")));

        let stats = ledger.stats("cafe").unwrap();
        assert_eq!(stats.total_visits, 3);
        assert_eq!(stats.hourly[18], 2);
        assert_eq!(stats.hourly[19], 1);
        assert_eq!(stats.vibes.get("chill"), Some(&1));
        assert_eq!(stats.visitors.len(), 2);
        assert_eq!(stats.visit_times, vec![EVENING, EVENING + 600, EVENING + 3_600]);
    }

    #[test]
    fn test_friends_who_visited() {
        let ledger = VisitLedger::new();
        let graph = StaticFriendGraph::new();
        graph.befriend("alice", "bob");
        ledger.record("bob", "cafe", EVENING, None);
        ledger.record("carol", "cafe", EVENING, None);
        ledger.record("alice", "cafe", EVENING, None);
        assert_eq!(ledger.friends_who_visited("cafe", "alice", &graph), 1);
        assert_eq!(ledger.friends_who_visited("bar", "alice", &graph), 0);
    }

    #[test]
    fn test_prune_before_drops_old_visits() {
        let ledger = VisitLedger::new();
        ledger.record("alice", "cafe", EVENING, Some("chill"));
        ledger.record("bob", "cafe", EVENING + 7_200, Some("party"));
        ledger.record("carol", "bar", EVENING, None);

        assert_eq!(ledger.prune_before(EVENING + 3_600), 2);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.stats("bar").is_none());

        let stats = ledger.stats("cafe").unwrap();
        assert_eq!(stats.total_visits, 1);
        assert_eq!(stats.hourly[18], 0);
        assert_eq!(stats.vibes.get("chill"), None);
        assert_eq!(stats.visitors.len(), 1);
        assert_eq!(stats.visit_times, vec![EVENING + 7_200]);

        // The hour bucket is forgotten too, so a late replay counts again.
        assert!(ledger.record("alice", "cafe", EVENING, None));
        assert_eq!(ledger.prune_before(EVENING + 3_600), 1);
    }
}
