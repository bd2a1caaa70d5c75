//! # Crossed Paths
//!
//! Daily "you crossed paths with" facts materialized from the proximity log.
//! One row per (pair, UTC day, shared venue); re-running over the same
//! events changes nothing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Timelike};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::proximity::{PairKey, ProximityEvent, ProximityEventKind};

/// UTC calendar day of a Unix timestamp.
pub fn day_of(timestamp: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}

/// UTC hour of day (0-23) of a Unix timestamp.
pub fn hour_of(timestamp: i64) -> Option<u32> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.hour())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossedPath {
    pub pair: PairKey,
    pub day: NaiveDate,
    pub venue_id: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub closest_distance_m: f64,
    pub sightings: u32,
}

type RowKey = (PairKey, NaiveDate, Option<String>);

#[derive(Debug, Clone)]
struct Row {
    path: CrossedPath,
    seen_at: BTreeSet<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub created: usize,
    pub updated: usize,
}

#[derive(Debug, Default)]
pub struct CrossedPathLedger {
    rows: RwLock<BTreeMap<RowKey, Row>>,
}

impl CrossedPathLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold Enter and Sustain events into the ledger. Events already folded
    /// in are skipped.
    pub fn materialize(&self, events: &[ProximityEvent]) -> MaterializeReport {
        let mut report = MaterializeReport::default();
        let mut rows = self.rows.write();

        for event in events {
            if !matches!(event.kind, ProximityEventKind::Enter | ProximityEventKind::Sustain) {
                continue;
            }
            let Some(day) = day_of(event.timestamp) else {
                warn!("[CrossedPaths] Skipping event with unrepresentable timestamp {}", event.timestamp);
                continue;
            };

            let key = (event.pair.clone(), day, event.venue_id.clone());
            match rows.get_mut(&key) {
                Some(row) => {
                    if row.seen_at.insert(event.timestamp) {
                        let path = &mut row.path;
                        path.first_seen_at = path.first_seen_at.min(event.timestamp);
                        path.last_seen_at = path.last_seen_at.max(event.timestamp);
                        path.closest_distance_m = path.closest_distance_m.min(event.distance_m);
                        path.sightings = row.seen_at.len() as u32;
                        report.updated += 1;
                    }
                }
                None => {
                    let path = CrossedPath {
                        pair: event.pair.clone(),
                        day,
                        venue_id: event.venue_id.clone(),
                        first_seen_at: event.timestamp,
                        last_seen_at: event.timestamp,
                        closest_distance_m: event.distance_m,
                        sightings: 1,
                    };
                    rows.insert(key, Row { path, seen_at: BTreeSet::from([event.timestamp]) });
                    report.created += 1;
                }
            }
        }

        debug!("[CrossedPaths] Materialized: {} new, {} updated", report.created, report.updated);
        report
    }

    /// Everyone `subject_id` crossed paths with on `day`, earliest first.
    pub fn crossed_paths_on(&self, subject_id: &str, day: NaiveDate) -> Vec<CrossedPath> {
        let mut paths: Vec<CrossedPath> = self
            .rows
            .read()
            .values()
            .filter(|r| r.path.day == day && r.path.pair.contains(subject_id))
            .map(|r| r.path.clone())
            .collect();
        paths.sort_by(|a, b| a.first_seen_at.cmp(&b.first_seen_at).then_with(|| a.pair.cmp(&b.pair)));
        paths
    }

    /// Drop rows for days before `day`.
    pub fn prune_before(&self, day: NaiveDate) -> usize {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|(_, d, _), _| *d >= day);
        before - rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
