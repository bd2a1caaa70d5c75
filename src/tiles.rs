//! # Tile and Cluster Builder
//!
//! Aggregates live presence into hex tiles at each maintained resolution.
//!
//! A build runs in five steps:
//! 1. Pick the cells in scope (everything, a bounding box, or the cells the
//!    presence store marked dirty)
//! 2. Group every live row belonging to those cells by hex key
//! 3. Summarise each group: centroid, member count, vibe histogram
//! 4. Upsert one tile per non-empty cell
//! 5. Prune previously published cells in scope that are now empty
//!
//! Cells are always recomputed from the full snapshot, so a partial scope
//! never publishes a partial count. Output is a pure function of the
//! snapshot: members are summed in subject-id order, histograms are ordered
//! maps and `updated_at` is the newest member timestamp.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geo_utils::compute_center;
use crate::presence::{DirtySet, Presence, Visibility};
use crate::spatial::{hex_center, hex_key, MAX_HEX_RESOLUTION};
use crate::{Bounds, GpsPoint};

/// Builder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Hex resolutions kept up to date (default: 10, 12, 14, roughly
    /// 980 m, 245 m and 60 m edges).
    pub resolutions: Vec<u8>,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self { resolutions: vec![10, 12, 14] }
    }
}

impl TileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resolutions.is_empty() {
            return Err(Error::Config("tiles.resolutions must not be empty".into()));
        }
        if let Some(bad) = self.resolutions.iter().find(|r| **r > MAX_HEX_RESOLUTION) {
            return Err(Error::Config(format!(
                "tile resolution {} exceeds maximum {}",
                bad, MAX_HEX_RESOLUTION
            )));
        }
        Ok(())
    }
}

/// One published, non-empty cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialTile {
    pub tile_id: String,
    pub cell_key: String,
    pub resolution: u8,
    pub centroid: GpsPoint,
    pub member_count: u32,
    pub vibe_histogram: BTreeMap<String, u32>,
    pub updated_at: i64,
}

/// The dominant vibe of a cell, for map overlays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibeCluster {
    pub cell_key: String,
    pub resolution: u8,
    pub dominant_vibe: Option<String>,
    pub histogram: BTreeMap<String, u32>,
    pub total_members: u32,
    pub centroid: GpsPoint,
}

impl From<&SpatialTile> for VibeCluster {
    fn from(tile: &SpatialTile) -> Self {
        Self {
            cell_key: tile.cell_key.clone(),
            resolution: tile.resolution,
            dominant_vibe: dominant_vibe(&tile.vibe_histogram),
            histogram: tile.vibe_histogram.clone(),
            total_members: tile.member_count,
            centroid: tile.centroid,
        }
    }
}

/// Which cells a build refreshes.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildScope {
    Global,
    BoundingBox(Bounds),
    /// Cells containing points drained from the presence store.
    Cells(DirtySet),
}

/// Deadline and cancellation for a batch job.
///
/// Jobs check the budget between units of work; everything applied before
/// the budget ran out stays applied.
#[derive(Debug, Clone, Default)]
pub struct BuildBudget {
    pub deadline: Option<Instant>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl BuildBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn is_exhausted(&self) -> bool {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return true;
            }
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }
}

/// Summary of one build run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    /// False when the budget ran out before every cell was processed.
    pub completed: bool,
    pub cells_upserted: usize,
    pub cells_pruned: usize,
    pub rows_considered: usize,
}

#[derive(Debug, Clone)]
struct PublishedTile {
    tile: SpatialTile,
    built_at: i64,
}

/// Builds and holds the published tiles.
#[derive(Debug, Default)]
pub struct TileBuilder {
    config: TileConfig,
    published: RwLock<BTreeMap<String, PublishedTile>>,
}

impl TileBuilder {
    pub fn new(config: TileConfig) -> Self {
        Self { config, published: RwLock::new(BTreeMap::new()) }
    }

    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    pub fn is_maintained(&self, resolution: u8) -> bool {
        self.config.resolutions.contains(&resolution)
    }

    /// Refresh tiles for `scope` from `snapshot`.
    ///
    /// Tile writes are last-write-wins on `now`, so an older build finishing
    /// late cannot overwrite a newer one.
    pub fn build(&self, snapshot: &[Presence], scope: &BuildScope, budget: &BuildBudget, now: i64) -> Result<BuildReport> {
        let start = Instant::now();
        let rows: Vec<&Presence> = snapshot.iter().filter(|p| is_countable(p, now)).collect();

        // An overflowed dirty set lost points; only a full build is safe.
        let global = BuildScope::Global;
        let scope = match scope {
            BuildScope::Cells(dirty) if dirty.overflowed => &global,
            other => other,
        };

        let mut report = BuildReport { completed: true, rows_considered: rows.len(), ..Default::default() };

        for &resolution in &self.config.resolutions {
            if budget.is_exhausted() {
                report.completed = false;
                break;
            }

            let mut groups: HashMap<String, Vec<&Presence>> = HashMap::new();
            for &row in &rows {
                let key = hex_key(row.location.latitude, row.location.longitude, resolution)?;
                groups.entry(key).or_default().push(row);
            }

            let targets = self.target_cells(scope, resolution, &groups)?;
            let summaries = summarize_cells(&targets, &groups, resolution);

            for (key, tile) in summaries {
                if budget.is_exhausted() {
                    report.completed = false;
                    break;
                }
                match tile {
                    Some(tile) => {
                        if self.publish(tile, now) {
                            report.cells_upserted += 1;
                        }
                    }
                    None => {
                        if self.unpublish(&key, now) {
                            report.cells_pruned += 1;
                        }
                    }
                }
            }

            if !report.completed {
                break;
            }
        }

        if report.completed {
            info!(
                "[TileBuilder] Built {} tiles, pruned {} from {} rows in {:?}",
                report.cells_upserted,
                report.cells_pruned,
                report.rows_considered,
                start.elapsed()
            );
        } else {
            info!(
                "[TileBuilder] Build cut short after {} upserts, {} prunes",
                report.cells_upserted, report.cells_pruned
            );
        }
        Ok(report)
    }

    /// Published tiles at `resolution`, optionally limited to a box, ordered by key.
    pub fn tiles(&self, resolution: u8, bbox: Option<&Bounds>) -> Vec<SpatialTile> {
        self.published
            .read()
            .values()
            .filter(|p| p.tile.resolution == resolution)
            .filter(|p| bbox.map_or(true, |b| b.contains(&p.tile.centroid)))
            .map(|p| p.tile.clone())
            .collect()
    }

    /// The published tile for a cell key.
    pub fn tile(&self, cell_key: &str) -> Option<SpatialTile> {
        self.published.read().get(cell_key).map(|p| p.tile.clone())
    }

    /// Published tiles at `resolution` as JSON.
    pub fn tiles_json(&self, resolution: u8) -> Result<String> {
        Ok(serde_json::to_string(&self.tiles(resolution, None))?)
    }

    /// Vibe clusters in `bbox`, largest first.
    ///
    /// Maintained resolutions read the published tiles; any other resolution
    /// is projected from `snapshot` on the fly.
    pub fn vibe_clusters(&self, bbox: &Bounds, resolution: u8, snapshot: &[Presence], now: i64) -> Result<Vec<VibeCluster>> {
        let mut clusters: Vec<VibeCluster> = if self.is_maintained(resolution) {
            self.tiles(resolution, Some(bbox)).iter().map(VibeCluster::from).collect()
        } else {
            debug!("[TileBuilder] Projecting clusters at unmaintained resolution {}", resolution);
            project_clusters(snapshot, bbox, resolution, now)?
        };
        clusters.sort_by(|a, b| b.total_members.cmp(&a.total_members).then_with(|| a.cell_key.cmp(&b.cell_key)));
        Ok(clusters)
    }

    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, tile: SpatialTile, built_at: i64) -> bool {
        let mut published = self.published.write();
        if let Some(existing) = published.get(&tile.cell_key) {
            if existing.built_at > built_at {
                return false;
            }
        }
        published.insert(tile.cell_key.clone(), PublishedTile { tile, built_at });
        true
    }

    fn unpublish(&self, cell_key: &str, built_at: i64) -> bool {
        let mut published = self.published.write();
        match published.get(cell_key) {
            Some(existing) if existing.built_at <= built_at => published.remove(cell_key).is_some(),
            _ => false,
        }
    }

    fn published_keys(&self, resolution: u8, filter: impl Fn(&SpatialTile) -> bool) -> BTreeSet<String> {
        self.published
            .read()
            .values()
            .filter(|p| p.tile.resolution == resolution && filter(&p.tile))
            .map(|p| p.tile.cell_key.clone())
            .collect()
    }

    fn target_cells(
        &self,
        scope: &BuildScope,
        resolution: u8,
        groups: &HashMap<String, Vec<&Presence>>,
    ) -> Result<BTreeSet<String>> {
        let targets = match scope {
            BuildScope::Global => {
                let mut keys = self.published_keys(resolution, |_| true);
                keys.extend(groups.keys().cloned());
                keys
            }
            BuildScope::BoundingBox(bbox) => {
                let mut keys = self.published_keys(resolution, |t| bbox.contains(&hex_center(&t.cell_key).unwrap_or(t.centroid)));
                for (key, members) in groups {
                    if members.iter().any(|p| bbox.contains(&p.location)) {
                        keys.insert(key.clone());
                    }
                }
                keys
            }
            BuildScope::Cells(dirty) => {
                let mut keys = BTreeSet::new();
                for point in &dirty.points {
                    keys.insert(hex_key(point.latitude, point.longitude, resolution)?);
                }
                keys
            }
        };
        Ok(targets)
    }
}

fn is_countable(presence: &Presence, now: i64) -> bool {
    !presence.is_expired(now) && presence.visibility != Visibility::Hidden
}

#[cfg(feature = "parallel")]
fn summarize_cells(
    targets: &BTreeSet<String>,
    groups: &HashMap<String, Vec<&Presence>>,
    resolution: u8,
) -> Vec<(String, Option<SpatialTile>)> {
    use rayon::prelude::*;

    let keys: Vec<&String> = targets.iter().collect();
    keys.par_iter()
        .map(|key| {
            let tile = groups.get(*key).and_then(|members| summarize(key, resolution, members));
            ((*key).clone(), tile)
        })
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn summarize_cells(
    targets: &BTreeSet<String>,
    groups: &HashMap<String, Vec<&Presence>>,
    resolution: u8,
) -> Vec<(String, Option<SpatialTile>)> {
    targets
        .iter()
        .map(|key| {
            let tile = groups.get(key).and_then(|members| summarize(key, resolution, members));
            (key.clone(), tile)
        })
        .collect()
}

fn summarize(cell_key: &str, resolution: u8, members: &[&Presence]) -> Option<SpatialTile> {
    let mut ordered: Vec<&Presence> = members.to_vec();
    ordered.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));

    let centroid = compute_center(ordered.iter().map(|p| &p.location))?;
    let mut vibe_histogram = BTreeMap::new();
    for p in &ordered {
        if let Some(vibe) = &p.vibe {
            *vibe_histogram.entry(vibe.clone()).or_insert(0u32) += 1;
        }
    }
    let updated_at = ordered.iter().map(|p| p.updated_at).max()?;

    Some(SpatialTile {
        tile_id: tile_id(cell_key),
        cell_key: cell_key.to_string(),
        resolution,
        centroid,
        member_count: ordered.len() as u32,
        vibe_histogram,
        updated_at,
    })
}

fn tile_id(cell_key: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, cell_key.as_bytes()).to_string()
}

/// Most common vibe; ties go to the alphabetically first.
fn dominant_vibe(histogram: &BTreeMap<String, u32>) -> Option<String> {
    let mut best: Option<(&String, u32)> = None;
    for (vibe, &count) in histogram {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((vibe, count));
        }
    }
    best.map(|(v, _)| v.clone())
}

/// Group live rows inside `bbox` by hex cell without publishing anything.
pub fn project_clusters(snapshot: &[Presence], bbox: &Bounds, resolution: u8, now: i64) -> Result<Vec<VibeCluster>> {
    let mut groups: HashMap<String, Vec<&Presence>> = HashMap::new();
    for row in snapshot.iter().filter(|p| is_countable(p, now) && bbox.contains(&p.location)) {
        let key = hex_key(row.location.latitude, row.location.longitude, resolution)?;
        groups.entry(key).or_default().push(row);
    }

    let mut clusters: Vec<VibeCluster> = groups
        .iter()
        .filter_map(|(key, members)| summarize(key, resolution, members))
        .map(|tile| VibeCluster::from(&tile))
        .collect();
    clusters.sort_by(|a, b| a.cell_key.cmp(&b.cell_key));
    Ok(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_point;
    use crate::spatial::hex_cell;

    fn row(id: &str, location: GpsPoint, vibe: Option<&str>, ts: i64) -> Presence {
        Presence {
            subject_id: id.into(),
            location,
            accuracy_m: None,
            vibe: vibe.map(String::from),
            visibility: Visibility::Public,
            venue_id: None,
            updated_at: ts,
            expires_at: ts + 900,
        }
    }

    fn origin() -> GpsPoint {
        GpsPoint::new(52.3676, 4.9041)
    }

    fn crowd() -> Vec<Presence> {
        let o = origin();
        vec![
            row("a", o, Some("party"), 100),
            row("b", offset_point(&o, 3.0, 2.0), Some("party"), 120),
            row("c", offset_point(&o, -2.0, 1.0), Some("chill"), 110),
            row("d", offset_point(&o, 5_000.0, 0.0), Some("study"), 90),
            row("e", offset_point(&o, 5_001.0, 0.0), None, 95),
        ]
    }

    fn single_res_builder() -> TileBuilder {
        TileBuilder::new(TileConfig { resolutions: vec![12] })
    }

    #[test]
    fn test_build_groups_and_summarises() {
        let builder = single_res_builder();
        let report = builder.build(&crowd(), &BuildScope::Global, &BuildBudget::unlimited(), 200).unwrap();
        assert!(report.completed);

        let key = hex_key(origin().latitude, origin().longitude, 12).unwrap();
        let tile = builder.tile(&key).unwrap();
        assert_eq!(tile.member_count, 3);
        assert_eq!(tile.vibe_histogram.get("party"), Some(&2));
        assert_eq!(tile.vibe_histogram.get("chill"), Some(&1));
        assert_eq!(tile.updated_at, 120);
        assert_eq!(builder.tiles(12, None).iter().map(|t| t.member_count).sum::<u32>(), 5);
    }

    #[test]
    fn test_build_is_byte_identical() {
        let builder = single_res_builder();
        let mut snapshot = crowd();
        builder.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 200).unwrap();
        let first = builder.tiles_json(12).unwrap();

        snapshot.reverse();
        builder.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 200).unwrap();
        assert_eq!(first, builder.tiles_json(12).unwrap());

        let fresh = single_res_builder();
        fresh.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 300).unwrap();
        assert_eq!(first, fresh.tiles_json(12).unwrap());
    }

    #[test]
    fn test_empty_cells_pruned() {
        let builder = single_res_builder();
        let mut snapshot = crowd();
        builder.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 200).unwrap();
        let before = builder.len();

        snapshot.retain(|p| p.subject_id != "d" && p.subject_id != "e");
        let report = builder.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 201).unwrap();
        assert!(report.cells_pruned >= 1);
        assert!(builder.len() < before);
        assert!(builder.tiles(12, None).iter().all(|t| t.member_count > 0));
    }

    #[test]
    fn test_expired_and_hidden_rows_not_counted() {
        let builder = single_res_builder();
        let mut snapshot = crowd();
        snapshot[0].expires_at = 150;
        snapshot[1].visibility = Visibility::Hidden;
        builder.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 200).unwrap();

        let key = hex_key(origin().latitude, origin().longitude, 12).unwrap();
        assert_eq!(builder.tile(&key).unwrap().member_count, 1);
    }

    #[test]
    fn test_dirty_scope_only_touches_dirty_cells() {
        let builder = single_res_builder();
        let mut snapshot = crowd();
        builder.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 200).unwrap();

        // Two far-away moves; only one is reported dirty.
        snapshot[0].location = offset_point(&origin(), -5_000.0, 0.0);
        let moved_to = snapshot[0].location;
        snapshot[3].vibe = Some("party".into());

        let dirty = DirtySet { points: vec![origin(), moved_to], overflowed: false };
        let report = builder.build(&snapshot, &BuildScope::Cells(dirty), &BuildBudget::unlimited(), 300).unwrap();
        assert_eq!(report.cells_upserted, 2);

        let far_key = hex_key(snapshot[3].location.latitude, snapshot[3].location.longitude, 12).unwrap();
        assert_eq!(builder.tile(&far_key).unwrap().vibe_histogram.get("party"), None);
    }

    #[test]
    fn test_bounding_box_scope_recomputes_whole_cells() {
        let builder = single_res_builder();
        let snapshot = crowd();
        let bbox = Bounds::from_points(&[offset_point(&origin(), -10.0, -10.0), offset_point(&origin(), 10.0, 10.0)]).unwrap();
        builder.build(&snapshot, &BuildScope::BoundingBox(bbox), &BuildBudget::unlimited(), 200).unwrap();
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_cancelled_build_reports_incomplete() {
        let builder = single_res_builder();
        let flag = Arc::new(AtomicBool::new(true));
        let budget = BuildBudget::unlimited().with_cancel(flag.clone());
        let report = builder.build(&crowd(), &BuildScope::Global, &budget, 200).unwrap();
        assert!(!report.completed);
        assert!(builder.is_empty());

        flag.store(false, Ordering::Relaxed);
        assert!(builder.build(&crowd(), &BuildScope::Global, &budget, 200).unwrap().completed);
    }

    #[test]
    fn test_stale_build_does_not_overwrite() {
        let builder = single_res_builder();
        builder.build(&crowd(), &BuildScope::Global, &BuildBudget::unlimited(), 500).unwrap();
        let report = builder.build(&crowd()[..1], &BuildScope::Global, &BuildBudget::unlimited(), 400).unwrap();
        assert_eq!(report.cells_upserted, 0);
        let key = hex_key(origin().latitude, origin().longitude, 12).unwrap();
        assert_eq!(builder.tile(&key).unwrap().member_count, 3);
    }

    #[test]
    fn test_vibe_clusters_published_and_projected() {
        let builder = single_res_builder();
        let snapshot = crowd();
        builder.build(&snapshot, &BuildScope::Global, &BuildBudget::unlimited(), 200).unwrap();
        let bbox = Bounds::from_points(&[offset_point(&origin(), -100.0, -100.0), offset_point(&origin(), 100.0, 100.0)]).unwrap();

        let published = builder.vibe_clusters(&bbox, 12, &snapshot, 200).unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].dominant_vibe.as_deref(), Some("party"));

        let projected = builder.vibe_clusters(&bbox, 8, &snapshot, 200).unwrap();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].total_members, 3);
        assert_eq!(projected[0].cell_key, hex_cell(origin().latitude, origin().longitude, 8).unwrap().key());
    }

    #[test]
    fn test_dominant_vibe_tie_breaks_alphabetically() {
        let histogram = BTreeMap::from([("party".to_string(), 2), ("chill".to_string(), 2)]);
        assert_eq!(dominant_vibe(&histogram).as_deref(), Some("chill"));
        assert_eq!(dominant_vibe(&BTreeMap::new()), None);
    }

    #[test]
    fn test_config_validation() {
        assert!(TileConfig::default().validate().is_ok());
        assert!(TileConfig { resolutions: vec![] }.validate().is_err());
        assert!(TileConfig { resolutions: vec![25] }.validate().is_err());
    }
}
