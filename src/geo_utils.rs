//! # Geographic Utilities
//!
//! Distance, bounding-box and centroid helpers shared by the presence store,
//! tile builder, proximity detector and venue resolver.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two points |
//! | [`validate_point`] | Reject out-of-range or non-finite coordinates |
//! | [`bounds_around`] | Square search box enclosing a radius |
//! | [`compute_center`] | Arithmetic centroid of a set of points |
//! | [`offset_point`] | Move a point by metres north/east |
//! | [`meters_to_degrees`] | Convert metres to approximate degrees at a latitude |
//! | [`build_rtree`] / [`points_within`] | R-tree radius search over a point slice |
//!
//! ## Example
//!
//! ```rust
//! use presence_engine::{GpsPoint, geo_utils};
//!
//! let cafe = GpsPoint::new(51.5074, -0.1278);
//! let bar = geo_utils::offset_point(&cafe, 20.0, 0.0);
//!
//! let dist = geo_utils::haversine_distance(&cafe, &bar);
//! assert!((dist - 20.0).abs() < 0.5);
//!
//! let search = geo_utils::bounds_around(&cafe, 100.0);
//! assert!(search.contains(&bar));
//! ```
//!
//! All functions expect WGS84 latitude/longitude in degrees.

use geo::{Distance, Haversine, Point};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::error::{Error, Result};
use crate::{Bounds, GpsPoint};

/// Mean metres per degree of latitude.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance in metres between two points.
///
/// ```rust
/// use presence_engine::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Convert metres to approximate degrees of longitude at a given latitude.
///
/// Uses the longitude scale, which is the larger of the two, so boxes built
/// from it always enclose the requested radius. The cosine is floored at 0.1
/// to keep boxes finite near the poles.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = METERS_PER_DEGREE * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

// =============================================================================
// Validation
// =============================================================================

/// Build a point from raw coordinates, rejecting anything out of range.
pub fn validate_point(lat: f64, lng: f64) -> Result<GpsPoint> {
    let point = GpsPoint::new(lat, lng);
    if point.is_valid() {
        Ok(point)
    } else {
        Err(Error::InvalidCoordinates { lat, lng })
    }
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Square bounding box enclosing a circle of `radius_m` around `center`.
///
/// Latitude is clamped to the valid range; longitude is not wrapped, so
/// boxes near the antimeridian extend past ±180 and callers comparing
/// against them still get a superset.
pub fn bounds_around(center: &GpsPoint, radius_m: f64) -> Bounds {
    let dlat = radius_m / METERS_PER_DEGREE;
    let dlng = meters_to_degrees(radius_m, center.latitude);
    Bounds {
        min_lat: (center.latitude - dlat).max(-90.0),
        max_lat: (center.latitude + dlat).min(90.0),
        min_lng: center.longitude - dlng,
        max_lng: center.longitude + dlng,
    }
}

/// Check if two bounding boxes overlap, with a buffer in metres.
pub fn bounds_overlap(a: &Bounds, b: &Bounds, buffer_meters: f64, reference_lat: f64) -> bool {
    let buffer_deg = meters_to_degrees(buffer_meters, reference_lat);

    !(a.max_lat + buffer_deg < b.min_lat
        || b.max_lat + buffer_deg < a.min_lat
        || a.max_lng + buffer_deg < b.min_lng
        || b.max_lng + buffer_deg < a.min_lng)
}

// =============================================================================
// Center/Centroid Functions
// =============================================================================

/// Arithmetic mean of the given points. Returns `None` for empty input.
///
/// Suitable for the small areas covered by a tile or a wave; callers that
/// need bit-identical output must pass points in a stable order.
pub fn compute_center<'a, I>(points: I) -> Option<GpsPoint>
where
    I: IntoIterator<Item = &'a GpsPoint>,
{
    let mut sum_lat = 0.0;
    let mut sum_lng = 0.0;
    let mut n = 0usize;
    for p in points {
        sum_lat += p.latitude;
        sum_lng += p.longitude;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    Some(GpsPoint::new(sum_lat / n as f64, sum_lng / n as f64))
}

/// Move `origin` by `north_m` metres north and `east_m` metres east.
///
/// Flat-earth approximation, accurate for the sub-kilometre offsets used by
/// search boxes and fixtures.
pub fn offset_point(origin: &GpsPoint, north_m: f64, east_m: f64) -> GpsPoint {
    let dlat = north_m / METERS_PER_DEGREE;
    let lng_scale = METERS_PER_DEGREE * origin.latitude.to_radians().cos();
    let dlng = if lng_scale.abs() < f64::EPSILON { 0.0 } else { east_m / lng_scale };
    GpsPoint::new(origin.latitude + dlat, origin.longitude + dlng)
}

// =============================================================================
// Spatial Index
// =============================================================================

/// A point tagged with its position in a caller-owned slice.
#[derive(Debug, Clone, Copy)]
pub struct IndexedPoint {
    pub idx: usize,
    pub lat: f64,
    pub lng: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.lat - point[0];
        let dlng = self.lng - point[1];
        dlat * dlat + dlng * dlng
    }
}

/// Bulk-load an R-tree over `points`; entries carry their slice index.
pub fn build_rtree<'a, I>(points: I) -> RTree<IndexedPoint>
where
    I: IntoIterator<Item = &'a GpsPoint>,
{
    let indexed: Vec<IndexedPoint> = points
        .into_iter()
        .enumerate()
        .map(|(idx, p)| IndexedPoint { idx, lat: p.latitude, lng: p.longitude })
        .collect();
    RTree::bulk_load(indexed)
}

/// Slice indices within `radius_m` of `center`, with their distances.
///
/// The R-tree narrows by bounding box; the result is then filtered by exact
/// haversine distance. Order is unspecified.
pub fn points_within(tree: &RTree<IndexedPoint>, points: &[GpsPoint], center: &GpsPoint, radius_m: f64) -> Vec<(usize, f64)> {
    let b = bounds_around(center, radius_m);
    let envelope = AABB::from_corners([b.min_lat, b.min_lng], [b.max_lat, b.max_lng]);
    tree.locate_in_envelope(&envelope)
        .filter_map(|ip| {
            let d = haversine_distance(center, points.get(ip.idx)?);
            (d <= radius_m).then_some((ip.idx, d))
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_distance_same_point() {
        let p = GpsPoint::new(51.5074, -0.1278);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_distance_known_value() {
        let london = GpsPoint::new(51.5074, -0.1278);
        let paris = GpsPoint::new(48.8566, 2.3522);
        assert!(approx_eq(haversine_distance(&london, &paris), 343_560.0, 5000.0));
    }

    #[test]
    fn test_validate_point() {
        assert!(validate_point(40.0, -73.0).is_ok());
        assert!(matches!(
            validate_point(91.0, 0.0),
            Err(Error::InvalidCoordinates { .. })
        ));
        assert!(validate_point(0.0, f64::NAN).is_err());
    }

    #[test]
    fn test_bounds_around_contains_radius() {
        let center = GpsPoint::new(40.7128, -74.0060);
        let bounds = bounds_around(&center, 500.0);
        assert!(bounds.contains(&offset_point(&center, 450.0, 0.0)));
        assert!(bounds.contains(&offset_point(&center, 0.0, -450.0)));
        assert!(!bounds.contains(&offset_point(&center, 800.0, 0.0)));
    }

    #[test]
    fn test_offset_point_distance() {
        let origin = GpsPoint::new(37.7749, -122.4194);
        let moved = offset_point(&origin, 30.0, 40.0);
        assert!(approx_eq(haversine_distance(&origin, &moved), 50.0, 0.5));
    }

    #[test]
    fn test_compute_center() {
        let pts = [GpsPoint::new(51.50, -0.10), GpsPoint::new(51.52, -0.12)];
        let center = compute_center(&pts).unwrap();
        assert!(approx_eq(center.latitude, 51.51, 0.001));
        assert!(approx_eq(center.longitude, -0.11, 0.001));
        assert!(compute_center(&[]).is_none());
    }

    #[test]
    fn test_bounds_overlap_with_buffer() {
        let a = Bounds { min_lat: 51.50, max_lat: 51.51, min_lng: -0.13, max_lng: -0.12 };
        let b = Bounds { min_lat: 51.52, max_lat: 51.53, min_lng: -0.11, max_lng: -0.10 };
        assert!(!bounds_overlap(&a, &b, 0.0, 51.5));
        assert!(bounds_overlap(&a, &b, 5000.0, 51.5));
    }

    #[test]
    fn test_points_within_radius() {
        let center = GpsPoint::new(48.8566, 2.3522);
        let points = vec![
            offset_point(&center, 10.0, 0.0),
            offset_point(&center, 0.0, 90.0),
            offset_point(&center, 300.0, 300.0),
        ];
        let tree = build_rtree(&points);
        let mut hits: Vec<usize> = points_within(&tree, &points, &center, 100.0).into_iter().map(|(i, _)| i).collect();
        hits.sort();
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn test_meters_to_degrees() {
        assert!(approx_eq(meters_to_degrees(111_320.0, 0.0), 1.0, 0.01));
        assert!(meters_to_degrees(111_320.0, 45.0) > 1.0);
    }
}
