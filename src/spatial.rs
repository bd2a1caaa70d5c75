//! # Spatial Index
//!
//! Deterministic cell identifiers used as grouping keys.
//!
//! Two independent granularities:
//!
//! - **Geohash** ([`geohash_key`]): coarse base-32 keys used to pre-filter
//!   proximity candidates. A precision-5 key covers roughly 4.9 × 4.9 km.
//! - **Hex grid** ([`hex_key`]): pointy-top hexagons laid on a
//!   spherical-Mercator plane, used for tile aggregation. The edge length
//!   halves with every resolution step.
//!
//! Keeping them as separate functions means retuning tile resolution never
//! changes proximity keys, and vice versa.
//!
//! ```rust
//! use presence_engine::spatial;
//!
//! let key = spatial::geohash_key(57.64911, 10.40744, 5).unwrap();
//! assert_eq!(key, "u4pru");
//!
//! let block = spatial::geohash_neighbors(&key).unwrap();
//! assert_eq!(block.len(), 9);
//! assert!(block.contains(&key));
//! ```

use std::collections::BTreeSet;
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use crate::error::{Error, Result};
use crate::geo_utils::{validate_point, METERS_PER_DEGREE};
use crate::{Bounds, GpsPoint};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Maximum supported geohash length.
pub const MAX_GEOHASH_PRECISION: usize = 12;

/// Maximum supported hex resolution.
pub const MAX_HEX_RESOLUTION: u8 = 20;

/// Hex edge length in projected metres at resolution 0.
const HEX_BASE_EDGE_M: f64 = 1_000_000.0;

/// Web-Mercator sphere radius.
const MERCATOR_RADIUS_M: f64 = 6_378_137.0;

/// Mercator projection latitude limit.
const MERCATOR_MAX_LAT: f64 = 85.051_128_78;

// =============================================================================
// Geohash
// =============================================================================

/// Encode a coordinate as a geohash of `precision` characters.
pub fn geohash_key(lat: f64, lng: f64, precision: usize) -> Result<String> {
    validate_point(lat, lng)?;
    if precision == 0 || precision > MAX_GEOHASH_PRECISION {
        return Err(Error::InvalidInput(format!(
            "geohash precision must be 1..={}, got {}",
            MAX_GEOHASH_PRECISION, precision
        )));
    }

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lng_lo, mut lng_hi) = (-180.0_f64, 180.0_f64);
    let mut key = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0u8;
    let mut bit_count = 0;

    while key.len() < precision {
        if even {
            let mid = (lng_lo + lng_hi) / 2.0;
            if lng >= mid {
                bits = (bits << 1) | 1;
                lng_lo = mid;
            } else {
                bits <<= 1;
                lng_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                bits = (bits << 1) | 1;
                lat_lo = mid;
            } else {
                bits <<= 1;
                lat_hi = mid;
            }
        }
        even = !even;
        bit_count += 1;

        if bit_count == 5 {
            key.push(BASE32[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }

    Ok(key)
}

/// Decode a geohash into the bounding box of its cell.
pub fn geohash_bounds(key: &str) -> Result<Bounds> {
    if key.is_empty() || key.len() > MAX_GEOHASH_PRECISION {
        return Err(Error::InvalidInput(format!("malformed geohash: {:?}", key)));
    }

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lng_lo, mut lng_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for c in key.bytes() {
        let value = BASE32
            .iter()
            .position(|&b| b == c)
            .ok_or_else(|| Error::InvalidInput(format!("malformed geohash: {:?}", key)))?;

        for shift in (0..5).rev() {
            let bit = (value >> shift) & 1 == 1;
            if even {
                let mid = (lng_lo + lng_hi) / 2.0;
                if bit { lng_lo = mid } else { lng_hi = mid }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit { lat_lo = mid } else { lat_hi = mid }
            }
            even = !even;
        }
    }

    Ok(Bounds { min_lat: lat_lo, max_lat: lat_hi, min_lng: lng_lo, max_lng: lng_hi })
}

/// Cell size in degrees `(lat_height, lng_width)` for a geohash precision.
pub fn geohash_cell_size(precision: usize) -> (f64, f64) {
    let total_bits = 5 * precision as i32;
    let lng_bits = (total_bits + 1) / 2;
    let lat_bits = total_bits / 2;
    (180.0 / 2f64.powi(lat_bits), 360.0 / 2f64.powi(lng_bits))
}

/// The 3×3 block of cells around `key`, including `key` itself.
///
/// Longitude wraps at the antimeridian; rows beyond the poles are dropped,
/// so polar cells have six neighbours instead of eight.
pub fn geohash_neighbors(key: &str) -> Result<BTreeSet<String>> {
    let bounds = geohash_bounds(key)?;
    let precision = key.len();
    let center = bounds.center();
    let height = bounds.max_lat - bounds.min_lat;
    let width = bounds.max_lng - bounds.min_lng;

    let mut block = BTreeSet::new();
    for dlat in [-1.0, 0.0, 1.0] {
        let lat = center.latitude + dlat * height;
        if !(-90.0..=90.0).contains(&lat) {
            continue;
        }
        for dlng in [-1.0, 0.0, 1.0] {
            let lng = wrap_longitude(center.longitude + dlng * width);
            block.insert(geohash_key(lat, lng, precision)?);
        }
    }
    Ok(block)
}

/// Finest geohash precision whose cells are at least `radius_m` across at
/// `latitude`, so that a 3×3 neighbour block covers the whole radius.
pub fn precision_for_radius(radius_m: f64, latitude: f64) -> usize {
    let lng_scale = METERS_PER_DEGREE * latitude.to_radians().cos().abs().max(0.01);
    (1..=MAX_GEOHASH_PRECISION)
        .rev()
        .find(|&p| {
            let (h, w) = geohash_cell_size(p);
            h * METERS_PER_DEGREE >= radius_m && w * lng_scale >= radius_m
        })
        .unwrap_or(1)
}

fn wrap_longitude(lng: f64) -> f64 {
    let wrapped = (lng + 180.0).rem_euclid(360.0) - 180.0;
    // rem_euclid can land exactly on 180 through rounding
    if wrapped >= 180.0 { wrapped - 360.0 } else { wrapped }
}

// =============================================================================
// Hex grid
// =============================================================================

/// Axial coordinate of a hex cell at a given resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HexCell {
    pub resolution: u8,
    pub q: i64,
    pub r: i64,
}

impl HexCell {
    /// Stable textual key, e.g. `h12:1024:-37`.
    pub fn key(&self) -> String {
        format!("h{}:{}:{}", self.resolution, self.q, self.r)
    }

    /// Parse a key produced by [`HexCell::key`].
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = || Error::InvalidInput(format!("malformed hex key: {:?}", key));
        let body = key.strip_prefix('h').ok_or_else(malformed)?;
        let mut parts = body.split(':');
        let resolution: u8 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
        let q: i64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
        let r: i64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
        if parts.next().is_some() || resolution > MAX_HEX_RESOLUTION {
            return Err(malformed());
        }
        Ok(Self { resolution, q, r })
    }

    /// Geographic centre of the cell.
    pub fn center(&self) -> GpsPoint {
        let size = hex_edge_length(self.resolution);
        let sqrt3 = 3f64.sqrt();
        let x = size * (sqrt3 * self.q as f64 + sqrt3 / 2.0 * self.r as f64);
        let y = size * 1.5 * self.r as f64;
        unproject(x, y)
    }

    /// All cells within `rings` steps, including this one.
    pub fn disk(&self, rings: u32) -> BTreeSet<HexCell> {
        let k = rings as i64;
        let mut cells = BTreeSet::new();
        for dq in -k..=k {
            let lo = (-k).max(-dq - k);
            let hi = k.min(-dq + k);
            for dr in lo..=hi {
                cells.insert(HexCell { resolution: self.resolution, q: self.q + dq, r: self.r + dr });
            }
        }
        cells
    }
}

/// Edge length (projected metres) of hexes at `resolution`.
pub fn hex_edge_length(resolution: u8) -> f64 {
    HEX_BASE_EDGE_M / 2f64.powi(resolution as i32)
}

/// Locate the hex cell containing a coordinate.
pub fn hex_cell(lat: f64, lng: f64, resolution: u8) -> Result<HexCell> {
    validate_point(lat, lng)?;
    if resolution > MAX_HEX_RESOLUTION {
        return Err(Error::InvalidInput(format!(
            "hex resolution must be 0..={}, got {}",
            MAX_HEX_RESOLUTION, resolution
        )));
    }

    let (x, y) = project(lat, lng);
    let size = hex_edge_length(resolution);
    let sqrt3 = 3f64.sqrt();
    let qf = (sqrt3 / 3.0 * x - y / 3.0) / size;
    let rf = (2.0 / 3.0 * y) / size;
    let (q, r) = axial_round(qf, rf);
    Ok(HexCell { resolution, q, r })
}

/// Hex key for a coordinate at `resolution`.
pub fn hex_key(lat: f64, lng: f64, resolution: u8) -> Result<String> {
    hex_cell(lat, lng, resolution).map(|c| c.key())
}

/// Keys of all hex cells within `rings` of `key`, including `key`.
pub fn hex_neighbors(key: &str, rings: u32) -> Result<BTreeSet<String>> {
    let cell = HexCell::parse(key)?;
    Ok(cell.disk(rings).into_iter().map(|c| c.key()).collect())
}

/// Centre of the hex cell identified by `key`.
pub fn hex_center(key: &str) -> Result<GpsPoint> {
    HexCell::parse(key).map(|c| c.center())
}

fn project(lat: f64, lng: f64) -> (f64, f64) {
    let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
    let x = MERCATOR_RADIUS_M * lng.to_radians();
    let y = MERCATOR_RADIUS_M * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

fn unproject(x: f64, y: f64) -> GpsPoint {
    let lng = (x / MERCATOR_RADIUS_M).to_degrees();
    let lat = (2.0 * (y / MERCATOR_RADIUS_M).exp().atan() - FRAC_PI_2).to_degrees();
    GpsPoint::new(lat, lng)
}

fn axial_round(qf: f64, rf: f64) -> (i64, i64) {
    let sf = -qf - rf;
    let mut q = qf.round();
    let mut r = rf.round();
    let s = sf.round();

    let dq = (q - qf).abs();
    let dr = (r - rf).abs();
    let ds = (s - sf).abs();

    if dq > dr && dq > ds {
        q = -r - s;
    } else if dr > ds {
        r = -q - s;
    }
    (q as i64, r as i64)
}
