//! # Presence Engine
//!
//! Real-time geospatial presence and proximity clustering for a
//! location-based social app.
//!
//! This library provides:
//! - A TTL-expiring presence store with a geohash index and read-time
//!   visibility
//! - A debounce gate that decides which location pings are worth a write
//! - Hex-cell tiles and vibe clusters built incrementally from dirty cells
//! - Pairwise proximity detection (ripples, crossed paths) and multi-member
//!   waves
//! - Fuzzy venue deduplication against external providers
//! - Venue recommendations from popularity, heat, friends, vibe and distance
//!
//! ## Features
//!
//! - **`parallel`** - Build tiles and advance proximity shards with rayon
//! - **`http`** - Enable the reqwest-backed venue provider
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use presence_engine::{GpsPoint, NearbyFilters, NoFriends, PresenceEngine, PresencePing};
//! use presence_engine::config::EngineConfig;
//!
//! let engine = PresenceEngine::new(EngineConfig::default(), Arc::new(NoFriends)).unwrap();
//! let now = 1_710_496_800;
//!
//! let alice = PresencePing::new("alice", GpsPoint::new(51.5074, -0.1278), now).with_vibe("chill");
//! let bob = PresencePing::new("bob", GpsPoint::new(51.5075, -0.1278), now).with_vibe("party");
//! engine.upsert_presence("alice", &alice, now).unwrap();
//! engine.upsert_presence("bob", &bob, now).unwrap();
//!
//! let nearby = engine.nearby_users("alice", 51.5074, -0.1278, 100.0, &NearbyFilters::default(), now).unwrap();
//! assert_eq!(nearby.len(), 1);
//! assert_eq!(nearby[0].subject_id, "bob");
//! ```

use serde::{Deserialize, Serialize};

pub mod config;
pub mod crossed;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod geo_utils;
pub mod guard;
pub mod import;
pub mod presence;
pub mod proximity;
pub mod scheduler;
pub mod scoring;
pub mod spatial;
pub mod tiles;
pub mod venue;
pub mod visits;
pub mod waves;

// HTTP venue provider
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpVenueProvider;

pub use config::EngineConfig;
pub use engine::{IngestOutcome, NearbyFilters, NearbyUser, PresenceEngine, RecFilters};
pub use error::{Error, Result};
pub use import::{VenueImporter, VenueProvider};
pub use presence::{FriendGraph, NoFriends, Presence, PresencePing, StaticFriendGraph, Visibility};
pub use proximity::{PairKey, ProximityEvent, ProximityEventKind, RippleSignal};
pub use tiles::{BuildBudget, SpatialTile, VibeCluster};
pub use venue::{Resolution, VenueCandidate};

/// Opaque subject identifier issued by the identity service.
pub type SubjectId = String;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use presence_engine::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Latitude/longitude box. Boxes never wrap the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self { min_lat, max_lat, min_lng, max_lng })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Whether `point` lies inside or on the edge of the box.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}
