//! # Debounce Gate
//!
//! Decides whether an incoming ping is significant enough to write.
//!
//! A ping is written when any of these hold:
//! 1. There is no live row for the subject yet
//! 2. The vibe, visibility or venue changed (state changes are never dropped)
//! 3. The class-specific minimum interval has elapsed since the last write
//! 4. The displacement exceeds an accuracy-aware distance threshold
//!
//! The minimum interval comes from a movement-class lookup table rather than a
//! single constant, so idle devices write rarely and moving ones often.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geo_utils::haversine_distance;
use crate::presence::{Presence, PresencePing};

/// Coarse speed class selecting the debounce interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementClass {
    Stationary,
    Walking,
    Running,
    Driving,
}

/// Gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// Minimum seconds between writes per movement class.
    /// Default: stationary 300s, walking 60s, running 30s, driving 15s.
    pub min_interval_secs: BTreeMap<MovementClass, i64>,
    /// Interval used for classes missing from the table (default: 60s).
    pub fallback_interval_secs: i64,
    /// Displacement floor in metres (default: 25m).
    pub min_distance_m: f64,
    /// Multiplier applied to the worse of the two accuracy radii (default: 1.0).
    pub accuracy_factor: f64,
    /// Pings less accurate than this never trigger on displacement (default: 100m).
    pub max_accuracy_m: f64,
    /// Speed thresholds (m/s) for inferring a class when the device sends none.
    /// Defaults: walking 0.5, running 2.5, driving 7.0.
    pub walking_min_mps: f64,
    pub running_min_mps: f64,
    pub driving_min_mps: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        let min_interval_secs = BTreeMap::from([
            (MovementClass::Stationary, 300),
            (MovementClass::Walking, 60),
            (MovementClass::Running, 30),
            (MovementClass::Driving, 15),
        ]);
        Self {
            min_interval_secs,
            fallback_interval_secs: 60,
            min_distance_m: 25.0,
            accuracy_factor: 1.0,
            max_accuracy_m: 100.0,
            walking_min_mps: 0.5,
            running_min_mps: 2.5,
            driving_min_mps: 7.0,
        }
    }
}

impl DebounceConfig {
    pub fn interval_for(&self, class: MovementClass) -> i64 {
        self.min_interval_secs.get(&class).copied().unwrap_or(self.fallback_interval_secs)
    }

    /// Classify an implied speed.
    pub fn classify_speed(&self, speed_mps: f64) -> MovementClass {
        if speed_mps >= self.driving_min_mps {
            MovementClass::Driving
        } else if speed_mps >= self.running_min_mps {
            MovementClass::Running
        } else if speed_mps >= self.walking_min_mps {
            MovementClass::Walking
        } else {
            MovementClass::Stationary
        }
    }
}

/// Why a ping was or was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteReason {
    FirstPing,
    VibeChanged,
    VisibilityChanged,
    VenueChanged,
    IntervalElapsed,
    Displaced,
    /// Older than the stored row; the store would ignore it anyway.
    OutOfOrder,
    Suppressed,
}

/// Outcome of [`should_write`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteDecision {
    pub write: bool,
    pub reason: WriteReason,
    pub movement: Option<MovementClass>,
    pub displacement_m: Option<f64>,
}

impl WriteDecision {
    fn write(reason: WriteReason) -> Self {
        Self { write: true, reason, movement: None, displacement_m: None }
    }
}

/// Compare a ping against the subject's current live row.
///
/// `old` must already be filtered for expiry; an expired row counts as none.
pub fn should_write(old: Option<&Presence>, ping: &PresencePing, config: &DebounceConfig) -> WriteDecision {
    let Some(old) = old else {
        return WriteDecision::write(WriteReason::FirstPing);
    };

    let elapsed = ping.timestamp - old.updated_at;
    if elapsed < 0 {
        return WriteDecision { write: false, reason: WriteReason::OutOfOrder, movement: None, displacement_m: None };
    }

    if ping.vibe != old.vibe {
        return WriteDecision::write(WriteReason::VibeChanged);
    }
    if matches!(ping.visibility, Some(v) if v != old.visibility) {
        return WriteDecision::write(WriteReason::VisibilityChanged);
    }
    if ping.venue_id != old.venue_id {
        return WriteDecision::write(WriteReason::VenueChanged);
    }

    let displacement = haversine_distance(&old.location, &ping.location);
    let movement = ping.movement.unwrap_or_else(|| {
        if elapsed == 0 {
            MovementClass::Stationary
        } else {
            config.classify_speed(displacement / elapsed as f64)
        }
    });

    let mut decision = WriteDecision {
        write: false,
        reason: WriteReason::Suppressed,
        movement: Some(movement),
        displacement_m: Some(displacement),
    };

    if elapsed >= config.interval_for(movement) {
        decision.write = true;
        decision.reason = WriteReason::IntervalElapsed;
        return decision;
    }

    let new_accuracy = ping.accuracy_m.unwrap_or(0.0);
    if new_accuracy <= config.max_accuracy_m {
        let worst = new_accuracy.max(old.accuracy_m.unwrap_or(0.0));
        let threshold = config.min_distance_m.max(config.accuracy_factor * worst);
        if displacement > threshold {
            decision.write = true;
            decision.reason = WriteReason::Displaced;
        }
    }

    decision
}
