//! Engine configuration.
//!
//! Every threshold the engine uses lives in one of the per-module config
//! structs; [`EngineConfig`] gathers them so a deployment can override any
//! subset from a JSON document. Missing fields keep their defaults.
//!
//! ```rust
//! use presence_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{ "proximity": { "radius_m": 30.0 } }"#).unwrap();
//! assert_eq!(config.proximity.radius_m, 30.0);
//! assert_eq!(config.presence.ttl_secs, 900);
//! ```

use serde::{Deserialize, Serialize};

use crate::debounce::DebounceConfig;
use crate::error::{Error, Result};
use crate::guard::{BreakerConfig, RateLimitConfig};
use crate::import::ImportConfig;
use crate::presence::PresenceConfig;
use crate::proximity::ProximityConfig;
use crate::scheduler::SchedulerConfig;
use crate::scoring::ScoringConfig;
use crate::spatial::MAX_GEOHASH_PRECISION;
use crate::tiles::TileConfig;
use crate::venue::MatchThresholds;
use crate::waves::WaveConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub presence: PresenceConfig,
    pub debounce: DebounceConfig,
    pub tiles: TileConfig,
    pub proximity: ProximityConfig,
    pub waves: WaveConfig,
    pub venue: MatchThresholds,
    pub scoring: ScoringConfig,
    /// Presence writes per subject.
    pub ingest_rate: RateLimitConfig,
    /// Calls per venue provider.
    pub provider_rate: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub import: ImportConfig,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
}

/// How long batch outputs and history are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Materialized proximity events stay queryable this long (default: 86400s).
    pub event_secs: i64,
    /// Crossed-path rows, in UTC days (default: 30).
    pub crossed_path_days: u64,
    /// Venue visits feeding the scorer, in days (default: 90).
    pub visit_days: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { event_secs: 86_400, crossed_path_days: 30, visit_days: 90 }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.event_secs < 0 {
            return Err(Error::Config("retention.event_secs must not be negative".into()));
        }
        if self.crossed_path_days == 0 || self.visit_days == 0 {
            return Err(Error::Config("retention days must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            debounce: DebounceConfig::default(),
            tiles: TileConfig::default(),
            proximity: ProximityConfig::default(),
            waves: WaveConfig::default(),
            venue: MatchThresholds::default(),
            scoring: ScoringConfig::default(),
            ingest_rate: RateLimitConfig { max_requests: 60, window_secs: 60 },
            provider_rate: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            import: ImportConfig::default(),
            scheduler: SchedulerConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.presence.ttl_secs <= 0 {
            return Err(Error::Config("presence.ttl_secs must be positive".into()));
        }
        if self.presence.index_precision == 0 || self.presence.index_precision > MAX_GEOHASH_PRECISION {
            return Err(Error::Config(format!(
                "presence.index_precision must be within 1..={}",
                MAX_GEOHASH_PRECISION
            )));
        }

        let d = &self.debounce;
        if d.min_interval_secs.values().any(|v| *v < 0) || d.fallback_interval_secs < 0 {
            return Err(Error::Config("debounce intervals must not be negative".into()));
        }
        if !(d.min_distance_m >= 0.0 && d.accuracy_factor >= 0.0 && d.max_accuracy_m > 0.0) {
            return Err(Error::Config("debounce distances must not be negative".into()));
        }
        if !(d.walking_min_mps <= d.running_min_mps && d.running_min_mps <= d.driving_min_mps) {
            return Err(Error::Config("debounce speed thresholds must be ascending".into()));
        }

        for (name, rate) in [("ingest_rate", &self.ingest_rate), ("provider_rate", &self.provider_rate)] {
            if rate.max_requests == 0 || rate.window_secs <= 0 {
                return Err(Error::Config(format!("{} needs a positive budget and window", name)));
            }
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(Error::Config("breaker thresholds must be at least 1".into()));
        }

        self.tiles.validate()?;
        self.proximity.validate()?;
        self.waves.validate()?;
        self.venue.validate()?;
        self.scoring.validate()?;
        self.import.validate()?;
        self.scheduler.validate()?;
        self.retention.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let json = r#"{
            "presence": { "ttl_secs": 600 },
            "venue": { "name_threshold": 0.85 },
            "ingest_rate": { "max_requests": 10 }
        }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.presence.ttl_secs, 600);
        assert_eq!(config.presence.index_precision, 6);
        assert_eq!(config.venue.name_threshold, 0.85);
        assert_eq!(config.venue.radius_m, 50.0);
        assert_eq!(config.ingest_rate.max_requests, 10);
        assert_eq!(config.ingest_rate.window_secs, 60);
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(EngineConfig::from_json(r#"{ "presence": { "ttl_secs": 0 } }"#), Err(Error::Config(_))));
        assert!(matches!(EngineConfig::from_json(r#"{ "proximity": { "radius_m": -1.0 } }"#), Err(Error::Config(_))));
        assert!(matches!(EngineConfig::from_json("not json"), Err(Error::Config(_))));
        assert!(matches!(
            EngineConfig::from_json(r#"{ "debounce": { "walking_min_mps": 9.0 } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{ "retention": { "visit_days": 0 } }"#),
            Err(Error::Config(_))
        ));
    }
}
