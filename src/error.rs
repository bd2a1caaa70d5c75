//! Error types for the presence engine.
//!
//! Stale data (expired presence, empty cells) is never an error: those cases
//! surface as empty results.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid coordinates: lat={lat}, lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unknown venue: {0}")]
    UnknownVenue(String),

    #[error("upstream unavailable: {0}")]
    TransientUpstream(String),

    #[error("circuit open, retry in {retry_in_secs}s")]
    CircuitOpen { retry_in_secs: u64 },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether a caller may retry the same request later.
    ///
    /// Only upstream failures are retried automatically; a rate-limited
    /// caller has to wait for the window to reset.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TransientUpstream(_) | Self::CircuitOpen { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
