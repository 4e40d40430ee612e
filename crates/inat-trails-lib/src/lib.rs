//! iNat Trails Library - Observation retrieval and trail matching along GPX tracks
//!
//! This library downloads iNaturalist observations and OpenStreetMap roads for the
//! corridor around a recorded hike, caches both durably on disk, and matches every
//! observation to the nearest named trail.
//!
//! # Architecture
//!
//! - **[`DiskCache`]**: Gzip-compressed, TTL-bounded store with one file per [`CacheKey`]
//! - **[`api::RateLimiter`]**: Rolling-window call ceiling, one instance per remote API
//! - **[`api::Fetcher`]**: Rate-limited calls with concurrent page and id-batch fan-out
//! - **[`Retriever`]**: Cache-then-fetch facade that decodes responses into typed records
//! - **[`TrailIndex`]**: Named roads clipped to the corridor, queried through an R-tree
//! - **[`Track`]**: GPX tracks as one `MultiLineString`, bounding box and corridor
//!
//! # Coordinates
//!
//! All geometry is planar in WGS84 degrees with `x = longitude` and `y = latitude`,
//! matching the buffer distance the corridor is built with.

pub mod api;
mod cache;
mod config;
mod model;
mod observations;
mod places;
mod retrieval;
mod track;
mod trails;
pub mod utils;

// Public API exports
pub use cache::{CacheKey, CacheKind, DiskCache, SweepReport};
pub use config::{ApiConfig, CacheConfig, Config, TrailsConfig};
pub use model::{
    ConservationStatus, ICONIC_TAXA, ListedTaxon, ObservationQuery, OsmData, OverpassResponse,
    PhotoRecord, PlaceGeometry, PlaceRecord, PlaceRef, PlacesNearby, QualityGrade, RawNode,
    RawObservation, RawWay, TaxonRecord, UserRecord,
};
pub use observations::{
    Observation, ObservationSet, TaxonObservations, TaxonSummary, collect_observations,
};
pub use places::{
    EstablishmentStatus, UNKNOWN_PLACE, establishment_status, guess_place_name, places_along,
};
pub use retrieval::Retriever;
pub use track::Track;
pub use trails::{NamedTrail, TrailIndex};
pub use utils::BoundingBox;

/// Error types for retrieval, caching and trail matching
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Fan-out task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Result of {resource} mixes list and object envelopes")]
    MixedEnvelope { resource: String },

    #[error("Unexpected response from {resource}: {detail}")]
    UnexpectedResponse { resource: String, detail: String },

    #[error("Way {way} references unknown node {node}")]
    MissingNode { way: i64, node: i64 },

    #[error("GPX parsing error: {0}")]
    Gpx(#[from] gpx::errors::GpxError),

    #[error("Track has no segment with at least two points")]
    EmptyTrack,
}

pub type Result<T> = std::result::Result<T, Error>;
