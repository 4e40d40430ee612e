//! Configuration for remote APIs, the disk cache and trail matching

use std::path::{Path, PathBuf};
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Settings for the remote APIs and the retrieval engine
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Maximum number of calls per rolling window, per API (default: 60)
    pub call_limit: usize,
    /// Length of the rolling window (default: 60 s)
    pub call_window: Duration,
    /// Results requested per page (default: 200, the iNaturalist maximum)
    pub per_page: usize,
    /// Hard ceiling on results for one logical query (default: 10,000)
    pub download_limit: usize,
    /// Ids per call for lookups by id (default: 30)
    pub id_batch_size: usize,
    /// Timeout for a single HTTP call (default: 60 s)
    pub request_timeout: Duration,
    /// iNaturalist API v1, used for places
    pub inat_v1_url: String,
    /// iNaturalist API v2, used for observations and taxa
    pub inat_v2_url: String,
    /// Overpass interpreter endpoint for OpenStreetMap ways
    pub overpass_url: String,
    /// Static `User-Agent` header sent with every call
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            call_limit: 60,
            call_window: Duration::from_secs(60),
            per_page: 200,
            download_limit: 10_000,
            id_batch_size: 30,
            request_timeout: Duration::from_secs(60),
            inat_v1_url: "https://api.inaturalist.org/v1".to_string(),
            inat_v2_url: "https://api.inaturalist.org/v2".to_string(),
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            user_agent: "github.com/joergmlpts/iNat-trails".to_string(),
        }
    }
}

impl ApiConfig {
    /// Maximum number of pages one logical query may request, first page included
    #[inline]
    pub fn max_pages(&self) -> usize {
        (self.download_limit / self.per_page.max(1)).max(1)
    }
}

/// Settings for the disk cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one compressed file per cache key
    pub directory: PathBuf,
    /// Lifetime of observation entries (default: 8 hours)
    pub observations_ttl: Duration,
    /// Lifetime of place entries (default: 1 week)
    pub places_ttl: Duration,
    /// Lifetime of the taxa entry (default: 2 weeks)
    pub taxa_ttl: Duration,
    /// Lifetime of road and trail geometry (default: 4 weeks)
    pub trails_ttl: Duration,
    /// Number of decoded entries kept in memory (default: 32)
    pub hot_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: Self::default_directory(),
            observations_ttl: 8 * HOUR,
            places_ttl: 7 * DAY,
            taxa_ttl: 14 * DAY,
            trails_ttl: 28 * DAY,
            hot_entries: 32,
        }
    }
}

impl CacheConfig {
    /// Cache settings rooted at `directory` with default lifetimes
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Determine a good default cache directory for the current user.
    /// Uses environment variables when available:
    /// - On Windows: %LOCALAPPDATA%/inat_trails
    /// - Else: $XDG_CACHE_HOME/inat_trails or $HOME/.cache/inat_trails
    pub fn default_directory() -> PathBuf {
        if cfg!(windows)
            && let Ok(local) = std::env::var("LOCALAPPDATA")
        {
            return Path::new(&local).join("inat_trails");
        }

        if let Ok(xdg) = std::env::var("XDG_CACHE_HOME")
            && !xdg.is_empty()
        {
            return Path::new(&xdg).join("inat_trails");
        }

        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(".cache").join("inat_trails");
        }

        // Fallback to current directory
        Path::new(".").join(".inat_trails_cache")
    }
}

/// Settings for corridor construction and observation filtering
#[derive(Debug, Clone)]
pub struct TrailsConfig {
    /// Corridor half-width around the track, in degrees (default: 0.0002)
    pub buffer_distance: f64,
    /// Observations with a larger public accuracy radius are skipped, in meters (default: 25)
    pub accuracy_limit: f64,
}

impl Default for TrailsConfig {
    fn default() -> Self {
        Self {
            buffer_distance: 0.0002,
            accuracy_limit: 25.0,
        }
    }
}

/// Complete configuration of the library
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub trails: TrailsConfig,
}
