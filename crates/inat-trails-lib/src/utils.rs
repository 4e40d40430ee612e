//! Utility functions for bounding boxes, distances and query windows

use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};

/// Quantization precision for trail and observation queries (two decimals)
pub const TRAILS_PRECISION: f64 = 100.0;

/// Quantization precision for nearby-place queries (three decimals)
pub const PLACES_PRECISION: f64 = 1000.0;

/// Margin added around a track's extent so the bounding box never degenerates
pub const BBOX_EPSILON: f64 = 1e-7;

/// Earth's mean radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Axis-aligned bounding box in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Round the box outward to a decimal grid.
    ///
    /// The minimum corner is floored and the maximum corner is ceiled, so the
    /// quantized box always contains the original one. `precision` is a power
    /// of ten: 100 keeps two decimals, 1000 keeps three. Corners rounding to
    /// zero are always `+0.0`, never `-0.0`.
    #[inline]
    pub fn quantize(&self, precision: f64) -> Self {
        // Adding +0.0 turns -0.0 into +0.0 and leaves every other value alone
        Self {
            min_lon: (self.min_lon * precision).floor() / precision + 0.0,
            min_lat: (self.min_lat * precision).floor() / precision + 0.0,
            max_lon: (self.max_lon * precision).ceil() / precision + 0.0,
            max_lat: (self.max_lat * precision).ceil() / precision + 0.0,
        }
    }

    /// Grow the box by `margin` degrees on every side
    #[inline]
    pub fn expand(&self, margin: f64) -> Self {
        Self {
            min_lon: self.min_lon - margin,
            min_lat: self.min_lat - margin,
            max_lon: self.max_lon + margin,
            max_lat: self.max_lat + margin,
        }
    }

    /// Check whether a point lies inside the box (boundary included)
    #[inline]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    #[inline]
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_lon,
                y: self.min_lat,
            },
            Coord {
                x: self.max_lon,
                y: self.max_lat,
            },
        )
    }

    #[inline]
    pub fn from_rect(rect: Rect<f64>) -> Self {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    /// Render the box as `min_lon_min_lat_max_lon_max_lat` with fixed decimals
    pub fn key_fragment(&self, decimals: usize) -> String {
        format!(
            "{:.d$}_{:.d$}_{:.d$}_{:.d$}",
            self.min_lon,
            self.min_lat,
            self.max_lon,
            self.max_lat,
            d = decimals
        )
    }
}

/// Calculate the Haversine distance between two WGS84 points in meters
#[inline]
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Months to query when restricting observations to the season around `month`
///
/// Returns the month itself followed by the next and the previous month,
/// wrapping around the year. `month` is 1-based.
pub fn month_window(month: u32) -> Vec<u32> {
    let month = month.clamp(1, 12);
    let next = if month == 12 { 1 } else { month + 1 };
    let previous = if month == 1 { 12 } else { month - 1 };
    vec![month, next, previous]
}

/// All twelve months
pub fn all_months() -> Vec<u32> {
    (1..=12).collect()
}

/// Join values with commas, the list syntax of the iNaturalist API
pub fn join_comma<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
