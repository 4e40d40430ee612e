//! Hiking track read from GPX files
//!
//! All track segments of all files are combined into one `MultiLineString`
//! in WGS84 degrees (`x = longitude`, `y = latitude`), together with its
//! bounding box, point count and length.

use crate::utils::{self, BBOX_EPSILON, BoundingBox};
use crate::{Error, Result};
use geo::{BoundingRect, Buffer, Coord, LineString, MultiLineString, MultiPolygon};
use rayon::prelude::*;
use std::path::Path;

/// One or more recorded tracks with precomputed metadata
#[derive(Clone, Debug)]
pub struct Track {
    /// Every segment with at least two points
    lines: MultiLineString<f64>,
    /// Extent of `lines`, widened so it never degenerates
    bbox: BoundingBox,
    total_points: usize,
    /// Total length in meters
    total_distance: f64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Track {
    /// Build a track from already parsed GPX data
    pub fn from_gpx(gpx: &gpx::Gpx) -> Result<Self> {
        Self::from_gpx_all(std::slice::from_ref(gpx))
    }

    /// Read GPX files in parallel and combine their tracks
    pub fn from_gpx_files<P: AsRef<Path> + Send + Sync>(paths: &[P]) -> Result<Self> {
        let gpx_data: Result<Vec<gpx::Gpx>> = paths
            .par_iter()
            .map(|path| {
                let file = std::fs::File::open(path.as_ref())?;
                let reader = std::io::BufReader::new(file);
                Ok(gpx::read(reader)?)
            })
            .collect();

        Self::from_gpx_all(&gpx_data?)
    }

    fn from_gpx_all(gpx_data: &[gpx::Gpx]) -> Result<Self> {
        let mut lines = Vec::new();
        let mut total_points = 0;
        let mut total_distance = 0.0;

        let segments = gpx_data
            .iter()
            .flat_map(|gpx| gpx.tracks.iter())
            .flat_map(|track| track.segments.iter());
        for segment in segments {
            let coords: Vec<Coord<f64>> = segment
                .points
                .iter()
                .map(|waypoint| waypoint.point().0)
                .filter(|c| c.x.is_finite() && c.y.is_finite())
                .collect();
            if coords.len() < 2 {
                continue;
            }

            total_points += coords.len();
            total_distance += coords
                .windows(2)
                .map(|pair| utils::haversine_distance(pair[0].y, pair[0].x, pair[1].y, pair[1].x))
                .sum::<f64>();
            lines.push(LineString::new(coords));
        }

        let lines = MultiLineString::new(lines);
        let rect = lines.bounding_rect().ok_or(Error::EmptyTrack)?;
        tracing::info!(
            "Read {} track segments with {} points, {:.1} km",
            lines.0.len(),
            total_points,
            total_distance / 1000.0
        );

        Ok(Self {
            lines,
            bbox: BoundingBox::from_rect(rect).expand(BBOX_EPSILON),
            total_points,
            total_distance,
        })
    }

    #[inline]
    pub fn lines(&self) -> &MultiLineString<f64> {
        &self.lines
    }

    #[inline]
    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    #[inline]
    pub fn total_points(&self) -> usize {
        self.total_points
    }

    /// Total length in meters (Haversine)
    #[inline]
    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    /// Area within `distance` degrees of the track
    pub fn corridor(&self, distance: f64) -> MultiPolygon<f64> {
        self.lines.buffer(distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Contains, Point};
    use gpx::{Gpx, TrackSegment, Waypoint};
    use std::io::Write;

    fn waypoint(lat: f64, lon: f64) -> Waypoint {
        Waypoint::new(Point::new(lon, lat))
    }

    fn create_test_gpx() -> Gpx {
        let mut gpx = Gpx::default();
        let mut track = gpx::Track::default();

        let mut segment = TrackSegment::default();
        segment.points.push(waypoint(37.5000, -122.2500));
        segment.points.push(waypoint(37.5010, -122.2500));
        segment.points.push(waypoint(37.5010, -122.2490));
        track.segments.push(segment);

        // Single-point segments carry no line
        let mut lone = TrackSegment::default();
        lone.points.push(waypoint(38.0, -121.0));
        track.segments.push(lone);

        gpx.tracks.push(track);
        gpx
    }

    #[test]
    fn test_track_creation() {
        let track = Track::from_gpx(&create_test_gpx()).unwrap();

        assert_eq!(track.lines().0.len(), 1);
        assert_eq!(track.total_points(), 3);
        let bbox = track.bbox();
        assert!(bbox.min_lat < 37.5 && bbox.max_lat > 37.501);
        // The lone point is not part of the extent
        assert!(bbox.max_lat < 38.0);
    }

    #[test]
    fn test_empty_track_fails() {
        assert!(matches!(Track::from_gpx(&Gpx::default()), Err(Error::EmptyTrack)));
    }

    #[test]
    fn test_straight_track_has_area() {
        let mut gpx = Gpx::default();
        let mut track = gpx::Track::default();
        let mut segment = TrackSegment::default();
        segment.points.push(waypoint(37.5, -122.25));
        segment.points.push(waypoint(37.6, -122.25));
        track.segments.push(segment);
        gpx.tracks.push(track);

        let bbox = Track::from_gpx(&gpx).unwrap().bbox();
        assert!(bbox.max_lon > bbox.min_lon);
    }

    #[test]
    fn test_total_distance() {
        let track = Track::from_gpx(&create_test_gpx()).unwrap();
        // About 111 m north, then about 88 m east
        assert!(track.total_distance() > 190.0);
        assert!(track.total_distance() < 210.0);
    }

    #[test]
    fn test_corridor_follows_track() {
        let track = Track::from_gpx(&create_test_gpx()).unwrap();
        let corridor = track.corridor(0.0002);

        assert!(corridor.unsigned_area() > 0.0);
        assert!(corridor.contains(&Point::new(-122.2500, 37.5005)));
        assert!(corridor.contains(&Point::new(-122.2501, 37.5005)));
        assert!(!corridor.contains(&Point::new(-122.2510, 37.5005)));
    }

    #[test]
    fn test_from_gpx_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hike.gpx");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk><name>Loop</name><trkseg>
    <trkpt lat="37.5" lon="-122.25"></trkpt>
    <trkpt lat="37.501" lon="-122.25"></trkpt>
  </trkseg></trk>
</gpx>"#
        )
        .unwrap();

        let track = Track::from_gpx_files(&[&path]).unwrap();
        assert_eq!(track.total_points(), 2);

        let missing = dir.path().join("missing.gpx");
        assert!(matches!(Track::from_gpx_files(&[missing]), Err(Error::Io(_))));
    }
}
