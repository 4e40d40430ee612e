//! Named roads and trails along the track
//!
//! Ways with a `highway` tag are clipped to the corridor, merged by name and
//! broken into straight segments stored in an R-tree. Nearest-trail queries
//! compare squared planar distances in degrees against twice the buffer
//! distance the corridor was built with.

use crate::model::{OsmData, OverpassResponse};
use crate::retrieval::Retriever;
use crate::utils::BoundingBox;
use crate::{Error, Result};
use geo::{BooleanOps, Coord, LineString, MultiLineString, MultiPolygon};
use rayon::prelude::*;
use rstar::{AABB, PointDistance, RTree, RTreeObject};
use std::collections::{BTreeMap, HashMap};

/// One straight piece of a named trail, `[lon, lat]` end points
#[derive(Clone, Debug)]
struct TrailSegment {
    from: [f64; 2],
    to: [f64; 2],
    /// Index into `TrailIndex::trails`
    trail: usize,
}

impl RTreeObject for TrailSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.from, self.to)
    }
}

impl PointDistance for TrailSegment {
    /// Squared distance from the point to the closest point of the segment
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let [x1, y1] = self.from;
        let [x2, y2] = self.to;
        let (dx, dy) = (x2 - x1, y2 - y1);
        let length_2 = dx * dx + dy * dy;

        let t = if length_2 > 0.0 {
            (((point[0] - x1) * dx + (point[1] - y1) * dy) / length_2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let px = x1 + t * dx - point[0];
        let py = y1 + t * dy - point[1];
        px * px + py * py
    }
}

/// All clipped pieces of the roads sharing one name
#[derive(Clone, Debug, PartialEq)]
pub struct NamedTrail {
    pub name: String,
    pub geometry: MultiLineString<f64>,
}

/// Spatial index over the named trails inside the corridor
#[derive(Debug)]
pub struct TrailIndex {
    /// Sorted by name
    trails: Vec<NamedTrail>,
    tree: RTree<TrailSegment>,
    buffer_distance: f64,
}

impl TrailIndex {
    /// Download the ways in `bbox` and index the named ones inside `corridor`
    ///
    /// An Overpass answer without elements yields an empty index.
    pub async fn load(
        retriever: &Retriever,
        bbox: &BoundingBox,
        corridor: &MultiPolygon<f64>,
        buffer_distance: f64,
    ) -> Result<Self> {
        match retriever.fetch_ways(bbox).await? {
            OverpassResponse::Elements(data) => Self::from_osm(&data, corridor, buffer_distance),
            OverpassResponse::Unparsed(body) => {
                tracing::warn!(
                    "Overpass returned no elements, continuing without trails: {}",
                    body.chars().take(200).collect::<String>()
                );
                Ok(Self::empty(buffer_distance))
            }
        }
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TrailIndex {
    pub fn empty(buffer_distance: f64) -> Self {
        Self {
            trails: Vec::new(),
            tree: RTree::new(),
            buffer_distance,
        }
    }

    /// Build the index from raw OSM nodes and ways
    ///
    /// Ways without a name or with fewer than two nodes are ignored; a way
    /// referencing a node missing from `data` is an error.
    pub fn from_osm(
        data: &OsmData,
        corridor: &MultiPolygon<f64>,
        buffer_distance: f64,
    ) -> Result<Self> {
        let nodes: HashMap<i64, Coord<f64>> = data
            .nodes
            .iter()
            .map(|node| (node.id, Coord { x: node.lon, y: node.lat }))
            .collect();

        let mut lines = Vec::new();
        for way in &data.ways {
            let Some(name) = way.name() else {
                continue;
            };
            if way.nodes.len() < 2 {
                continue;
            }
            let coords = way
                .nodes
                .iter()
                .map(|id| {
                    nodes.get(id).copied().ok_or(Error::MissingNode {
                        way: way.id,
                        node: *id,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            lines.push((name.to_string(), LineString::new(coords)));
        }

        let clipped: Vec<(String, MultiLineString<f64>)> = lines
            .into_par_iter()
            .map(|(name, line)| (name, corridor.clip(&MultiLineString::new(vec![line]), false)))
            .collect();

        let mut by_name: BTreeMap<String, Vec<LineString<f64>>> = BTreeMap::new();
        for (name, pieces) in clipped {
            let pieces = pieces.0.into_iter().filter(|piece| piece.0.len() >= 2);
            by_name.entry(name).or_default().extend(pieces);
        }
        by_name.retain(|_, pieces| !pieces.is_empty());

        let index = Self::from_named(
            by_name
                .into_iter()
                .map(|(name, pieces)| (name, MultiLineString::new(pieces)))
                .collect(),
            buffer_distance,
        );
        tracing::info!("Loaded {} named roads and trails", index.len());
        Ok(index)
    }

    pub(crate) fn from_named(
        named: Vec<(String, MultiLineString<f64>)>,
        buffer_distance: f64,
    ) -> Self {
        let mut trails: Vec<NamedTrail> = named
            .into_iter()
            .map(|(name, geometry)| NamedTrail { name, geometry })
            .collect();
        trails.sort_by(|a, b| a.name.cmp(&b.name));

        let segments: Vec<TrailSegment> = trails
            .iter()
            .enumerate()
            .flat_map(|(trail, named)| {
                named.geometry.0.iter().flat_map(move |line| {
                    line.0.windows(2).map(move |pair| TrailSegment {
                        from: [pair[0].x, pair[0].y],
                        to: [pair[1].x, pair[1].y],
                        trail,
                    })
                })
            })
            .collect();

        Self {
            trails,
            tree: RTree::bulk_load(segments),
            buffer_distance,
        }
    }

    /// Name of the trail closest to the location
    ///
    /// Returns `None` unless some trail is strictly closer than twice the
    /// buffer distance.
    pub fn nearest_trail(&self, lat: f64, lon: f64) -> Option<&str> {
        let point = [lon, lat];
        let segment = self.tree.nearest_neighbor(&point)?;
        let limit = 2.0 * self.buffer_distance;
        (segment.distance_2(&point) < limit * limit)
            .then(|| self.trails[segment.trail].name.as_str())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.trails.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.trails.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.trails.iter().map(|trail| trail.name.as_str())
    }

    pub fn trails(&self) -> &[NamedTrail] {
        &self.trails
    }

    pub fn trail(&self, name: &str) -> Option<&NamedTrail> {
        self.trails
            .binary_search_by(|trail| trail.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.trails[i])
    }

    #[inline]
    pub fn buffer_distance(&self) -> f64 {
        self.buffer_distance
    }
}
