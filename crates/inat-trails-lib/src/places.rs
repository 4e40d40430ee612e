//! Places overlapping the corridor and the status of taxa within them

use crate::model::{PlaceRecord, PlacesNearby, TaxonRecord};
use geo::{Area, BooleanOps, Intersects, MultiPolygon};
use std::collections::HashSet;

/// Name used when no place covers most of the corridor
pub const UNKNOWN_PLACE: &str = "Unknown Place";

/// Share of the corridor a place must cover to name the hike
const PLACE_COVERAGE: f64 = 0.5;

/// Status of a taxon within a place, e.g. `native`, `introduced` or a conservation status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishmentStatus {
    pub status: String,
    /// Place the status was recorded for; may be an ancestor of a nearby place
    pub place_id: u64,
}

/// Nearby places whose geometry intersects the corridor, smallest first
///
/// Standard places come before community places; duplicates are dropped.
/// Places without a known bounding box area sort last.
pub fn places_along(nearby: PlacesNearby, corridor: &MultiPolygon<f64>) -> Vec<PlaceRecord> {
    #[cfg(feature = "profiling")]
    profiling::scope!("places::along");

    let mut seen = HashSet::new();
    let mut places: Vec<PlaceRecord> = nearby
        .standard
        .into_iter()
        .chain(nearby.community)
        .filter(|place| {
            place
                .geometry()
                .is_some_and(|geometry| geometry.intersects(corridor))
        })
        .filter(|place| seen.insert(place.id))
        .collect();

    places.sort_by(|a, b| match (a.bbox_area, b.bbox_area) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    tracing::debug!("{} places along the track", places.len());
    places
}

/// Name of the smallest place covering more than half of the corridor
pub fn guess_place_name(places: &[PlaceRecord], corridor: &MultiPolygon<f64>) -> String {
    let corridor_area = corridor.unsigned_area();
    places
        .iter()
        .find(|place| {
            place.geometry().is_some_and(|geometry| {
                geometry.intersection(corridor).unsigned_area() > PLACE_COVERAGE * corridor_area
            })
        })
        .map(|place| {
            if place.name.is_empty() {
                place.label().to_string()
            } else {
                place.name.clone()
            }
        })
        .unwrap_or_else(|| UNKNOWN_PLACE.to_string())
}

/// Status of `taxon` in the first of `places` that has one
///
/// For each place in order, conservation statuses are consulted before
/// listed taxa. A record matches a place when it was made for the place
/// itself or for one of its ancestors.
pub fn establishment_status(
    taxon: &TaxonRecord,
    places: &[PlaceRecord],
) -> Option<EstablishmentStatus> {
    for place in places {
        let covers = |place_id: u64| place_id == place.id || place.ancestor_place_ids.contains(&place_id);

        let conservation = taxon.conservation_statuses.iter().find_map(|status| {
            let place_id = status.place?.id;
            covers(place_id).then(|| EstablishmentStatus {
                status: status.status.clone().unwrap_or_default(),
                place_id,
            })
        });
        if conservation.is_some() {
            return conservation;
        }

        let listed = taxon.listed_taxa.iter().find_map(|listed| {
            let place_id = listed.place?.id;
            covers(place_id).then(|| EstablishmentStatus {
                status: listed.establishment_means.clone().unwrap_or_default(),
                place_id,
            })
        });
        if listed.is_some() {
            return listed;
        }
    }
    None
}
