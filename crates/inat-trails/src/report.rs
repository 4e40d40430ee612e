//! Waypoint file and summary of the observations along the track

use anyhow::Context;
use geo::Point;
use gpx::{Gpx, GpxVersion, Link, Waypoint};
use inat_trails_lib::{Observation, ObservationSet, TaxonObservations, Track};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Names of places that statuses refer to, by place id
pub type PlaceNames = HashMap<u64, String>;

fn status_label(taxon: &TaxonObservations, place_names: &PlaceNames) -> Option<String> {
    let status = taxon.status.as_ref()?;
    if status.status.is_empty() {
        return None;
    }
    Some(match place_names.get(&status.place_id) {
        Some(place) => format!("{} in {}", status.status, place),
        None => status.status.clone(),
    })
}

fn description(
    observation: &Observation,
    status: Option<&str>,
    login_names: bool,
) -> String {
    let mut lines = Vec::new();
    if let Some(trail) = &observation.trail {
        lines.push(format!("Trail: {trail}"));
    }
    let observer = if login_names {
        &observation.login
    } else {
        &observation.observer
    };
    if !observer.is_empty() {
        lines.push(format!("Observer: {observer}"));
    }
    if let Some(date) = &observation.observed_on {
        lines.push(format!("Date: {date}"));
    }
    if let Some(grade) = observation.quality_grade {
        lines.push(format!("Quality grade: {grade}"));
    }
    if let Some(status) = status {
        lines.push(format!("Status: {status}"));
    }
    lines.join("\n")
}

/// One waypoint per observation, in taxon order
pub fn waypoints(set: &ObservationSet, place_names: &PlaceNames, login_names: bool) -> Vec<Waypoint> {
    let mut waypoints = Vec::with_capacity(set.observation_count());
    for taxon in &set.taxa {
        let name = taxon.summary.display_name();
        let status = status_label(taxon, place_names);
        for observation in &taxon.observations {
            let mut waypoint = Waypoint::new(Point::new(observation.lon, observation.lat));
            waypoint.name = Some(name.clone());
            waypoint.description = Some(description(observation, status.as_deref(), login_names));
            waypoint.links.push(Link {
                href: observation.url(),
                ..Default::default()
            });
            waypoints.push(waypoint);
        }
    }
    waypoints
}

/// Write the waypoints as a GPX 1.1 file
pub fn write_waypoints(
    path: &Path,
    set: &ObservationSet,
    place_names: &PlaceNames,
    login_names: bool,
) -> anyhow::Result<usize> {
    let gpx = Gpx {
        version: GpxVersion::Gpx11,
        creator: Some(format!("inat-trails {}", env!("CARGO_PKG_VERSION"))),
        waypoints: waypoints(set, place_names, login_names),
        ..Default::default()
    };

    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    gpx::write(&gpx, std::io::BufWriter::new(file))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(gpx.waypoints.len())
}

/// Log the hike, the observed taxa grouped by iconic taxon and family, and the trails
pub fn log_summary(place: &str, track: &Track, set: &ObservationSet, place_names: &PlaceNames) {
    tracing::info!(
        "{}: {:.1} km, {} observations of {} taxa",
        place,
        track.total_distance() / 1000.0,
        set.observation_count(),
        set.taxa.len()
    );

    let mut groups: BTreeMap<&str, BTreeMap<String, Vec<&TaxonObservations>>> = BTreeMap::new();
    for taxon in &set.taxa {
        let iconic = taxon.summary.iconic_taxon.as_deref().unwrap_or("Other");
        let family = taxon
            .family
            .as_ref()
            .map(|family| family.display_name())
            .unwrap_or_else(|| "Unknown family".to_string());
        groups
            .entry(iconic)
            .or_default()
            .entry(family)
            .or_default()
            .push(taxon);
    }

    for (iconic, families) in &groups {
        tracing::info!("{}", iconic);
        for (family, taxa) in families {
            tracing::info!("  {}", family);
            for taxon in taxa {
                match status_label(taxon, place_names) {
                    Some(status) => tracing::info!(
                        "    {} [{}]: {}",
                        taxon.summary.display_name(),
                        status,
                        taxon.observations.len()
                    ),
                    None => tracing::info!(
                        "    {}: {}",
                        taxon.summary.display_name(),
                        taxon.observations.len()
                    ),
                }
            }
        }
    }

    for (trail, count) in set.trail_counts() {
        tracing::info!("{}: {} observations", trail.unwrap_or("Off trail"), count);
    }
}
