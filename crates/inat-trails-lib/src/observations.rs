//! Observations along the track, grouped by taxon
//!
//! Raw records are filtered by accuracy and by containment in the corridor,
//! matched to the nearest named trail, and grouped by taxon in alphabetical
//! order of scientific name.

use crate::model::{QualityGrade, RawObservation, TaxonRecord};
use crate::places::EstablishmentStatus;
use crate::trails::TrailIndex;
use geo::{Contains, MultiPolygon, Point};
use std::collections::{BTreeMap, HashMap};

/// Display data of one taxon
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonSummary {
    pub id: u64,
    /// Scientific name; infraspecific ranks carry their marker (`ssp.`, `var.`, `f.`)
    pub name: String,
    /// Common name in title case
    pub common_name: Option<String>,
    pub rank: String,
    pub iconic_taxon: Option<String>,
    pub photo_url: Option<String>,
}

impl TaxonSummary {
    pub fn from_record(record: &TaxonRecord) -> Self {
        Self {
            id: record.id,
            name: scientific_name(&record.name, &record.rank),
            common_name: record
                .preferred_common_name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .map(title_case),
            rank: record.rank.clone(),
            iconic_taxon: record.iconic_taxon_name.clone(),
            photo_url: record
                .default_photo
                .as_ref()
                .and_then(|photo| photo.square_url.clone()),
        }
    }

    /// `Scientific name (Common Name)`, or just the scientific name
    pub fn display_name(&self) -> String {
        match &self.common_name {
            Some(common) => format!("{} ({})", self.name, common),
            None => self.name.clone(),
        }
    }
}

fn scientific_name(name: &str, rank: &str) -> String {
    let marker = match rank {
        "subspecies" => "ssp.",
        "variety" => "var.",
        "form" => "f.",
        _ => return name.to_string(),
    };
    let parts: Vec<&str> = name.split_whitespace().collect();
    match parts.as_slice() {
        [genus, species, .., epithet] => format!("{genus} {species} {marker} {epithet}"),
        _ => name.to_string(),
    }
}

/// Upper-case the first letter of every word and hyphenated part; `and` stays lower case
fn title_case(name: &str) -> String {
    let mut titled = String::with_capacity(name.len());
    let mut boundary = true;
    for c in name.chars() {
        if boundary && !c.is_whitespace() {
            titled.extend(c.to_uppercase());
        } else {
            titled.push(c);
        }
        boundary = c == '-' || c.is_whitespace();
    }
    titled
        .split_whitespace()
        .map(|word| if word == "And" { "and" } else { word })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One observation inside the corridor
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub id: u64,
    pub lat: f64,
    pub lon: f64,
    /// Public accuracy radius in meters
    pub accuracy: Option<f64>,
    pub obscured: bool,
    pub observed_on: Option<String>,
    pub login: String,
    /// Real name of the observer, or the login
    pub observer: String,
    pub quality_grade: Option<QualityGrade>,
    /// Nearest named road or trail, if close enough
    pub trail: Option<String>,
}

impl Observation {
    pub fn url(&self) -> String {
        format!("https://www.inaturalist.org/observations/{}", self.id)
    }
}

/// All observations of one taxon
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonObservations {
    pub summary: TaxonSummary,
    /// Taxon record, replaced by the fully detailed one by [`ObservationSet::attach_taxa`]
    pub record: TaxonRecord,
    /// Family the taxon belongs to, once ancestors are known
    pub family: Option<TaxonSummary>,
    pub status: Option<EstablishmentStatus>,
    /// In ascending id order
    pub observations: Vec<Observation>,
}

/// Result of filtering raw observations against the corridor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationSet {
    /// In alphabetical order of scientific name
    pub taxa: Vec<TaxonObservations>,
    /// Skipped because the public accuracy exceeds the limit
    pub excluded_accuracy: usize,
    /// Skipped because the location is outside the corridor
    pub excluded_outside: usize,
    /// Skipped because location or taxon is missing
    pub excluded_unlocated: usize,
}

impl ObservationSet {
    pub fn observation_count(&self) -> usize {
        self.taxa.iter().map(|taxon| taxon.observations.len()).sum()
    }

    pub fn taxon_ids(&self) -> Vec<u64> {
        self.taxa.iter().map(|taxon| taxon.summary.id).collect()
    }

    /// Observation count per trail; `None` collects observations off any trail
    pub fn trail_counts(&self) -> BTreeMap<Option<&str>, usize> {
        let mut counts = BTreeMap::new();
        for observation in self.taxa.iter().flat_map(|taxon| &taxon.observations) {
            *counts.entry(observation.trail.as_deref()).or_insert(0) += 1;
        }
        counts
    }

    /// Replace embedded taxon records with the detailed ones and derive families
    pub fn attach_taxa(&mut self, taxa: &[TaxonRecord]) {
        let by_id: HashMap<u64, &TaxonRecord> = taxa.iter().map(|taxon| (taxon.id, taxon)).collect();
        for taxon in &mut self.taxa {
            let Some(record) = by_id.get(&taxon.summary.id) else {
                continue;
            };
            taxon.family = record
                .ancestors
                .iter()
                .find(|ancestor| ancestor.rank == "family")
                .map(TaxonSummary::from_record);
            taxon.record = (*record).clone();
        }
    }
}

/// Filter raw observations and group the survivors by taxon
///
/// A record is skipped when its public accuracy exceeds `accuracy_limit`
/// meters or when it lies outside `corridor`; records of unknown accuracy
/// are kept. Each kept observation is matched to the nearest trail.
pub fn collect_observations(
    raw: Vec<RawObservation>,
    corridor: &MultiPolygon<f64>,
    trails: &TrailIndex,
    accuracy_limit: f64,
) -> ObservationSet {
    #[cfg(feature = "profiling")]
    profiling::scope!("observations::collect");

    let mut set = ObservationSet::default();
    let mut by_taxon: HashMap<u64, TaxonObservations> = HashMap::new();

    for record in raw {
        let (Some((lat, lon)), Some(taxon)) = (record.coordinates(), record.taxon) else {
            set.excluded_unlocated += 1;
            continue;
        };
        if record
            .public_positional_accuracy
            .is_some_and(|accuracy| accuracy > accuracy_limit)
        {
            set.excluded_accuracy += 1;
            continue;
        }
        if !corridor.contains(&Point::new(lon, lat)) {
            set.excluded_outside += 1;
            continue;
        }

        let (login, observer) = match &record.user {
            Some(user) => (user.login.clone(), user.display_name().to_string()),
            None => (String::new(), String::new()),
        };
        let observation = Observation {
            id: record.id,
            lat,
            lon,
            accuracy: record.public_positional_accuracy,
            obscured: record.obscured,
            observed_on: record.observed_on,
            login,
            observer,
            quality_grade: record.quality_grade,
            trail: trails.nearest_trail(lat, lon).map(str::to_string),
        };

        by_taxon
            .entry(taxon.id)
            .or_insert_with(|| TaxonObservations {
                summary: TaxonSummary::from_record(&taxon),
                record: taxon,
                family: None,
                status: None,
                observations: Vec::new(),
            })
            .observations
            .push(observation);
    }

    if set.excluded_outside > 0 || set.excluded_accuracy > 0 {
        tracing::info!(
            "Excluded {} observations not along the route and {} with low accuracy",
            set.excluded_outside,
            set.excluded_accuracy
        );
    }

    set.taxa = by_taxon.into_values().collect();
    for taxon in &mut set.taxa {
        taxon.observations.sort_by_key(|observation| observation.id);
    }
    set.taxa.sort_by(|a, b| {
        a.summary
            .name
            .cmp(&b.summary.name)
            .then(a.summary.id.cmp(&b.summary.id))
    });
    set
}
