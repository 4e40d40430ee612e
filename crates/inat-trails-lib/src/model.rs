//! Typed records decoded from iNaturalist and Overpass responses
//!
//! Every provider payload is decoded into these structs at the retrieval
//! boundary. They also double as the on-disk cache representation.

use crate::utils::{BoundingBox, TRAILS_PRECISION, join_comma};
use geo::{LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt;

/// The thirteen iconic taxa iNaturalist groups observations into
pub const ICONIC_TAXA: [&str; 13] = [
    "Actinopterygii",
    "Amphibia",
    "Animalia",
    "Arachnida",
    "Aves",
    "Chromista",
    "Fungi",
    "Insecta",
    "Mammalia",
    "Mollusca",
    "Plantae",
    "Protozoa",
    "Reptilia",
];

/// Observations with an unknown accuracy or one below this many meters are requested
const ACCURACY_BELOW_OR_UNKNOWN: u32 = 25;

/// Field selector for taxa in API v2 responses
const FIELDS_TAXON: &str = "id:!t,name:!t,rank:!t,preferred_common_name:!t,\
default_photo:(square_url:!t),iconic_taxon_name:!t";

/// Additional taxon fields carrying establishment and conservation status
const FIELDS_STATUS: &str = "listed_taxa:(taxon_id:!t,place:(id:!t),establishment_means:!t),\
conservation_statuses:(taxon_id:!t,place:(id:!t),status:!t)";

/// Field selector for taxa looked up by id, including status and ancestors
pub(crate) fn taxon_fields() -> String {
    format!("({FIELDS_TAXON},{FIELDS_STATUS},ancestors:({FIELDS_TAXON}))")
}

/// Field selector for observations
pub(crate) fn observation_fields() -> String {
    format!(
        "(id:!t,user:(login:!t,name:!t),location:!t,obscured:!t,\
public_positional_accuracy:!t,observed_on:!t,quality_grade:!t,\
taxon:({FIELDS_TAXON},{FIELDS_STATUS}))"
    )
}

/// Accept `null` wherever a collection or flag is expected
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode a list of JSON values, skipping the items that do not match `T`
pub(crate) fn decode_items<T: DeserializeOwned>(
    resource: &str,
    items: Vec<serde_json::Value>,
) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping undecodable record from {}: {}", resource, e);
                None
            }
        })
        .collect()
}

// ============================================================================
// Observations
// ============================================================================

/// iNaturalist quality grade of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGrade {
    Casual,
    NeedsId,
    Research,
}

impl QualityGrade {
    pub const ALL: [QualityGrade; 3] = [Self::Casual, Self::NeedsId, Self::Research];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Casual => "casual",
            Self::NeedsId => "needs_id",
            Self::Research => "research",
        }
    }
}

impl fmt::Display for QualityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl UserRecord {
    /// Real name when set, the login otherwise
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.login,
        }
    }
}

/// Observation as returned by `GET /v2/observations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub id: u64,
    #[serde(default)]
    pub user: Option<UserRecord>,
    /// `"lat,lon"`
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub obscured: bool,
    /// Public accuracy radius in meters
    #[serde(default)]
    pub public_positional_accuracy: Option<f64>,
    #[serde(default)]
    pub observed_on: Option<String>,
    #[serde(default)]
    pub quality_grade: Option<QualityGrade>,
    #[serde(default)]
    pub taxon: Option<TaxonRecord>,
}

impl RawObservation {
    /// Parse the location string into `(lat, lon)`
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let (lat, lon) = self.location.as_deref()?.split_once(',')?;
        let lat = lat.trim().parse::<f64>().ok()?;
        let lon = lon.trim().parse::<f64>().ok()?;
        (lat.is_finite() && lon.is_finite()).then_some((lat, lon))
    }
}

/// Parameters of one observation query, everything the cache key depends on
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationQuery {
    pub bbox: BoundingBox,
    /// One of [`ICONIC_TAXA`]; `None` for all
    pub iconic_taxon: Option<String>,
    /// `None` for all grades
    pub quality_grade: Option<QualityGrade>,
    /// 1-based months; empty for the whole year
    pub months: Vec<u32>,
}

impl ObservationQuery {
    /// All observations within `bbox`, any taxon, grade and month
    pub fn new(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            iconic_taxon: None,
            quality_grade: None,
            months: Vec::new(),
        }
    }

    pub fn with_iconic_taxon(mut self, iconic_taxon: impl Into<String>) -> Self {
        self.iconic_taxon = Some(iconic_taxon.into());
        self
    }

    pub fn with_quality_grade(mut self, quality_grade: QualityGrade) -> Self {
        self.quality_grade = Some(quality_grade);
        self
    }

    pub fn with_months(mut self, months: Vec<u32>) -> Self {
        self.months = months;
        self
    }

    /// Bounding box actually requested, rounded outward to the cache grid
    pub fn quantized_bbox(&self) -> BoundingBox {
        self.bbox.quantize(TRAILS_PRECISION)
    }

    /// Query string of `GET /v2/observations`, without paging parameters
    pub fn params(&self) -> Vec<(String, String)> {
        let bbox = self.quantized_bbox();
        let grades = match self.quality_grade {
            Some(grade) => grade.as_str().to_string(),
            None => join_comma(&QualityGrade::ALL.map(|g| g.as_str())),
        };
        let iconic = match &self.iconic_taxon {
            Some(taxon) => taxon.clone(),
            None => ICONIC_TAXA.join(","),
        };

        let mut params = vec![
            ("captive".to_string(), "false".to_string()),
            ("identified".to_string(), "true".to_string()),
            ("geoprivacy".to_string(), "open".to_string()),
            (
                "acc_below_or_unknown".to_string(),
                ACCURACY_BELOW_OR_UNKNOWN.to_string(),
            ),
            ("hrank".to_string(), "species".to_string()),
            ("iconic_taxa".to_string(), iconic),
            ("quality_grade".to_string(), grades),
            ("nelat".to_string(), bbox.max_lat.to_string()),
            ("nelng".to_string(), bbox.max_lon.to_string()),
            ("swlat".to_string(), bbox.min_lat.to_string()),
            ("swlng".to_string(), bbox.min_lon.to_string()),
            ("fields".to_string(), observation_fields()),
        ];
        if !self.months.is_empty() {
            params.push(("month".to_string(), join_comma(&self.months)));
        }
        params
    }
}

// ============================================================================
// Taxa
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    #[serde(default)]
    pub square_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceRef {
    pub id: u64,
}

/// Establishment means of a taxon within one place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedTaxon {
    #[serde(default)]
    pub taxon_id: Option<u64>,
    #[serde(default)]
    pub place: Option<PlaceRef>,
    #[serde(default)]
    pub establishment_means: Option<String>,
}

/// Conservation status of a taxon within one place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConservationStatus {
    #[serde(default)]
    pub taxon_id: Option<u64>,
    #[serde(default)]
    pub place: Option<PlaceRef>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Taxon as returned by `GET /v2/taxa/{ids}` or embedded in an observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonRecord {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub rank: String,
    #[serde(default)]
    pub preferred_common_name: Option<String>,
    #[serde(default)]
    pub default_photo: Option<PhotoRecord>,
    #[serde(default)]
    pub iconic_taxon_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub listed_taxa: Vec<ListedTaxon>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub conservation_statuses: Vec<ConservationStatus>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ancestors: Vec<TaxonRecord>,
}

// ============================================================================
// Places
// ============================================================================

/// GeoJSON geometry of a place; only areal types are retained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlaceGeometry {
    Polygon {
        coordinates: Vec<Vec<[f64; 2]>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<[f64; 2]>>>,
    },
    #[serde(other)]
    Unsupported,
}

impl PlaceGeometry {
    /// Convert to a `geo` multi-polygon; `None` for unsupported or empty geometry
    pub fn to_multi_polygon(&self) -> Option<MultiPolygon<f64>> {
        let polygons: Vec<Polygon<f64>> = match self {
            Self::Polygon { coordinates } => rings_to_polygon(coordinates).into_iter().collect(),
            Self::MultiPolygon { coordinates } => coordinates
                .iter()
                .filter_map(|rings| rings_to_polygon(rings))
                .collect(),
            Self::Unsupported => Vec::new(),
        };
        (!polygons.is_empty()).then(|| MultiPolygon::new(polygons))
    }
}

fn rings_to_polygon(rings: &[Vec<[f64; 2]>]) -> Option<Polygon<f64>> {
    let mut rings = rings
        .iter()
        .map(|ring| LineString::from(ring.iter().map(|&[x, y]| (x, y)).collect::<Vec<_>>()));
    let exterior = rings.next()?;
    Some(Polygon::new(exterior, rings.collect()))
}

/// Place as returned by `GET /v1/places/nearby` or `GET /v1/places/{ids}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bbox_area: Option<f64>,
    #[serde(default)]
    pub geometry_geojson: Option<PlaceGeometry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ancestor_place_ids: Vec<u64>,
}

impl PlaceRecord {
    /// Display name when available, the short name otherwise
    pub fn label(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }

    pub fn geometry(&self) -> Option<MultiPolygon<f64>> {
        self.geometry_geojson.as_ref()?.to_multi_polygon()
    }
}

/// Result object of `GET /v1/places/nearby`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacesNearby {
    #[serde(default, deserialize_with = "null_as_default")]
    pub standard: Vec<PlaceRecord>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub community: Vec<PlaceRecord>,
}

impl PlacesNearby {
    pub fn iter(&self) -> impl Iterator<Item = &PlaceRecord> {
        self.standard.iter().chain(self.community.iter())
    }

    pub fn len(&self) -> usize {
        self.standard.len() + self.community.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// OpenStreetMap
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWay {
    pub id: i64,
    #[serde(default)]
    pub nodes: Vec<i64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RawWay {
    /// Value of the `name` tag, if present and not blank
    pub fn name(&self) -> Option<&str> {
        self.tags
            .get("name")
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OsmElement {
    Node(RawNode),
    Way(RawWay),
    #[serde(other)]
    Other,
}

/// Nodes and ways of one Overpass answer; this is what gets cached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsmData {
    pub nodes: Vec<RawNode>,
    pub ways: Vec<RawWay>,
}

impl OsmData {
    /// Split the `elements` array of an Overpass answer into nodes and ways
    ///
    /// Returns `None` when the answer carries no `elements` array.
    pub fn from_overpass(value: &serde_json::Value) -> Option<Self> {
        let elements = value.get("elements")?.as_array()?;
        let mut data = Self::default();
        for element in elements {
            match OsmElement::deserialize(element) {
                Ok(OsmElement::Node(node)) => data.nodes.push(node),
                Ok(OsmElement::Way(way)) => data.ways.push(way),
                Ok(OsmElement::Other) => {}
                Err(e) => tracing::warn!("Skipping malformed OSM element: {}", e),
            }
        }
        Some(data)
    }
}

/// Outcome of a way query
#[derive(Debug, Clone, PartialEq)]
pub enum OverpassResponse {
    Elements(OsmData),
    /// The interpreter answered with something other than an `elements` document
    Unparsed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_observation_decoding() {
        let raw: RawObservation = serde_json::from_value(json!({
            "id": 12,
            "user": {"login": "hiker", "name": null},
            "location": "37.5,-122.25",
            "obscured": null,
            "public_positional_accuracy": 4,
            "observed_on": "2024-05-01",
            "quality_grade": "needs_id",
            "taxon": {"id": 3, "name": "Quercus agrifolia", "rank": "species",
                      "listed_taxa": null, "ancestors": []}
        }))
        .unwrap();

        assert_eq!(raw.coordinates(), Some((37.5, -122.25)));
        assert_eq!(raw.quality_grade, Some(QualityGrade::NeedsId));
        assert!(!raw.obscured);
        assert_eq!(raw.user.as_ref().unwrap().display_name(), "hiker");
        assert!(raw.taxon.unwrap().listed_taxa.is_empty());
    }

    #[test]
    fn test_observation_without_location() {
        let raw: RawObservation = serde_json::from_value(json!({"id": 1})).unwrap();
        assert_eq!(raw.coordinates(), None);

        let raw: RawObservation =
            serde_json::from_value(json!({"id": 1, "location": "nonsense"})).unwrap();
        assert_eq!(raw.coordinates(), None);
    }

    #[test]
    fn test_observation_params() {
        let bbox = BoundingBox::new(-122.5, 37.0, -122.0, 37.5);
        let query = ObservationQuery::new(bbox)
            .with_iconic_taxon("Aves")
            .with_months(vec![6, 7, 5]);
        let params = query.params();
        let get = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("iconic_taxa"), Some("Aves"));
        assert_eq!(get("quality_grade"), Some("casual,needs_id,research"));
        assert_eq!(get("month"), Some("6,7,5"));
        assert_eq!(get("nelat"), Some("37.5"));
        assert_eq!(get("swlng"), Some("-122.5"));
        assert_eq!(get("acc_below_or_unknown"), Some("25"));
        assert!(get("fields").unwrap().contains("conservation_statuses"));
    }

    #[test]
    fn test_all_months_omit_month_param() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let params = ObservationQuery::new(bbox).params();
        assert!(params.iter().all(|(k, _)| k != "month"));
    }

    #[test]
    fn test_place_geometry_polygon() {
        let place: PlaceRecord = serde_json::from_value(json!({
            "id": 5,
            "name": "Park",
            "display_name": "Park, CA, US",
            "bbox_area": 0.5,
            "geometry_geojson": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
            },
            "ancestor_place_ids": [1, 2, 5]
        }))
        .unwrap();

        assert_eq!(place.label(), "Park, CA, US");
        let geometry = place.geometry().unwrap();
        assert_eq!(geometry.0.len(), 1);
    }

    #[test]
    fn test_place_geometry_unsupported() {
        let place: PlaceRecord = serde_json::from_value(json!({
            "id": 5,
            "name": "Spot",
            "geometry_geojson": {"type": "Point", "coordinates": [0.0, 0.0]}
        }))
        .unwrap();

        assert_eq!(place.geometry_geojson, Some(PlaceGeometry::Unsupported));
        assert!(place.geometry().is_none());
        assert_eq!(place.label(), "Spot");
    }

    #[test]
    fn test_osm_elements_split() {
        let value = json!({
            "elements": [
                {"type": "node", "id": 1, "lat": 1.0, "lon": 2.0},
                {"type": "way", "id": 10, "nodes": [1, 2], "tags": {"name": "Ridge Trail"}},
                {"type": "relation", "id": 99, "members": []}
            ]
        });
        let data = OsmData::from_overpass(&value).unwrap();

        assert_eq!(data.nodes.len(), 1);
        assert_eq!(data.ways.len(), 1);
        assert_eq!(data.ways[0].name(), Some("Ridge Trail"));
        assert!(OsmData::from_overpass(&json!({"remark": "timeout"})).is_none());
    }

    #[test]
    fn test_decode_items_skips_bad_records() {
        let items = vec![json!({"id": 1, "login": "x"}), json!({"name": "no id"})];
        let places: Vec<PlaceRef> = decode_items("test", items);
        assert_eq!(places, vec![PlaceRef { id: 1 }]);
    }
}
