//! Cache keys derived from query parameters

use crate::config::CacheConfig;
use crate::model::ObservationQuery;
use crate::utils::{BoundingBox, PLACES_PRECISION, TRAILS_PRECISION};
use std::fmt;
use std::time::Duration;

/// Suffix of every stored entry
pub(crate) const ENTRY_SUFFIX: &str = ".json.gz";

/// Id lists longer than this are hashed instead of spelled out in the file name
const MAX_INLINE_IDS: usize = 100;

/// Resource kind of a cache entry; determines the file prefix and the TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Observations,
    Places,
    Taxa,
    Trails,
}

impl CacheKind {
    pub const ALL: [CacheKind; 4] = [
        Self::Observations,
        Self::Places,
        Self::Taxa,
        Self::Trails,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Observations => "observations",
            Self::Places => "places",
            Self::Taxa => "taxa",
            Self::Trails => "trails",
        }
    }

    pub fn ttl(&self, config: &CacheConfig) -> Duration {
        match self {
            Self::Observations => config.observations_ttl,
            Self::Places => config.places_ttl,
            Self::Taxa => config.taxa_ttl,
            Self::Trails => config.trails_ttl,
        }
    }

    /// Recover the kind of a stored entry from its file name
    ///
    /// Returns `None` for files that are not cache entries of a known kind.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(ENTRY_SUFFIX)?;
        Self::ALL.into_iter().find(|kind| {
            stem == kind.prefix()
                || stem
                    .strip_prefix(kind.prefix())
                    .is_some_and(|rest| rest.starts_with('_'))
        })
    }
}

/// Deterministic name of one cached payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: CacheKind,
    name: String,
}

impl CacheKey {
    /// Named roads and trails within `bbox`, quantized to two decimals
    pub fn trails(bbox: &BoundingBox) -> Self {
        let bbox = bbox.quantize(TRAILS_PRECISION);
        Self::new(CacheKind::Trails, format!("trails_{}", bbox.key_fragment(2)))
    }

    /// Observations matching `query`, with its bbox quantized to two decimals
    pub fn observations(query: &ObservationQuery) -> Self {
        let iconic = query.iconic_taxon.as_deref().unwrap_or("all");
        let months = if query.months.is_empty() {
            "all".to_string()
        } else {
            query
                .months
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join("-")
        };
        let grade = query.quality_grade.map_or("all", |grade| grade.as_str());
        Self::new(
            CacheKind::Observations,
            format!(
                "observations_{}_{}_{}_{}",
                iconic,
                query.quantized_bbox().key_fragment(2),
                months,
                grade
            ),
        )
    }

    /// Places near `bbox`, quantized to three decimals
    pub fn places_nearby(bbox: &BoundingBox) -> Self {
        let bbox = bbox.quantize(PLACES_PRECISION);
        Self::new(
            CacheKind::Places,
            format!("places_nearby_{}", bbox.key_fragment(3)),
        )
    }

    /// Places looked up by id; the order of `ids` does not matter
    pub fn places_by_ids(ids: &[u64]) -> Self {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let joined = ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join("-");
        let fragment = if joined.len() > MAX_INLINE_IDS {
            format!("h{:016x}", fnv1a(joined.as_bytes()))
        } else {
            joined
        };
        Self::new(CacheKind::Places, format!("places_ids_{fragment}"))
    }

    /// The single entry mapping taxon ids to taxon records
    pub fn taxa() -> Self {
        Self::new(CacheKind::Taxa, "taxa".to_string())
    }

    fn new(kind: CacheKind, name: String) -> Self {
        Self { kind, name }
    }

    #[inline]
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, ENTRY_SUFFIX)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// 64-bit FNV-1a, stable across platforms and releases
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
