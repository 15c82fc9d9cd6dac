//! Extent records as read from the source, before trimming.

use geo_types::Geometry;
use serde_json::Value;
use std::collections::BTreeMap;

/// Fields every extent record must carry, in output order.
pub const CORE_FIELDS: [&str; 3] = ["id", "tier", "site"];

/// Tier label used when a record has no tier.
pub const UNKNOWN_TIER: &str = "Unknown_Tier";

/// One flood inundation map extent.
#[derive(Debug, Clone)]
pub struct ExtentRecord {
    /// Unique key
    pub id: String,

    /// Normalized tier label (e.g. "Tier_1")
    pub tier: String,

    /// Location label
    pub site: String,

    /// Footprint geometry as decoded from the source
    pub geometry: SourceGeometry,

    /// Remaining source columns, keyed by column name
    pub attributes: BTreeMap<String, Value>,
}

/// Geometry value as read from the source.
///
/// Decoding problems are kept rather than raised so they surface in the
/// validation pass together with the feature id.
#[derive(Debug, Clone)]
pub enum SourceGeometry {
    /// The source value was null or absent
    Null,
    /// Successfully decoded geometry
    Parsed(Geometry<f64>),
    /// The source value could not be decoded
    Malformed(String),
}

impl ExtentRecord {
    /// Look up a source attribute, treating JSON null as absent.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }
}

/// Normalize a tier label.
///
/// `tier 1`, `TIER-2` and `Tier_3` become `Tier_1`, `Tier_2`, `Tier_3`;
/// blank labels become [`UNKNOWN_TIER`]; anything else is kept trimmed.
pub fn normalize_tier(raw: Option<&str>) -> String {
    let s = match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => return UNKNOWN_TIER.to_string(),
    };

    let lower = s.to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix("tier") {
        let rest = rest.trim_start_matches(|c: char| c == '_' || c == '-' || c.is_whitespace());
        let mut chars = rest.chars();
        if let Some(digit) = chars.next().filter(char::is_ascii_digit) {
            // Only a single digit followed by a word boundary counts
            if chars.next().map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_') {
                return format!("Tier_{}", digit);
            }
        }
    }
    s.to_string()
}
