//! Feature loading: read extents, join the catalog, trim and validate.

mod catalog;
mod loader;
mod record;
mod source;
mod wkb;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use catalog::{Catalog, CatalogEntry};
pub use loader::{
    load_features, minimize, resolve_fields, LoadOptions, MinimizedFeature, MinimizedFeatureSet,
};
pub use record::{normalize_tier, ExtentRecord, SourceGeometry, CORE_FIELDS, UNKNOWN_TIER};
pub use source::{read_geojson, read_parquet, read_source, SourceTable};
pub use wkb::decode_wkb;
