//! Shared fixtures for loader and pipeline tests.

use crate::features::wkb::tests::polygon_wkb;
use arrow::array::{ArrayRef, BinaryArray, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::path::Path;
use std::sync::Arc;

const GEO_METADATA: &str = r#"{"version": "1.0.0", "primary_column": "geometry", "columns": {"geometry": {"encoding": "WKB", "geometry_types": ["Polygon", "MultiPolygon"]}}}"#;

/// One row of the fixture extent table.
pub(crate) struct FixtureRow {
    pub id: String,
    pub tier: String,
    pub site: String,
    pub geometry: Option<Vec<u8>>,
}

impl FixtureRow {
    pub fn new(id: &str, tier: &str, site: &str) -> Self {
        Self {
            id: id.to_string(),
            tier: tier.to_string(),
            site: site.to_string(),
            geometry: None,
        }
    }

    pub fn with_geometry(mut self, wkb: Vec<u8>) -> Self {
        self.geometry = Some(wkb);
        self
    }
}

/// Unit square shifted by `offset` along both axes, as WKB.
pub(crate) fn square_wkb(offset: f64) -> Vec<u8> {
    let o = offset;
    polygon_wkb(&[&[(o, o), (o + 1.0, o), (o + 1.0, o + 1.0), (o, o + 1.0), (o, o)]])
}

/// Self-intersecting "bowtie" polygon, as WKB.
pub(crate) fn bowtie_wkb() -> Vec<u8> {
    polygon_wkb(&[&[(0.0, 0.0), (1.0, 1.0), (1.0, 0.0), (0.0, 1.0), (0.0, 0.0)]])
}

/// Write a GeoParquet file with `id`, `tier`, `site`, `state` and `geometry`.
pub(crate) fn write_extents_parquet(path: &Path, rows: &[FixtureRow]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("tier", DataType::Utf8, true),
        Field::new("site", DataType::Utf8, true),
        Field::new("state", DataType::Utf8, true),
        Field::new("geometry", DataType::Binary, true),
    ]));

    let ids: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
    ));
    let tiers: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|r| r.tier.as_str()).collect::<Vec<_>>(),
    ));
    let sites: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|r| r.site.as_str()).collect::<Vec<_>>(),
    ));
    let states: ArrayRef = Arc::new(StringArray::from(vec!["TX"; rows.len()]));
    let geoms: ArrayRef = Arc::new(BinaryArray::from(
        rows.iter()
            .map(|r| r.geometry.as_deref())
            .collect::<Vec<Option<&[u8]>>>(),
    ));

    let batch = RecordBatch::try_new(schema.clone(), vec![ids, tiers, sites, states, geoms]).unwrap();

    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(vec![KeyValue::new(
            "geo".to_string(),
            GEO_METADATA.to_string(),
        )]))
        .build();

    let file = std::fs::File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props)).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}
