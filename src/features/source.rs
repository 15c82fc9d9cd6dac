//! Read extent records from GeoParquet or GeoJSON.

use crate::error::{PipelineError, Result};
use crate::features::record::{normalize_tier, ExtentRecord, SourceGeometry, CORE_FIELDS};
use crate::features::wkb;
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use geo_types::Geometry;
use geojson::GeoJson;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Map, Number, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Geometry column names tried when GeoParquet metadata is absent.
const GEOMETRY_COLUMNS: [&str; 3] = ["geometry", "geom", "wkb_geometry"];

/// Extent records plus the attribute columns the source offers.
#[derive(Debug, Clone)]
pub struct SourceTable {
    /// Source file
    pub path: PathBuf,

    /// Attribute column names (excluding geometry)
    pub columns: BTreeSet<String>,

    /// Records in source order
    pub records: Vec<ExtentRecord>,
}

impl SourceTable {
    /// Whether the source has an attribute column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }
}

/// Read an extent source, choosing the reader from the file extension.
pub fn read_source(path: &Path) -> Result<SourceTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "parquet" | "geoparquet" | "pq" => read_parquet(path),
        "geojson" | "json" => read_geojson(path),
        _ => Err(PipelineError::Source {
            path: path.to_path_buf(),
            message: "unrecognized extension; expected .parquet or .geojson".to_string(),
        }),
    }
}

fn source_err(path: &Path, message: impl std::fmt::Display) -> PipelineError {
    PipelineError::Source {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Fail with a schema error listing every missing core field.
fn require_core_columns(
    path: &Path,
    columns: &BTreeSet<String>,
    geometry: Option<&str>,
) -> Result<()> {
    let mut missing: Vec<&str> = CORE_FIELDS
        .iter()
        .copied()
        .filter(|f| !columns.contains(*f))
        .collect();
    if geometry.is_none() {
        missing.push("geometry");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Schema {
            path: path.to_path_buf(),
            message: format!("missing required field(s): {}", missing.join(", ")),
        })
    }
}

// ---------------------------------------------------------------------------
// GeoParquet
// ---------------------------------------------------------------------------

/// Read a GeoParquet file.
pub fn read_parquet(path: &Path) -> Result<SourceTable> {
    let file = std::fs::File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| source_err(path, e))?;

    let geo_meta = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == "geo"))
        .and_then(|kv| kv.value.as_deref())
        .and_then(|v| serde_json::from_str::<Value>(v).ok());

    let schema = builder.schema().clone();
    let field_names: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();

    let geometry_col = geo_meta
        .as_ref()
        .and_then(|m| m.get("primary_column"))
        .and_then(Value::as_str)
        .filter(|name| field_names.iter().any(|f| f == name))
        .map(str::to_string)
        .or_else(|| {
            GEOMETRY_COLUMNS
                .iter()
                .find(|name| field_names.iter().any(|f| f == *name))
                .map(|s| s.to_string())
        });

    if let (Some(meta), Some(col)) = (&geo_meta, &geometry_col) {
        warn_on_projected_crs(path, meta, col);
    }

    let columns: BTreeSet<String> = field_names
        .iter()
        .filter(|name| Some(*name) != geometry_col.as_ref())
        .cloned()
        .collect();
    require_core_columns(path, &columns, geometry_col.as_deref())?;
    let geometry_col = geometry_col.unwrap_or_default();

    let reader = builder.build().map_err(|e| source_err(path, e))?;

    let mut records = Vec::new();
    for batch_result in reader {
        let batch = batch_result.map_err(|e| source_err(path, e))?;
        extract_records_from_batch(path, &batch, &geometry_col, &mut records)?;
    }

    tracing::info!("Read {} extents from {}", records.len(), path.display());

    Ok(SourceTable {
        path: path.to_path_buf(),
        columns,
        records,
    })
}

/// Log a warning when GeoParquet metadata declares a non-geographic CRS.
///
/// Coordinates are passed to the tile builder unprojected, so anything other
/// than WGS84 / CRS84 will land in the wrong place.
fn warn_on_projected_crs(path: &Path, geo_meta: &Value, column: &str) {
    let Some(crs) = geo_meta.pointer(&format!("/columns/{}/crs", column)) else {
        return;
    };
    if crs.is_null() {
        return;
    }
    let code = crs.pointer("/id/code").map(|c| match c {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    match code.as_deref() {
        Some("4326") | Some("CRS84") => {}
        other => tracing::warn!(
            "{}: geometry CRS is {:?}, not WGS84; proceeding without reprojection",
            path.display(),
            other.unwrap_or("unknown")
        ),
    }
}

/// Append the records in one batch.
fn extract_records_from_batch(
    path: &Path,
    batch: &RecordBatch,
    geometry_col: &str,
    records: &mut Vec<ExtentRecord>,
) -> Result<()> {
    let schema = batch.schema();
    let geometry_idx = schema
        .index_of(geometry_col)
        .map_err(|e| source_err(path, e))?;
    let geometries = decode_geometry_column(path, batch.column(geometry_idx))?;

    let mut attribute_columns = Vec::with_capacity(batch.num_columns());
    for (idx, field) in schema.fields().iter().enumerate() {
        if idx == geometry_idx {
            continue;
        }
        let values = column_values(batch.column(idx)).map_err(|e| {
            source_err(path, format!("column '{}': {}", field.name(), e))
        })?;
        attribute_columns.push((field.name().clone(), values));
    }

    let row_offset = records.len();
    for (row, geometry) in geometries.into_iter().enumerate() {
        let mut props = Map::new();
        for (name, values) in attribute_columns.iter_mut() {
            props.insert(name.clone(), std::mem::take(&mut values[row]));
        }
        records.push(record_from_properties(path, row_offset + row, props, geometry)?);
    }
    Ok(())
}

/// Decode a WKB (binary) or WKT (string) geometry column.
fn decode_geometry_column(path: &Path, array: &ArrayRef) -> Result<Vec<SourceGeometry>> {
    let decode_wkb = |bytes: &[u8]| match wkb::decode_wkb(bytes) {
        Ok(g) => SourceGeometry::Parsed(g),
        Err(e) => SourceGeometry::Malformed(e),
    };

    let out: Vec<SourceGeometry> = match array.data_type() {
        DataType::Binary => {
            let arr = array.as_binary::<i32>();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { SourceGeometry::Null } else { decode_wkb(arr.value(i)) })
                .collect()
        }
        DataType::LargeBinary => {
            let arr = array.as_binary::<i64>();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { SourceGeometry::Null } else { decode_wkb(arr.value(i)) })
                .collect()
        }
        DataType::Utf8 => {
            let arr = array.as_string::<i32>();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { SourceGeometry::Null } else { parse_wkt(arr.value(i)) })
                .collect()
        }
        DataType::LargeUtf8 => {
            let arr = array.as_string::<i64>();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { SourceGeometry::Null } else { parse_wkt(arr.value(i)) })
                .collect()
        }
        other => {
            return Err(PipelineError::Schema {
                path: path.to_path_buf(),
                message: format!(
                    "geometry column must be WKB binary or WKT text, found {}",
                    other
                ),
            })
        }
    };
    Ok(out)
}

/// Parse a WKT string into a geometry.
fn parse_wkt(text: &str) -> SourceGeometry {
    let parsed = wkt::Wkt::<f64>::from_str(text)
        .map_err(|e| format!("WKT parse error: {}", e))
        .and_then(|w| {
            Geometry::<f64>::try_from(w)
                .map_err(|e: wkt::conversion::Error| format!("WKT conversion error: {:?}", e))
        });
    match parsed {
        Ok(g) => SourceGeometry::Parsed(g),
        Err(e) => SourceGeometry::Malformed(e),
    }
}

/// Convert an Arrow column into JSON values (null for null slots).
fn column_values(array: &ArrayRef) -> std::result::Result<Vec<Value>, ArrowError> {
    macro_rules! ints {
        ($t:ty) => {{
            let arr = array.as_primitive::<$t>();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { Value::Null } else { Value::from(arr.value(i)) })
                .collect()
        }};
    }
    macro_rules! floats {
        ($t:ty) => {{
            let arr = array.as_primitive::<$t>();
            (0..arr.len())
                .map(|i| {
                    if arr.is_null(i) {
                        Value::Null
                    } else {
                        Number::from_f64(arr.value(i) as f64).map_or(Value::Null, Value::Number)
                    }
                })
                .collect()
        }};
    }

    let values: Vec<Value> = match array.data_type() {
        DataType::Utf8 => {
            let arr = array.as_string::<i32>();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { Value::Null } else { Value::from(arr.value(i)) })
                .collect()
        }
        DataType::LargeUtf8 => {
            let arr = array.as_string::<i64>();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { Value::Null } else { Value::from(arr.value(i)) })
                .collect()
        }
        DataType::Boolean => {
            let arr = array.as_boolean();
            (0..arr.len())
                .map(|i| if arr.is_null(i) { Value::Null } else { Value::from(arr.value(i)) })
                .collect()
        }
        DataType::Int8 => ints!(Int8Type),
        DataType::Int16 => ints!(Int16Type),
        DataType::Int32 => ints!(Int32Type),
        DataType::Int64 => ints!(Int64Type),
        DataType::UInt8 => ints!(UInt8Type),
        DataType::UInt16 => ints!(UInt16Type),
        DataType::UInt32 => ints!(UInt32Type),
        DataType::UInt64 => ints!(UInt64Type),
        DataType::Float32 => floats!(Float32Type),
        DataType::Float64 => floats!(Float64Type),
        _ => {
            let mut out = Vec::with_capacity(array.len());
            for i in 0..array.len() {
                if array.is_null(i) {
                    out.push(Value::Null);
                } else {
                    out.push(Value::from(arrow::util::display::array_value_to_string(
                        array, i,
                    )?));
                }
            }
            out
        }
    };
    Ok(values)
}

// ---------------------------------------------------------------------------
// GeoJSON
// ---------------------------------------------------------------------------

/// Read a GeoJSON FeatureCollection (or single Feature).
pub fn read_geojson(path: &Path) -> Result<SourceTable> {
    let text = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    let features = match GeoJson::from_str(&text).map_err(|e| source_err(path, e))? {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(_) => {
            return Err(PipelineError::Schema {
                path: path.to_path_buf(),
                message: "expected a FeatureCollection, found a bare geometry".to_string(),
            })
        }
    };

    let mut columns = BTreeSet::new();
    for feature in &features {
        if feature.id.is_some() {
            columns.insert("id".to_string());
        }
        if let Some(props) = &feature.properties {
            columns.extend(props.keys().cloned());
        }
    }
    require_core_columns(path, &columns, Some("geometry"))?;

    let mut records = Vec::with_capacity(features.len());
    for (row, feature) in features.into_iter().enumerate() {
        let mut props = feature.properties.unwrap_or_default();
        if !matches!(props.get("id"), Some(v) if !v.is_null()) {
            match feature.id {
                Some(geojson::feature::Id::String(s)) => {
                    props.insert("id".to_string(), Value::String(s));
                }
                Some(geojson::feature::Id::Number(n)) => {
                    props.insert("id".to_string(), Value::Number(n));
                }
                None => {}
            }
        }

        let geometry = match feature.geometry {
            None => SourceGeometry::Null,
            Some(g) => match Geometry::<f64>::try_from(g) {
                Ok(g) => SourceGeometry::Parsed(g),
                Err(e) => SourceGeometry::Malformed(e.to_string()),
            },
        };
        records.push(record_from_properties(path, row, props, geometry)?);
    }

    tracing::info!("Read {} extents from {}", records.len(), path.display());

    Ok(SourceTable {
        path: path.to_path_buf(),
        columns,
        records,
    })
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// Split a property row into core fields and remaining attributes.
fn record_from_properties(
    path: &Path,
    row: usize,
    mut props: Map<String, Value>,
    geometry: SourceGeometry,
) -> Result<ExtentRecord> {
    let id = match props.remove("id") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(PipelineError::Schema {
                path: path.to_path_buf(),
                message: format!("row {} has a null or empty 'id'", row),
            })
        }
    };

    let tier = match props.remove("tier") {
        Some(Value::String(s)) => normalize_tier(Some(&s)),
        Some(Value::Null) | None => normalize_tier(None),
        Some(other) => normalize_tier(Some(&other.to_string())),
    };

    let site = match props.remove("site") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => id.clone(),
    };

    Ok(ExtentRecord {
        id,
        tier,
        site,
        geometry,
        attributes: props.into_iter().collect(),
    })
}
