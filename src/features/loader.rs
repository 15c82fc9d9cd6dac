//! Join, trim and validate extents into the minimized feature set.

use crate::error::{PipelineError, Result};
use crate::features::catalog::Catalog;
use crate::features::record::{SourceGeometry, CORE_FIELDS};
use crate::features::source::{read_source, SourceTable};
use crate::io::write_atomic;
use geo::{SimplifyVwPreserve, Validation};
use geo_types::Geometry;
use geojson::{Feature, FeatureCollection, JsonObject};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// Loader options.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Extra fields to keep after `id`, `tier`, `site`
    pub include: Vec<String>,

    /// Topology-preserving simplification tolerance (degrees)
    pub simplify_tolerance: Option<f64>,
}

/// One trimmed feature; `properties` is aligned with the set's field list.
#[derive(Debug, Clone)]
pub struct MinimizedFeature {
    pub geometry: Geometry<f64>,
    pub properties: Vec<Value>,
}

impl MinimizedFeature {
    /// Feature id (always the first property).
    pub fn id(&self) -> &str {
        self.properties
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Trimmed features with a fixed, explicit attribute schema.
#[derive(Debug, Clone)]
pub struct MinimizedFeatureSet {
    fields: Vec<String>,
    features: Vec<MinimizedFeature>,
}

impl MinimizedFeatureSet {
    /// Attribute names in output order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Features in source order.
    pub fn features(&self) -> &[MinimizedFeature] {
        &self.features
    }

    /// Number of features.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Value of `field` on the feature at `index`.
    pub fn value(&self, index: usize, field: &str) -> Option<&Value> {
        let col = self.fields.iter().position(|f| f == field)?;
        self.features.get(index)?.properties.get(col)
    }

    /// Build the GeoJSON FeatureCollection handed to the tile builder.
    pub fn to_feature_collection(&self) -> FeatureCollection {
        let features = self
            .features
            .iter()
            .map(|f| {
                let mut properties = JsonObject::new();
                for (name, value) in self.fields.iter().zip(&f.properties) {
                    properties.insert(name.clone(), value.clone());
                }
                Feature {
                    bbox: None,
                    geometry: Some(geojson::Geometry::new(geojson::Value::from(&f.geometry))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }

    /// Write the set as GeoJSON, replacing `path` atomically.
    pub fn write_geojson(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(&self.to_feature_collection()).map_err(|e| {
            PipelineError::Source {
                path: path.to_path_buf(),
                message: format!("failed to encode GeoJSON: {}", e),
            }
        })?;
        write_atomic(path, &bytes)?;
        tracing::info!(
            "Wrote {} features ({} fields) to {}",
            self.features.len(),
            self.fields.len(),
            path.display()
        );
        Ok(())
    }
}

/// Output field list: core fields, then the include-list without repeats.
pub fn resolve_fields(include: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = CORE_FIELDS.iter().map(|s| s.to_string()).collect();
    for name in include {
        let name = name.trim();
        if !name.is_empty() && !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
    }
    fields
}

/// Read the source (and catalog) and produce the minimized feature set.
pub fn load_features(
    source: &Path,
    catalog: Option<&Path>,
    options: &LoadOptions,
) -> Result<MinimizedFeatureSet> {
    let table = read_source(source)?;
    let catalog = catalog.map(Catalog::from_path).transpose()?;
    minimize(table, catalog.as_ref(), options)
}

/// Left-join the catalog onto the source and keep only the resolved fields.
pub fn minimize(
    table: SourceTable,
    catalog: Option<&Catalog>,
    options: &LoadOptions,
) -> Result<MinimizedFeatureSet> {
    if table.records.is_empty() {
        return Err(PipelineError::Schema {
            path: table.path.clone(),
            message: "source contains no extent records".to_string(),
        });
    }

    let mut seen = HashSet::with_capacity(table.records.len());
    for record in &table.records {
        if !seen.insert(record.id.as_str()) {
            return Err(PipelineError::Schema {
                path: table.path.clone(),
                message: format!("duplicate id '{}'", record.id),
            });
        }
    }

    let fields = resolve_fields(&options.include);
    let extra = &fields[CORE_FIELDS.len()..];

    let missing: Vec<String> = extra
        .iter()
        .filter(|f| !table.has_column(f) && !catalog.is_some_and(|c| c.has_field(f)))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::NotFound { fields: missing });
    }

    let mut matched = 0usize;
    let mut features = Vec::with_capacity(table.records.len());
    for record in table.records {
        let geometry = validate_geometry(
            &table.path,
            &record.id,
            record.geometry.clone(),
            options.simplify_tolerance,
        )?;

        let entry = catalog.and_then(|c| c.get(&record.id));
        if entry.is_some() {
            matched += 1;
        }

        let mut properties = Vec::with_capacity(fields.len());
        properties.push(Value::from(record.id.as_str()));
        properties.push(Value::from(record.tier.as_str()));
        properties.push(Value::from(record.site.as_str()));
        for name in extra {
            let value = record
                .attribute(name)
                .cloned()
                .or_else(|| entry.and_then(|e| e.get(name)).map(|s| Value::from(s.as_str())))
                .unwrap_or(Value::Null);
            properties.push(value);
        }

        features.push(MinimizedFeature {
            geometry,
            properties,
        });
    }

    if let Some(catalog) = catalog {
        tracing::info!(
            "Joined catalog {}: {} of {} extents matched",
            catalog.path().display(),
            matched,
            features.len()
        );
    }

    Ok(MinimizedFeatureSet { fields, features })
}

/// Check that a geometry is present, polygonal, non-empty and valid.
fn validate_geometry(
    path: &Path,
    id: &str,
    geometry: SourceGeometry,
    simplify_tolerance: Option<f64>,
) -> Result<Geometry<f64>> {
    let geometry_err = |message: String| PipelineError::Geometry {
        path: path.to_path_buf(),
        id: id.to_string(),
        message,
    };

    let geometry = match geometry {
        SourceGeometry::Null => return Err(geometry_err("geometry is null".to_string())),
        SourceGeometry::Malformed(e) => return Err(geometry_err(e)),
        SourceGeometry::Parsed(g) => g,
    };

    let empty = match &geometry {
        Geometry::Polygon(p) => p.exterior().0.is_empty(),
        Geometry::MultiPolygon(mp) => mp.0.iter().all(|p| p.exterior().0.is_empty()),
        other => {
            return Err(geometry_err(format!(
                "unsupported geometry type {}, expected Polygon or MultiPolygon",
                geometry_type_name(other)
            )))
        }
    };
    if empty {
        return Err(geometry_err("geometry is empty".to_string()));
    }

    let geometry = match (geometry, simplify_tolerance) {
        (Geometry::Polygon(p), Some(tol)) if tol > 0.0 => {
            Geometry::Polygon(p.simplify_vw_preserve(&tol))
        }
        (Geometry::MultiPolygon(mp), Some(tol)) if tol > 0.0 => {
            Geometry::MultiPolygon(mp.simplify_vw_preserve(&tol))
        }
        (g, _) => g,
    };

    if !geometry.is_valid() {
        return Err(geometry_err(
            "geometry is invalid (self-intersecting or malformed rings)".to_string(),
        ));
    }
    Ok(geometry)
}

fn geometry_type_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}
