//! Side catalog of per-extent enrichment fields keyed by `id`.

use crate::error::{PipelineError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// String fields for one catalog entry.
pub type CatalogEntry = BTreeMap<String, String>;

/// Catalog loaded from JSON.
///
/// Accepted shapes:
/// - `{"<id>": {...}, ...}`
/// - `[{"id": "<id>", ...}, ...]`
/// - `{"records": [{"id": "<id>", ...}, ...]}`
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    path: PathBuf,
    entries: HashMap<String, CatalogEntry>,
    fields: BTreeSet<String>,
}

impl Catalog {
    /// Load a catalog from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        let value: Value = serde_json::from_slice(&raw).map_err(|e| PipelineError::Source {
            path: path.to_path_buf(),
            message: format!("invalid catalog JSON: {}", e),
        })?;
        Self::from_value(path, value)
    }

    /// Build a catalog from an already-parsed JSON document.
    pub fn from_value(path: &Path, value: Value) -> Result<Self> {
        let schema_err = |message: String| PipelineError::Schema {
            path: path.to_path_buf(),
            message,
        };

        let mut catalog = Catalog {
            path: path.to_path_buf(),
            ..Default::default()
        };

        match value {
            Value::Object(mut map) if matches!(map.get("records"), Some(Value::Array(_))) => {
                if let Some(Value::Array(records)) = map.remove("records") {
                    catalog.insert_records(records).map_err(schema_err)?;
                }
            }
            Value::Array(records) => {
                catalog.insert_records(records).map_err(schema_err)?;
            }
            Value::Object(map) => {
                for (id, entry) in map {
                    let Value::Object(fields) = entry else {
                        return Err(schema_err(format!(
                            "catalog entry '{}' must be an object",
                            id
                        )));
                    };
                    catalog.insert(id, fields);
                }
            }
            _ => {
                return Err(schema_err(
                    "catalog must be an object keyed by id or an array of records".to_string(),
                ))
            }
        }

        tracing::info!(
            "Loaded catalog {} ({} entries, {} fields)",
            path.display(),
            catalog.entries.len(),
            catalog.fields.len()
        );
        Ok(catalog)
    }

    fn insert_records(&mut self, records: Vec<Value>) -> std::result::Result<(), String> {
        for (idx, record) in records.into_iter().enumerate() {
            let Value::Object(mut fields) = record else {
                return Err(format!("catalog record #{} must be an object", idx));
            };
            let id = match fields.remove("id") {
                Some(Value::String(s)) => s,
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(format!("catalog record #{} has no 'id'", idx)),
            };
            if self.entries.contains_key(&id) {
                tracing::debug!("Duplicate catalog id '{}' ignored", id);
                continue;
            }
            self.insert(id, fields);
        }
        Ok(())
    }

    fn insert(&mut self, id: String, fields: serde_json::Map<String, Value>) {
        let mut entry = CatalogEntry::new();
        for (name, value) in fields {
            if name == "id" {
                continue;
            }
            if let Some(s) = value_to_string(&value) {
                self.fields.insert(name.clone());
                entry.insert(name, s);
            }
        }
        self.entries.insert(id, entry);
    }

    /// Catalog file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry for an id, if any.
    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    /// Whether any entry provides this field.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains(name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Render a scalar JSON value as a catalog string; null is absent.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path() -> &'static Path {
        Path::new("catalog_core.json")
    }

    #[test]
    fn test_keyed_object() {
        let catalog = Catalog::from_value(
            path(),
            json!({
                "A": {"tif_url": "s3://a.tif", "json_url": "s3://a.json"},
                "B": {"tif_url": "s3://b.tif", "huc8": 12090301}
            }),
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("A").unwrap()["json_url"], "s3://a.json");
        assert_eq!(catalog.get("B").unwrap()["huc8"], "12090301");
        assert!(catalog.has_field("json_url"));
        assert!(!catalog.has_field("missing"));
    }

    #[test]
    fn test_records_array_keeps_first_duplicate() {
        let catalog = Catalog::from_value(
            path(),
            json!({"records": [
                {"id": "A", "tif_url": "first"},
                {"id": "A", "tif_url": "second"},
                {"id": 7, "tif_url": null}
            ]}),
        )
        .unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("A").unwrap()["tif_url"], "first");
        assert!(catalog.get("7").unwrap().is_empty());
    }

    #[test]
    fn test_plain_array() {
        let catalog =
            Catalog::from_value(path(), json!([{"id": "X", "site": "Austin"}])).unwrap();
        assert_eq!(catalog.get("X").unwrap()["site"], "Austin");
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(matches!(
            Catalog::from_value(path(), json!("nope")),
            Err(PipelineError::Schema { .. })
        ));
        assert!(matches!(
            Catalog::from_value(path(), json!([{"tif_url": "no id"}])),
            Err(PipelineError::Schema { .. })
        ));
        assert!(matches!(
            Catalog::from_value(path(), json!({"A": "not an object"})),
            Err(PipelineError::Schema { .. })
        ));
    }

    #[test]
    fn test_from_path_invalid_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("catalog.json");
        std::fs::write(&file, "{not json").unwrap();
        assert!(matches!(
            Catalog::from_path(&file),
            Err(PipelineError::Source { .. })
        ));
    }
}
