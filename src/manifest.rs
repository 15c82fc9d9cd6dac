//! Tile manifest and front-end integration snippet.

use crate::error::{PipelineError, Result};
use crate::io::write_atomic;
use crate::publish::{object_key, TILES_KEY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "tile_manifest.json";
pub const SNIPPET_FILE: &str = "vectorgrid_snippet.py";

/// Path suffix appended to every tile URL template.
const XYZ_SUFFIX: &str = "{z}/{x}/{y}.pbf";

/// How a map client addresses the published layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub url_template: String,
    pub layer_name: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
}

/// Where the tiles ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileLocation {
    /// Served through a CDN in front of the bucket; `key` may hold the
    /// `{z}/{x}/{y}` placeholders
    Cdn { domain: String, key: String },
    /// Served straight from the S3 bucket
    Bucket { bucket: String, key: String },
    /// Exploded tree on local disk
    Local { tiles_dir: PathBuf },
    /// Unexploded MBTiles archive on local disk, for a tile server to serve
    Archive { path: PathBuf },
}

impl TileLocation {
    /// URL template for this location.
    pub fn url_template(&self) -> Result<String> {
        let template = match self {
            TileLocation::Cdn { domain, key } => format!(
                "https://{}/{}",
                domain.trim_end_matches('/'),
                key.trim_start_matches('/')
            ),
            TileLocation::Bucket { bucket, key } => format!(
                "https://{}.s3.amazonaws.com/{}",
                bucket,
                key.trim_start_matches('/')
            ),
            TileLocation::Local { tiles_dir } => {
                let abs = absolute(tiles_dir)?;
                format!(
                    "file://{}/{}",
                    abs.to_string_lossy().trim_end_matches('/'),
                    XYZ_SUFFIX
                )
            }
            TileLocation::Archive { path } => {
                format!("mbtiles://{}", absolute(path)?.to_string_lossy())
            }
        };
        Ok(template)
    }
}

/// Object key template of the published tile tree under `prefix`.
pub fn tile_tree_key(prefix: &str) -> String {
    object_key(prefix, &format!("{}/{}", TILES_KEY, XYZ_SUFFIX))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| PipelineError::io(path, e))
}

/// Snippet generation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnippetOptions {
    pub enabled: bool,
}

impl Default for SnippetOptions {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Files written by [`emit_manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmittedFiles {
    pub manifest: PathBuf,
    pub snippet: Option<PathBuf>,
}

impl Manifest {
    /// Pretty JSON with a trailing newline.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::Config(format!("failed to encode manifest: {}", e)))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Write `tile_manifest.json` and, if enabled, `vectorgrid_snippet.py` into `dir`.
pub fn emit_manifest(dir: &Path, manifest: &Manifest, options: &SnippetOptions) -> Result<EmittedFiles> {
    let manifest_path = dir.join(MANIFEST_FILE);
    write_atomic(&manifest_path, &manifest.to_json_bytes()?)?;
    tracing::info!("Wrote {} ({})", manifest_path.display(), manifest.url_template);

    let snippet = if options.enabled {
        let path = dir.join(SNIPPET_FILE);
        write_atomic(&path, render_snippet(manifest).as_bytes())?;
        tracing::info!("Wrote {}", path.display());
        Some(path)
    } else {
        None
    };

    Ok(EmittedFiles {
        manifest: manifest_path,
        snippet,
    })
}

/// Render the Streamlit/Folium snippet that draws the layer with
/// Leaflet.VectorGrid.
pub fn render_snippet(manifest: &Manifest) -> String {
    SNIPPET_TEMPLATE
        .replace("@TILE_URL@", &py_str(&manifest.url_template))
        .replace("@LAYER_NAME@", &py_str(&manifest.layer_name))
        .replace("@MIN_ZOOM@", &manifest.min_zoom.to_string())
        .replace("@MAX_ZOOM@", &manifest.max_zoom.to_string())
        .replace(
            "@ATTRIBUTION@",
            &py_str(manifest.attribution.as_deref().unwrap_or("")),
        )
}

/// Quote as a Python string literal; JSON string syntax is a subset.
fn py_str(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

const SNIPPET_TEMPLATE: &str = r##"# Generated by fim-tiles. Paste into a Streamlit page.
import json

import folium
from branca.element import Element, MacroElement
from jinja2 import Template
from streamlit_folium import st_folium

TILE_URL = @TILE_URL@
LAYER_NAME = @LAYER_NAME@
MIN_ZOOM = @MIN_ZOOM@
MAX_ZOOM = @MAX_ZOOM@
ATTRIBUTION = @ATTRIBUTION@

TIER_COLORS = {
    "Tier_1": "#1b9e77",
    "Tier_2": "#d95f02",
    "Tier_3": "#7570b3",
    "Tier_4": "#e7298a",
    "Tier_5": "#66a61e",
}
DEFAULT_TIER_COLOR = "#2c7fb8"


class VectorGridLayer(MacroElement):
    _template = Template("""
    {% macro script(this, kwargs) %}
    var tierColors = {{ this.tier_colors }};
    var fimLayer = L.vectorGrid.protobuf({{ this.url }}, {
        vectorTileLayerStyles: {
            [{{ this.layer_name }}]: function (props, zoom) {
                var c = tierColors[props.tier] || {{ this.default_color }};
                return {color: c, weight: 1, fill: true, fillColor: c, fillOpacity: 0.5};
            }
        },
        interactive: true,
        minZoom: {{ this.min_zoom }},
        maxNativeZoom: {{ this.max_zoom }},
        attribution: {{ this.attribution }},
        getFeatureId: function (f) { return f.properties.id; }
    });
    fimLayer.on("click", function (e) {
        var p = e.layer.properties;
        L.popup()
            .setLatLng(e.latlng)
            .setContent(p.tier + " - " + p.site + "<br>id: " + p.id)
            .openOn({{ this._parent.get_name() }});
    });
    fimLayer.addTo({{ this._parent.get_name() }});
    {% endmacro %}
    """)

    def __init__(self):
        super().__init__()
        self._name = "VectorGridLayer"
        self.url = json.dumps(TILE_URL)
        self.layer_name = json.dumps(LAYER_NAME)
        self.min_zoom = MIN_ZOOM
        self.max_zoom = MAX_ZOOM
        self.attribution = json.dumps(ATTRIBUTION)
        self.tier_colors = json.dumps(TIER_COLORS)
        self.default_color = json.dumps(DEFAULT_TIER_COLOR)


def add_fim_tiles(m: folium.Map) -> folium.Map:
    m.get_root().header.add_child(Element(
        '<script src="https://unpkg.com/leaflet.vectorgrid@1.3.0/dist/Leaflet.VectorGrid.bundled.js"></script>'
    ))
    VectorGridLayer().add_to(m)
    return m


m = folium.Map(location=[31.0, -99.0], zoom_start=max(MIN_ZOOM, 6), tiles="CartoDB positron")
add_fim_tiles(m)
st_folium(m, use_container_width=True, height=650)
"##;
