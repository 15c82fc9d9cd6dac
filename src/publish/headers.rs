//! HTTP headers attached to published objects.

use object_store::{Attribute, Attributes};
use std::path::Path;

pub const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_GEOJSON: &str = "application/geo+json";
pub const CONTENT_TYPE_SQLITE: &str = "application/x-sqlite3";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Content headers for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeaders {
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
}

impl ObjectHeaders {
    /// Headers chosen from the file extension.
    ///
    /// Vector tiles are stored gzip-compressed, so they carry
    /// `Content-Encoding: gzip` for clients to decode transparently.
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match ext.as_deref() {
            Some("pbf") | Some("mvt") => Self {
                content_type: CONTENT_TYPE_PROTOBUF,
                content_encoding: Some("gzip"),
            },
            Some("json") => Self::plain(CONTENT_TYPE_JSON),
            Some("geojson") => Self::plain(CONTENT_TYPE_GEOJSON),
            Some("mbtiles") => Self::plain(CONTENT_TYPE_SQLITE),
            Some("py") => Self::plain("text/x-python"),
            Some("html") | Some("htm") => Self::plain("text/html"),
            Some("txt") | Some("md") => Self::plain("text/plain"),
            Some("csv") => Self::plain("text/csv"),
            _ => Self::plain(CONTENT_TYPE_OCTET_STREAM),
        }
    }

    fn plain(content_type: &'static str) -> Self {
        Self {
            content_type,
            content_encoding: None,
        }
    }

    /// Object store attributes for a put.
    pub fn to_attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, self.content_type.into());
        if let Some(encoding) = self.content_encoding {
            attributes.insert(Attribute::ContentEncoding, encoding.into());
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_headers() {
        let h = ObjectHeaders::for_path(Path::new("tiles/3/1/2.pbf"));
        assert_eq!(h.content_type, "application/x-protobuf");
        assert_eq!(h.content_encoding, Some("gzip"));
        assert_eq!(ObjectHeaders::for_path(Path::new("a/b.MVT")), h);
    }

    #[test]
    fn test_other_headers() {
        let cases = [
            ("tiles/metadata.json", "application/json"),
            ("fimextent.geojson", "application/geo+json"),
            ("fim_extents.mbtiles", "application/x-sqlite3"),
            ("vectorgrid_snippet.py", "text/x-python"),
            ("index.html", "text/html"),
            ("README", "application/octet-stream"),
            ("extents.parquet", "application/octet-stream"),
        ];
        for (path, expected) in cases {
            let h = ObjectHeaders::for_path(Path::new(path));
            assert_eq!(h.content_type, expected, "{}", path);
            assert_eq!(h.content_encoding, None, "{}", path);
        }
    }

    #[test]
    fn test_to_attributes() {
        let attrs = ObjectHeaders::for_path(Path::new("0/0/0.pbf")).to_attributes();
        assert_eq!(
            attrs.get(&Attribute::ContentType).map(|v| v.as_ref()),
            Some("application/x-protobuf")
        );
        assert_eq!(
            attrs.get(&Attribute::ContentEncoding).map(|v| v.as_ref()),
            Some("gzip")
        );

        let attrs = ObjectHeaders::for_path(Path::new("metadata.json")).to_attributes();
        assert!(attrs.get(&Attribute::ContentEncoding).is_none());
    }
}
