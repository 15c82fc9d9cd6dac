//! MBTiles and stand-in tool fixtures for tile tests.

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

/// One fixture tile, addressed the way MBTiles stores it (TMS row).
pub(crate) struct FixtureTile {
    pub z: i64,
    pub x: i64,
    pub tms_row: i64,
    pub data: Vec<u8>,
}

impl FixtureTile {
    pub fn new(z: i64, x: i64, tms_row: i64, data: &[u8]) -> Self {
        Self {
            z,
            x,
            tms_row,
            data: data.to_vec(),
        }
    }
}

/// Write a minimal MBTiles archive with the given tiles and metadata rows.
pub(crate) fn write_mbtiles(path: &Path, tiles: &[FixtureTile], metadata: &[(&str, &str)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE metadata (name TEXT, value TEXT);
         CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB);",
    )
    .unwrap();
    for (name, value) in metadata {
        conn.execute("INSERT INTO metadata (name, value) VALUES (?1, ?2)", params![name, value])
            .unwrap();
    }
    for tile in tiles {
        conn.execute(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
            params![tile.z, tile.x, tile.tms_row, tile.data],
        )
        .unwrap();
    }
}

/// Metadata rows for the standard fixture archive.
pub(crate) fn fixture_metadata() -> Vec<(&'static str, &'static str)> {
    vec![
        ("name", "fim_extents"),
        ("format", "pbf"),
        ("minzoom", "3"),
        ("maxzoom", "4"),
        ("json", r#"{"vector_layers":[{"id":"fim_extents","fields":{"id":"String"}}]}"#),
    ]
}

/// Three tiles across zooms 3 and 4; one payload is already gzip.
pub(crate) fn fixture_tiles() -> Vec<FixtureTile> {
    vec![
        FixtureTile::new(3, 1, 5, b"raw-tile-a"),
        FixtureTile::new(3, 2, 5, &gzip(b"tile-b")),
        FixtureTile::new(4, 3, 10, b"raw-tile-c"),
    ]
}

/// Gzip `data` with default settings.
pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Gunzip `data`.
pub(crate) fn gunzip(data: &[u8]) -> Vec<u8> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

/// Write an executable shell script standing in for an external tool.
#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stand-in tile builder: writes a copy of `archive` wherever `-o` points.
#[cfg(unix)]
pub(crate) fn fake_tippecanoe(dir: &Path, archive: &Path) -> PathBuf {
    write_script(
        dir,
        "tippecanoe",
        &format!(
            r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
cp "{}" "$out""#,
            archive.display()
        ),
    )
}
