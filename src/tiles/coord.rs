//! Tile addressing.

use std::fmt;
use std::path::PathBuf;

/// Extension used for exploded vector tiles.
pub const TILE_EXTENSION: &str = "pbf";

/// An XYZ (slippy map) tile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Create a tile address, checking `x` and `y` are within zoom `z`.
    pub fn new(z: u8, x: u32, y: u32) -> Option<Self> {
        let n = tiles_per_side(z)?;
        (u64::from(x) < n && u64::from(y) < n).then_some(Self { z, x, y })
    }

    /// Convert an MBTiles (TMS, origin bottom-left) row to XYZ.
    pub fn from_tms(z: i64, x: i64, row: i64) -> Option<Self> {
        let z = u8::try_from(z).ok()?;
        let n = tiles_per_side(z)? as i64;
        if !(0..n).contains(&x) || !(0..n).contains(&row) {
            return None;
        }
        Some(Self {
            z,
            x: x as u32,
            y: (n - 1 - row) as u32,
        })
    }

    /// Path of this tile relative to a tile root: `{z}/{x}/{y}.pbf`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.z.to_string())
            .join(self.x.to_string())
            .join(format!("{}.{}", self.y, TILE_EXTENSION))
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Tiles along one axis at zoom `z`; `None` above zoom 31.
fn tiles_per_side(z: u8) -> Option<u64> {
    (z < 32).then(|| 1u64 << z)
}
