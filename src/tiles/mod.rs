//! Vector tile building and extraction.

mod builder;
mod coord;
mod exploder;
mod process;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use builder::{BuildRequest, TileArchive, TileBuilder};
pub use coord::{TileCoord, TILE_EXTENSION};
pub use exploder::{ensure_gzip, is_gzip, read_metadata, ExplodeStats, TileExploder, METADATA_FILE};
pub use process::{run_tool, ToolError, ToolOutput};
