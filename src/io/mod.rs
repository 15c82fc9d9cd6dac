//! Local file and object store plumbing.

mod fsutil;
mod store;

pub use fsutil::{ensure_parent_dir, remove_dir_if_exists, replace_file, temp_path_for, write_atomic};
pub use store::{create_publish_store, parse_s3_uri};
