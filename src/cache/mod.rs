//! Content-addressed disk cache for ingestion products.
//!
//! Books are stored under a directory named by a prefix of the archive's
//! sha256. Chapter payloads live in append-only generations so readers
//! never observe a half-written set; every file write is tmp+rename.

pub mod coordinator;
pub mod store;

pub use coordinator::{CacheCoordinator, PointerFile};
pub use store::{BookRow, CacheStore, LayoutRecord};

/// Global cache schema version; bump to invalidate every stored book.
pub const CACHE_VERSION: u32 = 1;
/// Book payload schema version; bump when `book.json` rows change shape.
pub const PAYLOAD_VERSION: u32 = 1;

/// Pointer file format marker.
pub const POINTER_FORMAT: &str = "shoko-cache-pointer";
pub const POINTER_VERSION: u32 = 1;

/// Length of the directory-name prefix taken from the sha256.
pub(crate) const SHA_PREFIX_LEN: usize = 16;

/// Cache key for a persisted layout: encodes exactly the inputs the
/// formatter depends on besides the chapter itself.
pub fn layout_key(width: usize, view_mode: &str, line_spacing: &str) -> String {
    format!("w{width}_{view_mode}_{line_spacing}")
}

pub(crate) fn sha_dir_name(sha: &str) -> String {
    sha.chars().take(SHA_PREFIX_LEN).collect()
}
