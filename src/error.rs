//! Error types for shoko operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Which archive safety limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipLimit {
    /// Uncompressed size of a single entry.
    EntryBytes,
    /// Compressed size of a single entry.
    EntryCompressedBytes,
    /// Total uncompressed bytes read from the archive.
    TotalBytes,
    /// Number of central directory entries.
    Entries,
}

impl std::fmt::Display for ZipLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ZipLimit::EntryBytes => "max entry uncompressed bytes",
            ZipLimit::EntryCompressedBytes => "max entry compressed bytes",
            ZipLimit::TotalBytes => "max total uncompressed bytes",
            ZipLimit::Entries => "max entries",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while ingesting, caching, or rendering a book.
#[derive(Error, Debug)]
pub enum Error {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("cannot read '{entry}' from archive: {source}")]
    ZipRead {
        entry: String,
        #[source]
        source: io::Error,
    },

    #[error("archive limit exceeded: {0}")]
    ZipLimitExceeded(ZipLimit),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("chapter '{chapter}': {reason}")]
    Formatting { chapter: String, reason: String },

    #[error("cache load {path}: {reason}")]
    CacheLoad { path: PathBuf, reason: String },

    #[error("cache write {path}: {source}")]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid value for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a `ZipRead` error for a named archive entry.
    pub fn zip_read(entry: impl Into<String>, source: io::Error) -> Self {
        Error::ZipRead {
            entry: entry.into(),
            source,
        }
    }

    /// Build a `Formatting` error for a chapter.
    pub fn formatting(chapter: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Formatting {
            chapter: chapter.into(),
            reason: reason.into(),
        }
    }

    /// Build a `CacheLoad` error for a cache path.
    pub fn cache_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CacheLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Build a `Validation` error for a config field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the error is worth surfacing to the user (vs. log-and-continue).
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::FileNotFound(_)
                | Error::ZipRead { .. }
                | Error::ZipLimitExceeded(_)
                | Error::InvalidArchive(_)
                | Error::Validation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
