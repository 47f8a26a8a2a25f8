//! Hit/miss decisions between archives, pointer files, and the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::book::Book;
use crate::cache::store::{CacheStore, write_json_atomic};
use crate::cache::{POINTER_FORMAT, POINTER_VERSION};
use crate::epub::ingest::{self, file_mtime};
use crate::error::{Error, Result};

/// Forward reference from a user-visible `.cache` path to a stored sha.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointerFile {
    pub format: String,
    pub version: u32,
    pub sha256: String,
    pub source_path: String,
    /// Unix seconds when the referenced payload was generated.
    pub generated_at: i64,
    pub engine: String,
}

impl PointerFile {
    pub fn new(sha256: impl Into<String>, source_path: impl Into<String>, generated_at: i64) -> Self {
        Self {
            format: POINTER_FORMAT.to_string(),
            version: POINTER_VERSION,
            sha256: sha256.into(),
            source_path: source_path.into(),
            generated_at,
            engine: format!("shoko/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.format == POINTER_FORMAT && self.version == POINTER_VERSION
    }
}

/// Decides hit/miss and owns the in-memory payload cache.
pub struct CacheCoordinator {
    store: Arc<CacheStore>,
    payloads: Mutex<HashMap<String, Arc<Book>>>,
}

impl CacheCoordinator {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            payloads: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Open a book from an archive path or a pointer file.
    pub fn open(&self, path: &Path) -> Result<Arc<Book>> {
        match read_pointer(path) {
            Some(pointer) => self.open_pointer(path, pointer),
            None => self.open_archive(path),
        }
    }

    fn open_archive(&self, path: &Path) -> Result<Arc<Book>> {
        let source = ingest::digest_source(path)?;

        if let Some(book) = self.cached(&source.sha256) {
            return Ok(book);
        }
        match self.store.fetch_payload(&source.sha256) {
            Ok(Some(mut book)) => {
                // The digest matched, so the payload is current even if
                // the archive moved since it was stored.
                book.source = source;
                return Ok(self.remember(book));
            }
            Ok(None) => {}
            Err(e) => log::warn!("cache read failed, rebuilding: {e}"),
        }

        let book = ingest::ingest_archive(path, source)?;
        self.persist(&book);
        Ok(self.remember(book))
    }

    fn open_pointer(&self, path: &Path, pointer: PointerFile) -> Result<Arc<Book>> {
        if !pointer.is_valid() {
            return Err(Error::cache_load(path, "unrecognized pointer file"));
        }
        let sha = pointer.sha256.clone();

        let source_path = PathBuf::from(&pointer.source_path);
        let stale = source_path.exists()
            && self
                .store
                .fetch_row(&sha)
                .is_some_and(|row| file_mtime(&source_path) > row.generated_at);

        if !stale {
            if let Some(book) = self.cached(&sha) {
                return Ok(book);
            }
            match self.store.fetch_payload(&sha) {
                Ok(Some(book)) => return Ok(self.remember(book)),
                Ok(None) => {}
                Err(e) => log::warn!("cache read failed for pointer {sha}: {e}"),
            }
        }

        // Rebuild from the referenced archive when we can.
        if source_path.exists() {
            return self.open_archive(&source_path);
        }
        Err(Error::cache_load(
            path,
            format!("no cached payload for {sha} and source archive is gone"),
        ))
    }

    /// Persist an ingested book; cache write failures keep the
    /// in-memory book valid.
    fn persist(&self, book: &Book) {
        if self.store.payload_current(book) {
            log::debug!("payload for {} already current", book.source.sha256);
            return;
        }
        if let Err(e) = self.store.store_payload(book) {
            log::warn!("cache write failed: {e}");
            return;
        }
        let pointer = PointerFile::new(
            book.source.sha256.clone(),
            book.source.path.to_string_lossy().into_owned(),
            crate::epub::ingest::file_mtime(&book.source.path).max(0),
        );
        let pointer_path = self
            .store
            .root()
            .join(crate::cache::sha_dir_name(&book.source.sha256))
            .join("pointer.json");
        if let Err(e) = write_json_atomic(&pointer_path, &pointer) {
            log::warn!("pointer write failed: {e}");
        }
    }

    fn cached(&self, sha: &str) -> Option<Arc<Book>> {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sha)
            .cloned()
    }

    fn remember(&self, book: Book) -> Arc<Book> {
        let book = Arc::new(book);
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(book.source.sha256.clone(), book.clone());
        book
    }

    /// Drop the in-memory payload for a sha (used after `delete`).
    pub fn evict(&self, sha: &str) {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sha);
    }
}

/// Try to interpret a file as a pointer; `None` means "treat as archive".
fn read_pointer(path: &Path) -> Option<PointerFile> {
    let looks_like_pointer = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("cache") || ext.eq_ignore_ascii_case("json"));
    if !looks_like_pointer {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    let pointer: PointerFile = serde_json::from_slice(&bytes).ok()?;
    pointer.is_valid().then_some(pointer)
}

/// Write a user-visible pointer file at the given destination.
pub fn write_pointer(dest: &Path, pointer: &PointerFile) -> Result<()> {
    write_json_atomic(dest, pointer)
}
