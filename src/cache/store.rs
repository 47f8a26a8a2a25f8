//! On-disk layout of the book cache.
//!
//! ```text
//! {root}/
//!   manifest.json             # aggregated book.json rows
//!   {sha_prefix}/
//!     book.json
//!     chapters/{generation}/index.json
//!     chapters/{generation}/raw/000000.xhtml ...
//!     resources/index.json + content-hashed blobs
//!     layouts/{key}.json
//!     pointer.json
//! ```
//!
//! Writers serialise per sha; every file goes through tmp+rename so a
//! reader never sees partial contents. Chapter generations are only
//! deleted after their replacement is fully present.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::book::{Book, Chapter, Resource, SourceInfo};
use crate::cache::{CACHE_VERSION, PAYLOAD_VERSION, sha_dir_name};
use crate::error::{Error, Result};

const MANIFEST_FILE: &str = "manifest.json";
/// Pre-1.0 manifest name, removed once the current one is written.
const LEGACY_MANIFEST_FILE: &str = "books.json";

/// The `book.json` row. List- and map-valued fields are stored as
/// JSON-encoded strings so the row itself stays flat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookRow {
    pub source_sha: String,
    pub source_path: String,
    pub source_mtime: i64,
    pub payload_version: u32,
    /// Unix seconds of the store that produced this row.
    pub generated_at: i64,
    pub title: String,
    pub language: String,
    pub authors_json: String,
    pub metadata_json: String,
    pub opf_path: String,
    pub spine_json: String,
    pub chapter_hrefs_json: String,
    pub toc_json: String,
    pub container_path: String,
    pub container_xml: String,
    pub cache_version: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// One chapter row inside a generation's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChapterRow {
    position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    number: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_json: Option<String>,
}

/// A persisted per-width layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRecord {
    pub key: String,
    pub version: u32,
    pub payload_json: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceIndexEntry {
    file: String,
    media_type: String,
}

/// Disk store rooted at the cache directory.
pub struct CacheStore {
    root: PathBuf,
    /// Per-sha write locks; reads are lock-free.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn book_dir(&self, sha: &str) -> PathBuf {
        self.root.join(sha_dir_name(sha))
    }

    fn write_lock(&self, sha: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(sha_dir_name(sha))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Payload
    // ------------------------------------------------------------------

    /// The raw `book.json` row, without chapter payloads.
    pub fn fetch_row(&self, sha: &str) -> Option<BookRow> {
        read_json(&self.book_dir(sha).join("book.json")).ok()
    }

    /// Load a cached book. Returns `Ok(None)` on version mismatch or a
    /// missing entry; corrupt artifacts surface as `CacheLoad` errors.
    pub fn fetch_payload(&self, sha: &str) -> Result<Option<Book>> {
        let dir = self.book_dir(sha);
        let row_path = dir.join("book.json");
        if !row_path.exists() {
            return Ok(None);
        }

        let row: BookRow = read_json(&row_path)?;
        if row.cache_version != CACHE_VERSION || row.payload_version != PAYLOAD_VERSION {
            log::info!(
                "cache entry {sha} has stale versions ({}, {}); ignoring",
                row.cache_version,
                row.payload_version
            );
            return Ok(None);
        }

        let hrefs: Vec<String> = decode_field(&row_path, &row.chapter_hrefs_json)?;
        let chapters = self.load_chapters(&dir, &hrefs)?;
        let resources = self.load_resources(&dir);

        let book = Book {
            title: row.title.clone(),
            language: row.language.clone(),
            authors: decode_field(&row_path, &row.authors_json)?,
            metadata: decode_field(&row_path, &row.metadata_json)?,
            opf_path: row.opf_path.clone(),
            spine: decode_field(&row_path, &row.spine_json)?,
            container: crate::book::ContainerInfo {
                path: row.container_path.clone(),
                xml: row.container_xml.clone(),
            },
            chapters,
            toc: decode_field(&row_path, &row.toc_json)?,
            resources,
            source: SourceInfo {
                path: PathBuf::from(&row.source_path),
                sha256: row.source_sha.clone(),
                mtime: row.source_mtime,
            },
        };
        Ok(Some(book))
    }

    /// Persist a book: chapters into a fresh generation, resources by
    /// content hash, then the row and manifest.
    pub fn store_payload(&self, book: &Book) -> Result<()> {
        let sha = &book.source.sha256;
        let lock = self.write_lock(sha);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.book_dir(sha);
        fs::create_dir_all(&dir).map_err(|e| write_error(&dir, e))?;

        self.write_chapters(&dir, &book.chapters)?;
        self.write_resources(&dir, &book.resources)?;

        let row_path = dir.join("book.json");
        let created_at = match fs::read(&row_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<BookRow>(&bytes).ok())
        {
            Some(existing) => existing.created_at,
            None => now_rfc3339(),
        };

        let row = BookRow {
            source_sha: sha.clone(),
            source_path: book.source.path.to_string_lossy().into_owned(),
            source_mtime: book.source.mtime,
            payload_version: PAYLOAD_VERSION,
            generated_at: now_unix(),
            title: book.title.clone(),
            language: book.language.clone(),
            authors_json: encode_field(&book.authors)?,
            metadata_json: encode_field(&book.metadata)?,
            opf_path: book.opf_path.clone(),
            spine_json: encode_field(&book.spine)?,
            chapter_hrefs_json: encode_field(
                &book
                    .chapters
                    .iter()
                    .map(|c| c.file_path.clone())
                    .collect::<Vec<_>>(),
            )?,
            toc_json: encode_field(&book.toc)?,
            container_path: book.container.path.clone(),
            container_xml: book.container.xml.clone(),
            cache_version: CACHE_VERSION,
            created_at,
            updated_at: now_rfc3339(),
        };
        write_json_atomic(&row_path, &row)?;
        self.update_manifest(|rows| {
            rows.retain(|r| r.source_sha != row.source_sha);
            rows.push(row.clone());
        })?;

        let legacy = self.root.join(LEGACY_MANIFEST_FILE);
        if legacy.exists() {
            let _ = fs::remove_file(legacy);
        }
        Ok(())
    }

    /// Whether a store for this book would change anything on disk.
    /// Used to keep repeated ingestion write-free.
    pub fn payload_current(&self, book: &Book) -> bool {
        let dir = self.book_dir(&book.source.sha256);
        let Ok(row) = read_json::<BookRow>(&dir.join("book.json")) else {
            return false;
        };
        if row.cache_version != CACHE_VERSION
            || row.payload_version != PAYLOAD_VERSION
            || row.title != book.title
        {
            return false;
        }
        match self.load_chapters(&dir, &[]) {
            Ok(chapters) => {
                chapters.len() == book.chapters.len()
                    && chapters
                        .iter()
                        .zip(&book.chapters)
                        .all(|(a, b)| a.raw_xhtml == b.raw_xhtml)
            }
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Chapters
    // ------------------------------------------------------------------

    fn write_chapters(&self, dir: &Path, chapters: &[Chapter]) -> Result<()> {
        let chapters_dir = dir.join("chapters");
        let generation = new_generation_name();
        let gen_dir = chapters_dir.join(&generation);
        let raw_dir = gen_dir.join("raw");
        fs::create_dir_all(&raw_dir).map_err(|e| write_error(&raw_dir, e))?;

        for chapter in chapters {
            let file = raw_dir.join(format!("{:06}.xhtml", chapter.position));
            write_bytes_atomic(&file, chapter.raw_xhtml.as_bytes())?;
        }

        let rows: Vec<ChapterRow> = chapters
            .iter()
            .map(|c| {
                Ok(ChapterRow {
                    position: c.position,
                    number: Some(c.number),
                    title: c.title.clone(),
                    metadata_json: if c.metadata.is_empty() {
                        None
                    } else {
                        Some(encode_field(&c.metadata)?)
                    },
                })
            })
            .collect::<Result<_>>()?;
        // index.json is written last: its presence marks the generation
        // complete.
        write_json_atomic(&gen_dir.join("index.json"), &rows)?;

        // Old generations go away only once the new one is fully present.
        if let Ok(entries) = fs::read_dir(&chapters_dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy() != generation {
                    let _ = fs::remove_dir_all(entry.path());
                }
            }
        }
        Ok(())
    }

    /// Load chapters from the newest complete generation.
    fn load_chapters(&self, dir: &Path, hrefs: &[String]) -> Result<Vec<Chapter>> {
        let chapters_dir = dir.join("chapters");
        let mut generations: Vec<String> = match fs::read_dir(&chapters_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                return Err(Error::cache_load(
                    chapters_dir,
                    format!("no chapter generations: {e}"),
                ));
            }
        };
        generations.sort();

        for generation in generations.iter().rev() {
            let gen_dir = chapters_dir.join(generation);
            match self.load_generation(&gen_dir, hrefs) {
                Ok(Some(chapters)) => return Ok(chapters),
                Ok(None) => {
                    log::warn!("incomplete chapter generation {generation}; trying older");
                }
                Err(e) => log::warn!("unreadable chapter generation {generation}: {e}"),
            }
        }
        Err(Error::cache_load(
            chapters_dir,
            "no complete chapter generation",
        ))
    }

    /// Returns `Ok(None)` when the generation is incomplete: a missing
    /// index or any missing raw file.
    fn load_generation(&self, gen_dir: &Path, hrefs: &[String]) -> Result<Option<Vec<Chapter>>> {
        let index_path = gen_dir.join("index.json");
        if !index_path.exists() {
            return Ok(None);
        }
        let rows: Vec<ChapterRow> = read_json(&index_path)?;

        let mut chapters = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_path = gen_dir.join("raw").join(format!("{:06}.xhtml", row.position));
            let raw = match fs::read_to_string(&raw_path) {
                Ok(raw) => raw,
                Err(_) => return Ok(None),
            };
            let mut chapter = Chapter::new(
                row.position,
                hrefs.get(row.position).cloned().unwrap_or_default(),
            );
            chapter.number = row.number.unwrap_or(row.position + 1);
            chapter.title = row.title;
            chapter.raw_xhtml = raw;
            if let Some(meta) = row.metadata_json {
                chapter.metadata = decode_field(&index_path, &meta)?;
            }
            chapters.push(chapter);
        }
        chapters.sort_by_key(|c| c.position);
        Ok(Some(chapters))
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    fn write_resources(&self, dir: &Path, resources: &BTreeMap<String, Resource>) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        let res_dir = dir.join("resources");
        fs::create_dir_all(&res_dir).map_err(|e| write_error(&res_dir, e))?;

        let mut index: BTreeMap<String, ResourceIndexEntry> = BTreeMap::new();
        for (href, resource) in resources {
            let file = content_hashed_name(href, &resource.data);
            let path = res_dir.join(&file);
            if !path.exists() {
                write_bytes_atomic(&path, &resource.data)?;
            }
            index.insert(
                href.clone(),
                ResourceIndexEntry {
                    file,
                    media_type: resource.media_type.clone(),
                },
            );
        }
        write_json_atomic(&res_dir.join("index.json"), &index)
    }

    fn load_resources(&self, dir: &Path) -> BTreeMap<String, Resource> {
        let res_dir = dir.join("resources");
        let Ok(index) =
            read_json::<BTreeMap<String, ResourceIndexEntry>>(&res_dir.join("index.json"))
        else {
            return BTreeMap::new();
        };
        let mut resources = BTreeMap::new();
        for (href, entry) in index {
            match fs::read(res_dir.join(&entry.file)) {
                Ok(data) => {
                    resources.insert(
                        href,
                        Resource {
                            data,
                            media_type: entry.media_type,
                        },
                    );
                }
                Err(e) => log::debug!("cached resource '{href}' unreadable: {e}"),
            }
        }
        resources
    }

    // ------------------------------------------------------------------
    // Layouts
    // ------------------------------------------------------------------

    pub fn fetch_layout(&self, sha: &str, key: &str) -> Option<LayoutRecord> {
        let path = self.book_dir(sha).join("layouts").join(format!("{key}.json"));
        let record: LayoutRecord = read_json(&path).ok()?;
        (record.version == CACHE_VERSION && record.key == key).then_some(record)
    }

    pub fn store_layout(&self, sha: &str, key: &str, payload_json: String) -> Result<()> {
        let lock = self.write_lock(sha);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let layouts_dir = self.book_dir(sha).join("layouts");
        fs::create_dir_all(&layouts_dir).map_err(|e| write_error(&layouts_dir, e))?;
        let record = LayoutRecord {
            key: key.to_string(),
            version: CACHE_VERSION,
            payload_json,
            updated_at: now_rfc3339(),
        };
        write_json_atomic(&layouts_dir.join(format!("{key}.json")), &record)
    }

    // ------------------------------------------------------------------
    // Manifest and lifecycle
    // ------------------------------------------------------------------

    /// All known book rows, newest update first.
    pub fn list_books(&self) -> Vec<BookRow> {
        let mut rows: Vec<BookRow> = read_json(&self.root.join(MANIFEST_FILE)).unwrap_or_default();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }

    pub fn delete(&self, sha: &str) -> Result<()> {
        let lock = self.write_lock(sha);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.book_dir(sha);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| write_error(&dir, e))?;
        }
        self.update_manifest(|rows| rows.retain(|r| r.source_sha != sha))
    }

    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| write_error(&self.root, e))?;
        }
        Ok(())
    }

    fn update_manifest(&self, mutate: impl FnOnce(&mut Vec<BookRow>)) -> Result<()> {
        let path = self.root.join(MANIFEST_FILE);
        let mut rows: Vec<BookRow> = read_json(&path).unwrap_or_default();
        mutate(&mut rows);
        fs::create_dir_all(&self.root).map_err(|e| write_error(&self.root, e))?;
        write_json_atomic(&path, &rows)
    }
}

// ----------------------------------------------------------------------------
// File helpers
// ----------------------------------------------------------------------------

/// Atomic write: tmp file in the same directory, then rename.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).map_err(|e| write_error(path, e))?;
    fs::rename(&tmp, path).map_err(|e| write_error(path, e))
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &json)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)
        .map_err(|e| Error::cache_load(path, e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::cache_load(path, e.to_string()))
}

fn write_error(path: &Path, source: io::Error) -> Error {
    Error::CacheWrite {
        path: path.to_path_buf(),
        source,
    }
}

fn encode_field<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode_field<T: for<'de> Deserialize<'de>>(path: &Path, json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| Error::cache_load(path, e.to_string()))
}

/// 16 hex chars, monotonic enough to sort newest-last.
fn new_generation_name() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let salt = COUNTER.fetch_add(1, Ordering::Relaxed) as u64;
    format!("{:016x}", nanos.wrapping_add(salt))
}

fn content_hashed_name(href: &str, data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    match href.rsplit_once('.') {
        Some((_, ext)) if ext.len() <= 5 => format!("{hash}.{ext}"),
        _ => hash,
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{ContainerInfo, TocEntry};

    fn sample_book(sha: &str) -> Book {
        let mut chapter = Chapter::new(0, "OEBPS/ch1.xhtml");
        chapter.title = Some("One".to_string());
        chapter.raw_xhtml = "<html><body><p>hello</p></body></html>".to_string();
        let mut second = Chapter::new(1, "OEBPS/ch2.xhtml");
        second.raw_xhtml = "<html><body><p>world</p></body></html>".to_string();

        Book {
            title: "Sample".to_string(),
            language: "en_EN".to_string(),
            authors: vec!["A. Author".to_string()],
            metadata: BTreeMap::from([("publisher".to_string(), "Press".to_string())]),
            opf_path: "OEBPS/content.opf".to_string(),
            spine: vec!["OEBPS/ch1.xhtml".into(), "OEBPS/ch2.xhtml".into()],
            container: ContainerInfo {
                path: "META-INF/container.xml".into(),
                xml: "<container/>".into(),
            },
            chapters: vec![chapter, second],
            toc: vec![{
                let mut e = TocEntry::new("One", "OEBPS/ch1.xhtml", 0);
                e.chapter_index = Some(0);
                e.navigable = true;
                e
            }],
            resources: BTreeMap::from([(
                "OEBPS/cover.png".to_string(),
                Resource {
                    data: vec![1, 2, 3],
                    media_type: "image/png".to_string(),
                },
            )]),
            source: SourceInfo {
                path: PathBuf::from("/books/sample.epub"),
                sha256: sha.to_string(),
                mtime: 100,
            },
        }
    }

    const SHA: &str = "aaaabbbbccccdddd0000111122223333aaaabbbbccccdddd0000111122223333";

    #[test]
    fn store_and_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let book = sample_book(SHA);

        store.store_payload(&book).unwrap();
        let loaded = store.fetch_payload(SHA).unwrap().expect("cached book");

        assert_eq!(loaded.title, "Sample");
        assert_eq!(loaded.authors, book.authors);
        assert_eq!(loaded.chapters.len(), 2);
        assert_eq!(loaded.chapters[0].raw_xhtml, book.chapters[0].raw_xhtml);
        assert_eq!(loaded.chapters[1].file_path, "OEBPS/ch2.xhtml");
        assert_eq!(loaded.toc, book.toc);
        assert_eq!(loaded.source.sha256, SHA);
        assert_eq!(loaded.resources["OEBPS/cover.png"].data, vec![1, 2, 3]);
    }

    #[test]
    fn manifest_has_one_row_per_book() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let book = sample_book(SHA);

        store.store_payload(&book).unwrap();
        store.store_payload(&book).unwrap();
        let rows = store.list_books();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_sha, SHA);

        store.delete(SHA).unwrap();
        assert!(store.list_books().is_empty());
        assert!(store.fetch_payload(SHA).unwrap().is_none());
    }

    #[test]
    fn restore_replaces_old_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mut book = sample_book(SHA);
        store.store_payload(&book).unwrap();

        book.chapters[0].raw_xhtml = "<html><body><p>edited</p></body></html>".into();
        store.store_payload(&book).unwrap();

        let gen_root = dir.path().join(sha_dir_name(SHA)).join("chapters");
        let generations: Vec<_> = fs::read_dir(&gen_root).unwrap().flatten().collect();
        assert_eq!(generations.len(), 1, "old generation should be removed");

        let loaded = store.fetch_payload(SHA).unwrap().unwrap();
        assert!(loaded.chapters[0].raw_xhtml.contains("edited"));
    }

    #[test]
    fn incomplete_generation_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let book = sample_book(SHA);
        store.store_payload(&book).unwrap();

        // Simulate a crash mid-store: raw files present, no index.json.
        let gen_root = dir.path().join(sha_dir_name(SHA)).join("chapters");
        let broken = gen_root.join("ffffffffffffffff");
        fs::create_dir_all(broken.join("raw")).unwrap();
        fs::write(broken.join("raw").join("000000.xhtml"), "partial").unwrap();

        let loaded = store.fetch_payload(SHA).unwrap().unwrap();
        assert_eq!(loaded.chapters[0].raw_xhtml, book.chapters[0].raw_xhtml);
    }

    #[test]
    fn generation_missing_raw_file_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let book = sample_book(SHA);
        store.store_payload(&book).unwrap();

        // A newer generation whose index claims two chapters but only
        // ships one raw file.
        let gen_root = dir.path().join(sha_dir_name(SHA)).join("chapters");
        let broken = gen_root.join("ffffffffffffffff");
        fs::create_dir_all(broken.join("raw")).unwrap();
        fs::write(broken.join("raw").join("000000.xhtml"), "only one").unwrap();
        fs::write(
            broken.join("index.json"),
            r#"[{"position":0},{"position":1}]"#,
        )
        .unwrap();

        let loaded = store.fetch_payload(SHA).unwrap().unwrap();
        assert_eq!(loaded.chapters.len(), 2);
        assert_eq!(loaded.chapters[0].raw_xhtml, book.chapters[0].raw_xhtml);
    }

    #[test]
    fn layouts_round_trip_and_validate_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store
            .store_layout(SHA, "w80_single_normal", "[]".to_string())
            .unwrap();

        let record = store.fetch_layout(SHA, "w80_single_normal").unwrap();
        assert_eq!(record.payload_json, "[]");
        assert!(store.fetch_layout(SHA, "w40_single_normal").is_none());
    }

    #[test]
    fn stale_versions_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store.store_payload(&sample_book(SHA)).unwrap();

        let row_path = dir.path().join(sha_dir_name(SHA)).join("book.json");
        let mut row: BookRow =
            serde_json::from_slice(&fs::read(&row_path).unwrap()).unwrap();
        row.payload_version = PAYLOAD_VERSION + 1;
        fs::write(&row_path, serde_json::to_vec(&row).unwrap()).unwrap();

        assert!(store.fetch_payload(SHA).unwrap().is_none());
    }

    #[test]
    fn no_tmp_files_survive_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store.store_payload(&sample_book(SHA)).unwrap();

        let mut pending = vec![dir.path().to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in fs::read_dir(&current).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    assert!(
                        !path.to_string_lossy().ends_with(".tmp"),
                        "leftover tmp file: {path:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn legacy_manifest_removed_after_write() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LEGACY_MANIFEST_FILE), "[]").unwrap();
        let store = CacheStore::new(dir.path());
        store.store_payload(&sample_book(SHA)).unwrap();
        assert!(!dir.path().join(LEGACY_MANIFEST_FILE).exists());
        assert!(dir.path().join(MANIFEST_FILE).exists());
    }
}
