//! Ingestion pipeline: archive path in, [`Book`] model out.

use std::path::Path;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

use crate::book::{Book, Chapter, Resource, SourceInfo, TocEntry};
use crate::epub::nav::{self, NavDialect};
use crate::epub::{package, resolve_relative};
use crate::error::{Error, Result};
use crate::zip::ZipReader;

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Compute the source identity (sha256 + mtime) of an archive on disk.
pub fn digest_source(path: &Path) -> Result<SourceInfo> {
    let bytes = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    Ok(SourceInfo {
        path: path.to_path_buf(),
        sha256,
        mtime: file_mtime(path),
    })
}

pub(crate) fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Ingest an EPUB from disk, computing its identity first.
pub fn ingest_path(path: &Path) -> Result<Book> {
    let source = digest_source(path)?;
    ingest_archive(path, source)
}

/// Ingest an EPUB archive with a precomputed identity.
///
/// Navigation and resources are best-effort; a missing container or
/// package document degrades to the empty-book placeholder so the
/// reader stays usable.
pub fn ingest_archive(path: &Path, source: SourceInfo) -> Result<Book> {
    let mut archive = ZipReader::open(path)?;

    // 1. Locate and parse the package document.
    let container_xml = match archive.read(CONTAINER_PATH) {
        Ok(bytes) => decode_text(&bytes),
        Err(e) => {
            log::warn!("{}: no container.xml ({e}); using placeholder", path.display());
            return Ok(Book::empty_placeholder(source));
        }
    };
    let opf_path = match package::parse_container_xml(&container_xml) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("{}: bad container.xml ({e}); using placeholder", path.display());
            return Ok(Book::empty_placeholder(source));
        }
    };
    let opf_dir = opf_path
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default();

    let opf_xml = match archive.read(&opf_path) {
        Ok(bytes) => decode_text(&bytes),
        Err(e) => {
            log::warn!("{}: missing OPF ({e}); using placeholder", path.display());
            return Ok(Book::empty_placeholder(source));
        }
    };
    let opf = package::parse_opf(&opf_xml)?;

    // 2. Assemble the book shell.
    let mut book = Book::new();
    book.source = source;
    book.opf_path = opf_path.clone();
    book.container = crate::book::ContainerInfo {
        path: CONTAINER_PATH.to_string(),
        xml: container_xml,
    };
    book.title = if opf.metadata.title.is_empty() {
        "Unknown".to_string()
    } else {
        opf.metadata.title.clone()
    };
    book.language = opf.metadata.language.clone();
    book.authors = opf.metadata.authors.clone();
    book.metadata = opf.metadata.misc.clone();
    if let Some(year) = &opf.metadata.year {
        book.metadata.insert("year".to_string(), year.clone());
    }

    // 3. Build chapters in spine order, numbered from 1.
    for id in &opf.spine_ids {
        let Some((href, _media_type)) = opf.manifest.get(id) else {
            log::warn!("spine id '{id}' missing from manifest; skipping");
            continue;
        };
        let full_path = resolve_relative(&opf_dir, href);
        if book.chapters.iter().any(|c| c.file_path == full_path) {
            log::warn!("duplicate spine href '{full_path}'; skipping");
            continue;
        }
        let raw = match archive.read(&full_path) {
            Ok(bytes) => decode_text(&bytes),
            Err(e) => {
                log::warn!("chapter '{full_path}' unreadable: {e}");
                continue;
            }
        };
        let mut chapter = Chapter::new(book.chapters.len(), full_path.clone());
        chapter.raw_xhtml = raw;
        chapter
            .metadata
            .insert("source_path".to_string(), full_path.clone());
        book.spine.push(full_path);
        book.chapters.push(chapter);
    }

    if book.chapters.is_empty() {
        log::warn!("{}: no readable chapters; using placeholder", path.display());
        return Ok(Book::empty_placeholder(book.source));
    }

    // 4. Navigation: EPUB3 nav document first, NCX fallback.
    book.toc = load_navigation(&mut archive, &opf, &opf_dir, &book);
    nav::repair_placeholder_titles(&mut book.toc, &book.chapters);
    apply_toc_titles(&mut book.chapters, &book.toc);

    // 5. Cover and image resources, best-effort.
    collect_resources(&mut archive, &opf, &opf_dir, &mut book);

    Ok(book)
}

fn load_navigation<R: std::io::Read + std::io::Seek>(
    archive: &mut ZipReader<R>,
    opf: &package::OpfData,
    opf_dir: &str,
    book: &Book,
) -> Vec<TocEntry> {
    let candidates = [
        opf.nav_href
            .as_ref()
            .map(|href| (resolve_relative(opf_dir, href), NavDialect::XhtmlNav)),
        opf.ncx_id
            .as_ref()
            .and_then(|id| opf.manifest.get(id))
            .map(|(href, _)| (resolve_relative(opf_dir, href), NavDialect::Ncx)),
    ];

    for (path, dialect) in candidates.into_iter().flatten() {
        let Ok(bytes) = archive.read(&path) else {
            continue;
        };
        match nav::parse_navigation(&decode_text(&bytes), dialect, opf_dir) {
            Ok(mut entries) if !entries.is_empty() => {
                for entry in &mut entries {
                    entry.chapter_index = book.chapter_index_for_href(&entry.href);
                    entry.navigable = entry.chapter_index.is_some();
                }
                return entries;
            }
            Ok(_) => {}
            Err(e) => log::warn!("navigation document '{path}' unparseable: {e}"),
        }
    }

    Vec::new()
}

/// Give chapters their first matching navigable TOC title.
fn apply_toc_titles(chapters: &mut [Chapter], toc: &[TocEntry]) {
    for entry in toc {
        if let Some(index) = entry.chapter_index
            && let Some(chapter) = chapters.get_mut(index)
            && chapter.title.is_none()
            && !entry.title.is_empty()
        {
            chapter.title = Some(entry.title.clone());
        }
    }
}

fn collect_resources<R: std::io::Read + std::io::Seek>(
    archive: &mut ZipReader<R>,
    opf: &package::OpfData,
    opf_dir: &str,
    book: &mut Book,
) {
    let mut wanted: Vec<(String, String)> = Vec::new();
    if let Some(cover) = &opf.cover_href {
        wanted.push((resolve_relative(opf_dir, cover), "cover".to_string()));
    }
    for (href, media_type) in opf.manifest.values() {
        if media_type.starts_with("image/") {
            wanted.push((resolve_relative(opf_dir, href), media_type.clone()));
        }
    }

    for (path, media_type) in wanted {
        if book.resources.contains_key(&path) {
            continue;
        }
        match archive.read(&path) {
            Ok(data) => {
                let media_type = if media_type == "cover" {
                    guess_image_media_type(&path)
                } else {
                    media_type
                };
                book.resources.insert(path, Resource { data, media_type });
            }
            Err(e) => log::debug!("resource '{path}' skipped: {e}"),
        }
    }
}

fn guess_image_media_type(path: &str) -> String {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Decode chapter/package bytes: strip a UTF-8 BOM, fall back to
/// CP1252 when the bytes are not valid UTF-8.
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes
        .strip_prefix(&[0xEF, 0xBB, 0xBF])
        .unwrap_or(bytes);
    let (text, had_errors) = match encoding_rs::UTF_8.decode_without_bom_handling(bytes) {
        (cow, false) => (cow.into_owned(), false),
        (_, true) => {
            let (cow, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            (cow.into_owned(), true)
        }
    };
    if had_errors {
        log::debug!("non-UTF-8 document decoded as CP1252");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_text_strips_bom() {
        let with_bom = [0xEF, 0xBB, 0xBF, b'h', b'i'];
        assert_eq!(decode_text(&with_bom), "hi");
    }

    #[test]
    fn decode_text_falls_back_to_cp1252() {
        // 0x93/0x94 are curly quotes in CP1252 and invalid UTF-8.
        let bytes = [0x93, b'o', b'k', 0x94];
        assert_eq!(decode_text(&bytes), "\u{201C}ok\u{201D}");
    }

    #[test]
    fn digest_is_stable_for_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.epub");
        let b = dir.path().join("b.epub");
        std::fs::write(&a, b"identical bytes").unwrap();
        std::fs::write(&b, b"identical bytes").unwrap();
        let da = digest_source(&a).unwrap();
        let db = digest_source(&b).unwrap();
        assert_eq!(da.sha256, db.sha256);
        assert_eq!(da.sha256.len(), 64);
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let err = digest_source(Path::new("/nonexistent/book.epub")).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
