//! Navigation document parsing: NCX and EPUB3 XHTML nav.
//!
//! Produces flattened [`TocEntry`] lists with nesting depth. Placeholder
//! labels (`c01` and friends) are repaired after ingestion by borrowing
//! heading text from the target chapter, each heading used at most once.

use std::collections::HashMap;
use std::sync::OnceLock;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;

use crate::book::{Chapter, TocEntry};
use crate::epub::{local_name, resolve_entity, resolve_relative};
use crate::error::{Error, Result};

/// Which navigation dialect a document uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavDialect {
    Ncx,
    XhtmlNav,
}

/// Parse a navigation document into flattened TOC entries with hrefs
/// resolved relative to the OPF directory.
pub fn parse_navigation(content: &str, dialect: NavDialect, opf_dir: &str) -> Result<Vec<TocEntry>> {
    match dialect {
        NavDialect::Ncx => parse_ncx(content, opf_dir),
        NavDialect::XhtmlNav => parse_xhtml_nav(content, opf_dir),
    }
}

/// NCX: `<navMap><navPoint><navLabel><text>` + `<content src>`.
/// Each navPoint's label and content precede its child navPoints, so
/// entries are emitted in document order with the running depth.
fn parse_ncx(content: &str, opf_dir: &str) -> Result<Vec<TocEntry>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut in_text = false;
    let mut label = String::new();
    let mut pending_label: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"navPoint" => depth += 1,
                    b"text" => {
                        in_text = true;
                        label.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_text {
                    label.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_text {
                    label.push_str(resolve_entity(&String::from_utf8_lossy(e.as_ref())));
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name();
                if local_name(name.as_ref()) == b"content" && depth > 0 {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"src" {
                            let src = String::from_utf8_lossy(&attr.value).into_owned();
                            let title = pending_label.take().unwrap_or_default();
                            entries.push(TocEntry::new(
                                title.trim(),
                                resolve_with_fragment(opf_dir, &src),
                                depth - 1,
                            ));
                        }
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"navPoint" => depth = depth.saturating_sub(1),
                    b"text" => {
                        in_text = false;
                        pending_label = Some(label.clone());
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    Ok(entries)
}

/// EPUB3 nav: `<nav epub:type="toc"><ol><li><a href>`. Nesting depth is
/// the count of enclosing `ol` elements.
fn parse_xhtml_nav(content: &str, opf_dir: &str) -> Result<Vec<TocEntry>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut in_toc_nav = false;
    let mut nav_depth = 0usize;
    let mut ol_depth = 0usize;
    let mut in_anchor = false;
    let mut anchor_href = String::new();
    let mut anchor_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"nav" => {
                        nav_depth += 1;
                        if !in_toc_nav && nav_is_toc(&e) {
                            in_toc_nav = true;
                        }
                    }
                    b"ol" if in_toc_nav => ol_depth += 1,
                    b"a" if in_toc_nav => {
                        in_anchor = true;
                        anchor_text.clear();
                        anchor_href.clear();
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"href" {
                                anchor_href =
                                    String::from_utf8_lossy(&attr.value).into_owned();
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_anchor {
                    anchor_text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_anchor {
                    anchor_text.push_str(resolve_entity(&String::from_utf8_lossy(e.as_ref())));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"nav" => {
                        nav_depth = nav_depth.saturating_sub(1);
                        if nav_depth == 0 {
                            in_toc_nav = false;
                        }
                    }
                    b"ol" if in_toc_nav => ol_depth = ol_depth.saturating_sub(1),
                    b"a" if in_anchor => {
                        in_anchor = false;
                        if !anchor_href.is_empty() {
                            entries.push(TocEntry::new(
                                anchor_text.trim(),
                                resolve_with_fragment(opf_dir, &anchor_href),
                                ol_depth.saturating_sub(1),
                            ));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    Ok(entries)
}

fn nav_is_toc(e: &quick_xml::events::BytesStart<'_>) -> bool {
    for attr in e.attributes().flatten() {
        let key = attr.key;
        let local = local_name(key.as_ref());
        if local == b"type" || local == b"role" {
            let value = String::from_utf8_lossy(&attr.value).to_lowercase();
            if value.contains("toc") {
                return true;
            }
        }
    }
    false
}

/// Resolve an href keeping its `#fragment` intact.
fn resolve_with_fragment(opf_dir: &str, href: &str) -> String {
    match href.split_once('#') {
        Some((path, frag)) if !path.is_empty() => {
            format!("{}#{frag}", resolve_relative(opf_dir, path))
        }
        Some((_, frag)) => format!("#{frag}"),
        None => resolve_relative(opf_dir, href),
    }
}

// ============================================================================
// Placeholder label repair
// ============================================================================

/// A heading extracted from a chapter body, with every anchor id seen
/// on or inside the heading element.
#[derive(Debug, Clone)]
pub struct Heading {
    pub text: String,
    pub ids: Vec<String>,
    used: bool,
}

fn placeholder_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:c|ch|chap|chapter|part|section)?[-_ ]?\d+$").expect("static regex")
    })
}

/// Whether a nav label is a generated placeholder (`c01`, `chapter-3`, ...).
pub fn is_placeholder_label(label: &str) -> bool {
    let trimmed = label.trim();
    trimmed.is_empty() || placeholder_pattern().is_match(trimmed)
}

/// Scan a chapter body for `h1`–`h6` heading text and their anchor ids.
pub fn extract_headings(xhtml: &str) -> Vec<Heading> {
    let mut reader = Reader::from_str(xhtml);
    reader.config_mut().trim_text(true);

    let mut headings = Vec::new();
    let mut heading_depth = 0usize;
    let mut text = String::new();
    let mut ids = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref()).to_ascii_lowercase();
                if matches!(
                    local.as_slice(),
                    b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6"
                ) {
                    heading_depth += 1;
                    if heading_depth == 1 {
                        text.clear();
                        ids.clear();
                    }
                }
                if heading_depth > 0 {
                    collect_anchor_ids(&e, &mut ids);
                }
            }
            Ok(Event::Empty(e)) => {
                if heading_depth > 0 {
                    collect_anchor_ids(&e, &mut ids);
                }
            }
            Ok(Event::Text(e)) => {
                if heading_depth > 0 {
                    text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if heading_depth > 0 {
                    text.push_str(resolve_entity(&String::from_utf8_lossy(e.as_ref())));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref()).to_ascii_lowercase();
                if matches!(
                    local.as_slice(),
                    b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6"
                ) {
                    heading_depth = heading_depth.saturating_sub(1);
                    if heading_depth == 0 {
                        let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                        if !trimmed.is_empty() {
                            headings.push(Heading {
                                text: trimmed,
                                ids: std::mem::take(&mut ids),
                                used: false,
                            });
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            // Heading extraction is a best-effort repair pass.
            Err(_) => break,
            _ => {}
        }
    }

    headings
}

fn collect_anchor_ids(e: &quick_xml::events::BytesStart<'_>, ids: &mut Vec<String>) {
    for attr in e.attributes().flatten() {
        let key = local_name(attr.key.as_ref());
        if key == b"id" || key == b"name" {
            ids.push(String::from_utf8_lossy(&attr.value).into_owned());
        }
    }
}

/// Replace placeholder TOC titles with heading text from the target
/// chapter. Anchor-matched headings win; otherwise headings are popped
/// front-to-back, so each is used at most once per document.
pub fn repair_placeholder_titles(toc: &mut [TocEntry], chapters: &[Chapter]) {
    let mut queues: HashMap<usize, Vec<Heading>> = HashMap::new();

    for entry in toc.iter_mut() {
        if !is_placeholder_label(&entry.title) {
            continue;
        }
        let Some(chapter_index) = entry.chapter_index else {
            continue;
        };
        let Some(chapter) = chapters.get(chapter_index) else {
            continue;
        };

        let queue = queues
            .entry(chapter_index)
            .or_insert_with(|| extract_headings(&chapter.raw_xhtml));

        let fragment = entry.href.split_once('#').map(|(_, f)| f);
        let slot = match fragment {
            Some(frag) => queue
                .iter()
                .position(|h| !h.used && h.ids.iter().any(|id| id == frag))
                .or_else(|| queue.iter().position(|h| !h.used)),
            None => queue.iter().position(|h| !h.used),
        };

        if let Some(index) = slot {
            let heading = &mut queue[index];
            heading.used = true;
            entry.title = heading.text.clone();
        }
    }
}
