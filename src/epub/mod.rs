//! EPUB ingestion: package document, navigation, chapter bodies.
//!
//! The submodules parse the three XML dialects an EPUB carries and the
//! [`ingest`] pipeline assembles them into a [`crate::book::Book`].

pub mod content;
pub mod ingest;
pub mod nav;
pub mod package;

pub use content::parse_chapter_blocks;
pub use ingest::{ingest_archive, ingest_path};
pub use nav::{NavDialect, parse_navigation, repair_placeholder_titles};
pub use package::{OpfData, OpfMetadata, parse_container_xml, parse_opf};

/// Extract the local name from a potentially namespaced XML name.
pub(crate) fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

/// Resolve an entity reference to its replacement text.
pub(crate) fn resolve_entity(entity: &str) -> &'static str {
    match entity {
        "apos" => "'",
        "quot" => "\"",
        "lt" => "<",
        "gt" => ">",
        "amp" => "&",
        "nbsp" => "\u{00A0}",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "hellip" => "\u{2026}",
        _ => "",
    }
}

/// Resolve `href` against the directory of the package document,
/// collapsing `.` and `..` segments and percent-decoding.
pub(crate) fn resolve_relative(base_dir: &str, href: &str) -> String {
    let decoded = percent_encoding::percent_decode_str(href)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| href.to_string());

    let mut segments: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for part in decoded.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}
