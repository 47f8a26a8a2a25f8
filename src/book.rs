//! Core data types for an ingested book.
//!
//! This module provides:
//! - The session-immutable [`Book`] model produced by ingestion
//! - [`Chapter`] payloads with raw XHTML and lazily derived blocks
//! - The semantic [`ContentBlock`] tree chapter bodies parse into
//! - Hierarchical [`TocEntry`] navigation labels

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ============================================================================
// Source identity
// ============================================================================

/// Identity of the archive a book was ingested from.
///
/// The sha256 of the archive bytes is the cache key; path and mtime are
/// advisory and only used for staleness checks on pointer files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub sha256: String,
    pub mtime: i64,
}

// ============================================================================
// Blocks and segments
// ============================================================================

/// Inline image reference carried by a text segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    pub src: String,
    pub alt: String,
}

/// Style set attached to a run of text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStyles {
    #[serde(default, skip_serializing_if = "is_false")]
    pub bold: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub italic: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub underline: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub code: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub quote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_image: Option<InlineImage>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub preserve_whitespace: bool,
    /// Marks a forced line break derived from `<br>`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub line_break: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl SegmentStyles {
    /// True when no style bit is set.
    pub fn is_plain(&self) -> bool {
        *self == SegmentStyles::default()
    }
}

/// A run of text with one style set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    pub text: String,
    pub styles: SegmentStyles,
}

impl TextSegment {
    pub fn new(text: impl Into<String>, styles: SegmentStyles) -> Self {
        Self {
            text: text.into(),
            styles,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, SegmentStyles::default())
    }
}

/// Semantic kind of a content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Heading {
        level: u8,
    },
    Paragraph,
    ListItem {
        level: usize,
        marker: String,
        ordered: bool,
    },
    Quote,
    Code,
    Table,
    Separator,
    Break,
    Image {
        src: String,
        alt: String,
    },
}

impl BlockKind {
    /// Blocks whose text is kept verbatim (no collapse, no wrap).
    pub fn preserves_whitespace(&self) -> bool {
        matches!(self, BlockKind::Code | BlockKind::Table)
    }
}

/// One block of the parsed chapter body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub kind: BlockKind,
    pub segments: Vec<TextSegment>,
}

impl ContentBlock {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            segments: Vec::new(),
        }
    }

    pub fn with_segments(kind: BlockKind, segments: Vec<TextSegment>) -> Self {
        Self { kind, segments }
    }

    /// Concatenated plain text of all segments.
    pub fn plain_text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// True when the block carries no visible text and is not structural.
    pub fn is_empty_text(&self) -> bool {
        match self.kind {
            BlockKind::Separator | BlockKind::Break | BlockKind::Image { .. } => false,
            _ => self
                .segments
                .iter()
                .all(|s| s.text.trim().is_empty() && s.styles.inline_image.is_none()),
        }
    }
}

// ============================================================================
// Chapters
// ============================================================================

/// A spine chapter. `raw_xhtml` is always present; `blocks` is derived
/// lazily by the parser and cached by the formatting layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chapter {
    /// 0-based spine position.
    pub position: usize,
    /// 1-based chapter number used in progress displays.
    pub number: usize,
    pub title: Option<String>,
    /// Archive path the chapter body was read from. Unique per book.
    pub file_path: String,
    pub raw_xhtml: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Vec<ContentBlock>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Chapter {
    pub fn new(position: usize, file_path: impl Into<String>) -> Self {
        Self {
            position,
            number: position + 1,
            file_path: file_path.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Table of contents
// ============================================================================

/// A table of contents entry, flattened with nesting depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    /// Href resolved relative to the OPF directory; may carry a fragment.
    pub href: String,
    /// Nesting depth, 0 for top-level entries.
    pub level: usize,
    /// Spine index the entry resolves to, when it does.
    pub chapter_index: Option<usize>,
    /// Whether activating the entry jumps anywhere. Part headings without
    /// a resolvable target stay in the list as non-navigable ancestors.
    pub navigable: bool,
}

impl TocEntry {
    pub fn new(title: impl Into<String>, href: impl Into<String>, level: usize) -> Self {
        Self {
            title: title.into(),
            href: href.into(),
            level,
            chapter_index: None,
            navigable: false,
        }
    }
}

// ============================================================================
// Book
// ============================================================================

/// A binary resource (cover, image, font) carried by the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// Container descriptor kept for cache round-trips.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub path: String,
    pub xml: String,
}

/// The session-immutable book model produced by ingestion.
///
/// Invariants: `chapters[i].position == i`, chapter `file_path`s are unique,
/// `spine` order matches chapter numbering, and every navigable TOC entry's
/// `chapter_index` points into `chapters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    pub language: String,
    pub authors: Vec<String>,
    /// Free-form metadata collected from the OPF `metadata` element.
    pub metadata: BTreeMap<String, String>,
    /// Package document path inside the archive.
    pub opf_path: String,
    /// Chapter hrefs in reading order.
    pub spine: Vec<String>,
    pub container: ContainerInfo,
    pub chapters: Vec<Chapter>,
    pub toc: Vec<TocEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Resource>,
    pub source: SourceInfo,
}

impl Book {
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder book used when the archive has no usable package document.
    pub fn empty_placeholder(source: SourceInfo) -> Self {
        let mut chapter = Chapter::new(0, "placeholder.xhtml");
        chapter.title = Some("Empty Book".to_string());
        chapter.raw_xhtml =
            "<html><body><p>This book could not be opened.</p></body></html>".to_string();
        Self {
            title: "Empty Book".to_string(),
            language: "en_EN".to_string(),
            spine: vec![chapter.file_path.clone()],
            chapters: vec![chapter],
            source,
            ..Self::default()
        }
    }

    /// Look up a chapter index by archive path, ignoring any `#fragment`.
    pub fn chapter_index_for_href(&self, href: &str) -> Option<usize> {
        let path = href.split('#').next().unwrap_or(href);
        self.chapters
            .iter()
            .position(|c| c.file_path == path)
            .or_else(|| {
                // Tolerate hrefs that differ only by leading directories.
                self.chapters
                    .iter()
                    .position(|c| c.file_path.ends_with(path) || path.ends_with(&c.file_path))
            })
    }
}
