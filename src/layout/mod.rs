//! Formatting and pagination: semantic blocks to wrapped display lines,
//! display lines to pages.

pub mod format;
pub mod paginate;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::book::TextSegment;

pub use format::{FormatOptions, format_chapter};
pub use paginate::{
    AbsolutePagination, ChapterCursor, DynamicPagination, LayoutMetrics, Page,
    adjust_for_line_spacing,
};

/// Reading layout: one wide column or two side-by-side columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Single,
    Split,
}

impl ViewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewMode::Single => "single",
            ViewMode::Split => "split",
        }
    }
}

/// Vertical rhythm applied during pagination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSpacing {
    Compact,
    #[default]
    Normal,
    Relaxed,
}

impl LineSpacing {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineSpacing::Compact => "compact",
            LineSpacing::Normal => "normal",
            LineSpacing::Relaxed => "relaxed",
        }
    }
}

/// Page numbering policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageNumbering {
    /// Page list recomputed per terminal size, spanning the whole book.
    #[default]
    Dynamic,
    /// One or more pages per chapter, stable across sizes.
    Absolute,
}

/// Block type tag carried into display lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Heading,
    Paragraph,
    ListItem,
    Quote,
    Code,
    Table,
    Separator,
    Image,
    Spacer,
}

/// Terminal-graphics placement reserved for an image block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePlacement {
    pub src: String,
    pub alt: String,
    pub cols: usize,
    pub rows: usize,
    pub placement_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_offset: Option<usize>,
}

/// Per-line metadata consumed by pagination, rendering and selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMeta {
    pub kind: Option<LineKind>,
    pub chapter_index: usize,
    pub chapter_path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub spacer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePlacement>,
    /// Continuation indent for wrapped list items, in cells.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_indent: Option<usize>,
}

/// The quantum of pagination and geometry: one wrapped, styled line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayLine {
    /// Plain text, no ANSI.
    pub text: String,
    pub segments: Vec<TextSegment>,
    pub meta: LineMeta,
}

impl DisplayLine {
    pub fn spacer(chapter_index: usize, chapter_path: &str) -> Self {
        Self {
            meta: LineMeta {
                kind: Some(LineKind::Spacer),
                chapter_index,
                chapter_path: chapter_path.to_string(),
                spacer: true,
                ..LineMeta::default()
            },
            ..Self::default()
        }
    }
}

// ============================================================================
// Bounded layout cache
// ============================================================================

/// Key for a cached per-chapter layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutCacheKey {
    pub sha: String,
    pub chapter_index: usize,
    pub width: usize,
    pub view_mode: ViewMode,
    pub line_spacing: LineSpacing,
}

/// LRU over formatted chapters, evicted by an approximate byte budget
/// rather than entry count.
pub struct LayoutCache {
    entries: LruCache<LayoutCacheKey, Vec<DisplayLine>>,
    budget_bytes: usize,
    used_bytes: usize,
}

impl LayoutCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            budget_bytes,
            used_bytes: 0,
        }
    }

    pub fn get(&mut self, key: &LayoutCacheKey) -> Option<&Vec<DisplayLine>> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: LayoutCacheKey, lines: Vec<DisplayLine>) {
        let cost = approx_cost(&lines);
        if let Some(old) = self.entries.put(key, lines) {
            self.used_bytes = self.used_bytes.saturating_sub(approx_cost(&old));
        }
        self.used_bytes += cost;
        while self.used_bytes > self.budget_bytes && self.entries.len() > 1 {
            if let Some((_, evicted)) = self.entries.pop_lru() {
                self.used_bytes = self.used_bytes.saturating_sub(approx_cost(&evicted));
            } else {
                break;
            }
        }
    }

    /// Drop every entry for widths other than the active one.
    pub fn retain_width(&mut self, width: usize) {
        let stale: Vec<LayoutCacheKey> = self
            .entries
            .iter()
            .filter(|(k, _)| k.width != width)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(evicted) = self.entries.pop(&key) {
                self.used_bytes = self.used_bytes.saturating_sub(approx_cost(&evicted));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn approx_cost(lines: &[DisplayLine]) -> usize {
    lines
        .iter()
        .map(|l| {
            64 + l.text.len()
                + l.meta.chapter_path.len()
                + l.segments.iter().map(|s| 32 + s.text.len()).sum::<usize>()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(chapter: usize, width: usize) -> LayoutCacheKey {
        LayoutCacheKey {
            sha: "s".into(),
            chapter_index: chapter,
            width,
            view_mode: ViewMode::Single,
            line_spacing: LineSpacing::Normal,
        }
    }

    fn lines_of(total_text: usize) -> Vec<DisplayLine> {
        vec![DisplayLine {
            text: "x".repeat(total_text),
            ..DisplayLine::default()
        }]
    }

    #[test]
    fn cache_evicts_by_byte_budget() {
        let mut cache = LayoutCache::new(1000);
        for i in 0..10 {
            cache.put(key(i, 80), lines_of(300));
        }
        assert!(cache.len() < 10);
        // The most recent entry always survives.
        assert!(cache.get(&key(9, 80)).is_some());
    }

    #[test]
    fn width_change_evicts_other_widths() {
        let mut cache = LayoutCache::new(100_000);
        cache.put(key(0, 80), lines_of(10));
        cache.put(key(1, 80), lines_of(10));
        cache.put(key(0, 40), lines_of(10));
        cache.retain_width(40);
        assert!(cache.get(&key(0, 80)).is_none());
        assert!(cache.get(&key(0, 40)).is_some());
    }
}
