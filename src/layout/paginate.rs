//! Pagination: display lines to pages under two numbering policies.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::layout::{LineSpacing, ViewMode};

/// Header, footer and padding rows reserved around the content region.
const CHROME_ROWS: u16 = 4;

/// Terminal-derived layout quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutMetrics {
    pub term_width: u16,
    pub term_height: u16,
    /// Rows available to content.
    pub content_height: usize,
    /// Text column width in cells.
    pub column_width: usize,
    /// Lines of text that fit one page after line-spacing adjustment.
    pub displayable_lines: usize,
}

impl LayoutMetrics {
    pub fn compute(
        term_width: u16,
        term_height: u16,
        view_mode: ViewMode,
        line_spacing: LineSpacing,
    ) -> Self {
        let content_height = term_height.saturating_sub(CHROME_ROWS).max(1) as usize;
        let column_width = match view_mode {
            ViewMode::Single => single_column_width(term_width),
            ViewMode::Split => split_column_width(term_width),
        };
        Self {
            term_width,
            term_height,
            content_height,
            column_width,
            displayable_lines: adjust_for_line_spacing(content_height, line_spacing),
        }
    }
}

/// `clamp(floor(term_width * 0.9), 30, 120)`
pub fn single_column_width(term_width: u16) -> usize {
    ((term_width as f64 * 0.9).floor() as usize).clamp(30, 120)
}

/// `max(floor((max(term_width - 4, 40) - 4) / 2), 20)`
pub fn split_column_width(term_width: u16) -> usize {
    let usable = (term_width.saturating_sub(4)).max(40) as usize;
    ((usable - 4) / 2).max(20)
}

/// Lines of content that fit a page at the given spacing.
pub fn adjust_for_line_spacing(content_height: usize, spacing: LineSpacing) -> usize {
    let adjusted = match spacing {
        LineSpacing::Compact => content_height,
        LineSpacing::Normal => (content_height as f64 * 0.75).floor() as usize,
        // A blank row between every pair of lines.
        LineSpacing::Relaxed => content_height.div_ceil(2),
    };
    adjusted.max(1)
}

// ============================================================================
// Absolute pagination
// ============================================================================

/// Per-chapter paging: each chapter is `ceil(lines / page_height)` pages
/// and navigation scrolls inside the chapter by whole pages.
#[derive(Debug, Clone, Default)]
pub struct AbsolutePagination {
    chapter_lines: Vec<usize>,
    pages_per_chapter: Vec<usize>,
    page_height: usize,
}

/// A scroll cursor into a chapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterCursor {
    pub chapter: usize,
    pub line_offset: usize,
}

impl AbsolutePagination {
    pub fn build(chapter_lines: Vec<usize>, page_height: usize) -> Self {
        let page_height = page_height.max(1);
        let pages_per_chapter = chapter_lines
            .iter()
            .map(|&lines| lines.div_ceil(page_height).max(1))
            .collect();
        Self {
            chapter_lines,
            pages_per_chapter,
            page_height,
        }
    }

    /// The page map used by progress displays.
    pub fn page_map(&self) -> &[usize] {
        &self.pages_per_chapter
    }

    pub fn total_pages(&self) -> usize {
        self.pages_per_chapter.iter().sum()
    }

    pub fn page_height(&self) -> usize {
        self.page_height
    }

    /// 1-based page number of the cursor within its chapter.
    pub fn page_within_chapter(&self, cursor: ChapterCursor) -> usize {
        cursor.line_offset / self.page_height + 1
    }

    pub fn next_page(&self, cursor: ChapterCursor) -> ChapterCursor {
        let lines = self
            .chapter_lines
            .get(cursor.chapter)
            .copied()
            .unwrap_or(0);
        let next = cursor.line_offset + self.page_height;
        if next < lines {
            ChapterCursor {
                chapter: cursor.chapter,
                line_offset: next,
            }
        } else if cursor.chapter + 1 < self.chapter_lines.len() {
            ChapterCursor {
                chapter: cursor.chapter + 1,
                line_offset: 0,
            }
        } else {
            cursor
        }
    }

    pub fn prev_page(&self, cursor: ChapterCursor) -> ChapterCursor {
        if cursor.line_offset >= self.page_height {
            return ChapterCursor {
                chapter: cursor.chapter,
                line_offset: cursor.line_offset - self.page_height,
            };
        }
        if cursor.line_offset > 0 {
            return ChapterCursor {
                chapter: cursor.chapter,
                line_offset: 0,
            };
        }
        if cursor.chapter == 0 {
            return cursor;
        }
        // Land on the last page boundary of the previous chapter.
        let chapter = cursor.chapter - 1;
        let lines = self.chapter_lines.get(chapter).copied().unwrap_or(0);
        let last_page = lines.saturating_sub(1) / self.page_height;
        ChapterCursor {
            chapter,
            line_offset: last_page * self.page_height,
        }
    }

    pub fn next_chapter(&self, cursor: ChapterCursor) -> ChapterCursor {
        if cursor.chapter + 1 < self.chapter_lines.len() {
            ChapterCursor {
                chapter: cursor.chapter + 1,
                line_offset: 0,
            }
        } else {
            cursor
        }
    }

    pub fn prev_chapter(&self, cursor: ChapterCursor) -> ChapterCursor {
        ChapterCursor {
            chapter: cursor.chapter.saturating_sub(1),
            line_offset: 0,
        }
    }
}

// ============================================================================
// Dynamic pagination
// ============================================================================

/// One page of the book-wide dynamic page list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub chapter_index: usize,
    pub line_start: usize,
    pub line_end: usize,
}

/// Book-wide ordered page list, rebuilt on terminal size or spacing
/// changes.
#[derive(Debug, Clone, Default)]
pub struct DynamicPagination {
    pages: Vec<Page>,
    chapter_first_page: Vec<usize>,
}

impl DynamicPagination {
    /// Build the page list. Checks the cancellation flag before each
    /// chapter and returns `None` when interrupted.
    pub fn build(
        chapter_lines: &[usize],
        page_height: usize,
        cancelled: &AtomicBool,
    ) -> Option<Self> {
        let page_height = page_height.max(1);
        let mut pages = Vec::new();
        let mut chapter_first_page = Vec::with_capacity(chapter_lines.len());

        for (chapter_index, &lines) in chapter_lines.iter().enumerate() {
            if cancelled.load(Ordering::Relaxed) {
                return None;
            }
            chapter_first_page.push(pages.len());
            if lines == 0 {
                pages.push(Page {
                    chapter_index,
                    line_start: 0,
                    line_end: 0,
                });
                continue;
            }
            let mut start = 0;
            while start < lines {
                let end = (start + page_height).min(lines);
                pages.push(Page {
                    chapter_index,
                    line_start: start,
                    line_end: end,
                });
                start = end;
            }
        }

        Some(Self {
            pages,
            chapter_first_page,
        })
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, index: usize) -> Option<Page> {
        self.pages.get(index).copied()
    }

    pub fn chapter_at(&self, page_index: usize) -> Option<usize> {
        self.pages.get(page_index).map(|p| p.chapter_index)
    }

    /// First page whose chapter index equals `chapter`.
    pub fn page_for_chapter(&self, chapter: usize) -> Option<usize> {
        self.chapter_first_page.get(chapter).copied()
    }

    /// First page of the chapter after the given page's chapter.
    pub fn next_chapter_page(&self, page_index: usize) -> Option<usize> {
        let chapter = self.chapter_at(page_index)?;
        self.page_for_chapter(chapter + 1)
    }

    /// Page containing the given chapter line, for progress restore.
    pub fn page_at_line(&self, chapter: usize, line: usize) -> Option<usize> {
        let first = self.page_for_chapter(chapter)?;
        self.pages[first..]
            .iter()
            .take_while(|p| p.chapter_index == chapter)
            .position(|p| p.line_start <= line && (line < p.line_end || p.line_end == 0))
            .map(|offset| first + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_formulas() {
        let m = LayoutMetrics::compute(100, 30, ViewMode::Single, LineSpacing::Compact);
        assert_eq!(m.content_height, 26);
        assert_eq!(m.column_width, 90);
        assert_eq!(m.displayable_lines, 26);

        // Single column clamps to [30, 120].
        assert_eq!(single_column_width(20), 30);
        assert_eq!(single_column_width(200), 120);

        // Split columns never drop below 20 cells.
        assert_eq!(split_column_width(100), 46);
        assert_eq!(split_column_width(30), 20);

        // Tiny terminals still get one content row.
        let tiny = LayoutMetrics::compute(10, 3, ViewMode::Single, LineSpacing::Compact);
        assert_eq!(tiny.content_height, 1);
    }

    #[test]
    fn line_spacing_adjustment() {
        assert_eq!(adjust_for_line_spacing(20, LineSpacing::Compact), 20);
        assert_eq!(adjust_for_line_spacing(20, LineSpacing::Normal), 15);
        assert_eq!(adjust_for_line_spacing(21, LineSpacing::Relaxed), 11);
        assert_eq!(adjust_for_line_spacing(1, LineSpacing::Normal), 1);
    }

    #[test]
    fn absolute_page_map() {
        let pagination = AbsolutePagination::build(vec![25, 10, 0], 10);
        assert_eq!(pagination.page_map(), &[3, 1, 1]);
        assert_eq!(pagination.total_pages(), 5);
    }

    #[test]
    fn absolute_navigation_scrolls_then_jumps() {
        let pagination = AbsolutePagination::build(vec![25, 10], 10);
        let mut cursor = ChapterCursor::default();

        cursor = pagination.next_page(cursor);
        assert_eq!(cursor, ChapterCursor { chapter: 0, line_offset: 10 });
        cursor = pagination.next_page(cursor);
        assert_eq!(cursor, ChapterCursor { chapter: 0, line_offset: 20 });
        cursor = pagination.next_page(cursor);
        assert_eq!(cursor, ChapterCursor { chapter: 1, line_offset: 0 });

        cursor = pagination.prev_page(cursor);
        assert_eq!(cursor, ChapterCursor { chapter: 0, line_offset: 20 });

        let jumped = pagination.next_chapter(ChapterCursor::default());
        assert_eq!(jumped, ChapterCursor { chapter: 1, line_offset: 0 });
        assert_eq!(pagination.prev_chapter(jumped), ChapterCursor::default());
    }

    #[test]
    fn dynamic_pages_cover_every_line_without_overlap() {
        let lines = vec![23, 7, 0, 40];
        let flag = AtomicBool::new(false);
        let pagination = DynamicPagination::build(&lines, 10, &flag).unwrap();

        for (chapter, &count) in lines.iter().enumerate() {
            let mut covered = vec![false; count];
            for page in pagination.pages().iter().filter(|p| p.chapter_index == chapter) {
                for line in page.line_start..page.line_end {
                    assert!(!covered[line], "line {line} covered twice");
                    covered[line] = true;
                }
            }
            assert!(covered.into_iter().all(|c| c), "chapter {chapter} has gaps");
        }
    }

    #[test]
    fn chapter_navigation_round_trips() {
        let lines = vec![23, 7, 40];
        let flag = AtomicBool::new(false);
        let pagination = DynamicPagination::build(&lines, 10, &flag).unwrap();

        for p in 0..pagination.len() {
            let chapter = pagination.chapter_at(p).unwrap();
            let first = pagination.page_for_chapter(chapter).unwrap();
            assert_eq!(pagination.chapter_at(first), Some(chapter));
            assert!(first <= p);
            // No earlier page belongs to this chapter.
            if first > 0 {
                assert_ne!(pagination.chapter_at(first - 1), Some(chapter));
            }
        }
    }

    #[test]
    fn rebuild_at_narrower_size_bounds_page_height() {
        let lines = vec![100];
        let flag = AtomicBool::new(false);
        let wide = DynamicPagination::build(&lines, 26, &flag).unwrap();
        let narrow = DynamicPagination::build(&lines, 8, &flag).unwrap();
        assert!(narrow.len() > wide.len());
        for page in narrow.pages() {
            assert!(page.line_end - page.line_start <= 8);
        }
    }

    #[test]
    fn cancellation_aborts_build() {
        let flag = AtomicBool::new(true);
        assert!(DynamicPagination::build(&[10, 10], 5, &flag).is_none());
    }

    #[test]
    fn empty_chapter_still_gets_a_page() {
        let flag = AtomicBool::new(false);
        let pagination = DynamicPagination::build(&[0, 5], 10, &flag).unwrap();
        assert_eq!(pagination.len(), 2);
        assert_eq!(pagination.page_for_chapter(0), Some(0));
        assert_eq!(pagination.page_for_chapter(1), Some(1));
    }

    #[test]
    fn page_at_line_finds_containing_page() {
        let flag = AtomicBool::new(false);
        let pagination = DynamicPagination::build(&[25], 10, &flag).unwrap();
        assert_eq!(pagination.page_at_line(0, 0), Some(0));
        assert_eq!(pagination.page_at_line(0, 14), Some(1));
        assert_eq!(pagination.page_at_line(0, 24), Some(2));
    }
}
