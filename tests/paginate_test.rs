//! Pagination over formatted books: coverage, round-trips, resize.

mod common;

use std::sync::atomic::AtomicBool;

use common::EpubBuilder;
use shoko::epub::{ingest_path, parse_chapter_blocks};
use shoko::layout::{
    DisplayLine, DynamicPagination, FormatOptions, LayoutMetrics, LineSpacing, ViewMode,
    format_chapter,
};

fn formatted_book(width: usize) -> Vec<Vec<DisplayLine>> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.epub");
    let paragraph = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do \
                     eiusmod tempor incididunt ut labore et dolore magna aliqua. "
        .repeat(4);
    EpubBuilder::new("Paged")
        .chapter("ch1.xhtml", &format!("<h1>One</h1><p>{paragraph}</p>"))
        .chapter("ch2.xhtml", &format!("<h1>Two</h1><p>{paragraph}</p><p>{paragraph}</p>"))
        .chapter("ch3.xhtml", "<h1>Three</h1><p>short</p>")
        .write_to(&path);

    let book = ingest_path(&path).unwrap();
    book.chapters
        .iter()
        .map(|chapter| {
            let blocks =
                parse_chapter_blocks(&chapter.file_path, &chapter.raw_xhtml).unwrap();
            format_chapter(
                chapter,
                &blocks,
                &FormatOptions {
                    width,
                    ..FormatOptions::default()
                },
            )
        })
        .collect()
}

#[test]
fn dynamic_pages_cover_the_whole_book_exactly_once() {
    let chapter_lines = formatted_book(40);
    let counts: Vec<usize> = chapter_lines.iter().map(Vec::len).collect();
    let cancel = AtomicBool::new(false);
    let pagination = DynamicPagination::build(&counts, 12, &cancel).unwrap();

    for (chapter, &count) in counts.iter().enumerate() {
        let mut next_expected = 0usize;
        for page in pagination
            .pages()
            .iter()
            .filter(|p| p.chapter_index == chapter)
        {
            assert_eq!(page.line_start, next_expected, "gap or overlap in chapter {chapter}");
            assert!(page.line_end <= count);
            next_expected = page.line_end;
        }
        assert_eq!(next_expected, count, "chapter {chapter} not fully covered");
    }
}

#[test]
fn chapter_lookup_round_trips_for_every_page() {
    let chapter_lines = formatted_book(40);
    let counts: Vec<usize> = chapter_lines.iter().map(Vec::len).collect();
    let cancel = AtomicBool::new(false);
    let pagination = DynamicPagination::build(&counts, 10, &cancel).unwrap();

    for p in 0..pagination.len() {
        let chapter = pagination.chapter_at(p).unwrap();
        let first = pagination.page_for_chapter(chapter).unwrap();
        assert_eq!(pagination.chapter_at(first), Some(chapter));
        assert!(pagination.pages()[first].line_start == 0);
    }
}

#[test]
fn width_change_rebuild_bounds_every_page() {
    // Render at a wide terminal, then shrink it: every page of the
    // rebuilt list must fit the new content height.
    let wide_metrics = LayoutMetrics::compute(100, 40, ViewMode::Single, LineSpacing::Normal);
    let narrow_metrics = LayoutMetrics::compute(48, 16, ViewMode::Single, LineSpacing::Normal);

    let cancel = AtomicBool::new(false);

    let wide_lines = formatted_book(wide_metrics.column_width);
    let wide_counts: Vec<usize> = wide_lines.iter().map(Vec::len).collect();
    let wide = DynamicPagination::build(&wide_counts, wide_metrics.displayable_lines, &cancel)
        .unwrap();

    let narrow_lines = formatted_book(narrow_metrics.column_width);
    let narrow_counts: Vec<usize> = narrow_lines.iter().map(Vec::len).collect();
    let narrow =
        DynamicPagination::build(&narrow_counts, narrow_metrics.displayable_lines, &cancel)
            .unwrap();

    assert!(narrow.len() > wide.len());
    for page in narrow.pages() {
        assert!(
            page.line_end - page.line_start <= narrow_metrics.displayable_lines,
            "page exceeds content height after resize"
        );
    }
}

#[test]
fn next_chapter_lands_on_first_page_of_next_chapter() {
    let chapter_lines = formatted_book(40);
    let counts: Vec<usize> = chapter_lines.iter().map(Vec::len).collect();
    let cancel = AtomicBool::new(false);
    let pagination = DynamicPagination::build(&counts, 10, &cancel).unwrap();

    let start = pagination.page_for_chapter(0).unwrap();
    let next = pagination.next_chapter_page(start).unwrap();
    assert_eq!(pagination.chapter_at(next), Some(1));
    assert_eq!(pagination.pages()[next].line_start, 0);
}

#[test]
fn line_spacing_changes_displayable_lines_only() {
    let compact = LayoutMetrics::compute(80, 28, ViewMode::Single, LineSpacing::Compact);
    let normal = LayoutMetrics::compute(80, 28, ViewMode::Single, LineSpacing::Normal);
    let relaxed = LayoutMetrics::compute(80, 28, ViewMode::Single, LineSpacing::Relaxed);

    assert_eq!(compact.content_height, normal.content_height);
    assert_eq!(compact.column_width, relaxed.column_width);
    assert!(compact.displayable_lines > normal.displayable_lines);
    assert!(normal.displayable_lines > relaxed.displayable_lines);
}
