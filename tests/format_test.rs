//! Formatting over ingested chapters: wrapping bounds and determinism.

mod common;

use common::trivial_epub;
use shoko::epub::{ingest_path, parse_chapter_blocks};
use shoko::layout::{FormatOptions, LineKind, format_chapter};
use shoko::text::visible_length;

#[test]
fn trivial_book_formats_to_the_expected_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trivial.epub");
    trivial_epub(&path);

    let book = ingest_path(&path).unwrap();
    let chapter = &book.chapters[0];
    let blocks = parse_chapter_blocks(&chapter.file_path, &chapter.raw_xhtml).unwrap();
    let lines = format_chapter(
        chapter,
        &blocks,
        &FormatOptions {
            width: 20,
            ..FormatOptions::default()
        },
    );

    assert_eq!(lines[0].text, "Hello");
    assert!(lines[0].segments[0].styles.bold);
    assert_eq!(lines[0].meta.kind, Some(LineKind::Heading));
    assert!(lines[1].meta.spacer);
    assert_eq!(lines[2].text, "World");
}

#[test]
fn wrapped_lines_stay_within_width() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("long.epub");
    common::EpubBuilder::new("Long")
        .chapter(
            "ch1.xhtml",
            "<h2>A heading that is itself rather long and will wrap</h2>\
             <p>Call me Ishmael. Some years ago, never mind how long precisely, having \
             little or no money in my purse, and nothing particular to interest me on \
             shore, I thought I would sail about a little and see the watery part of \
             the world.</p>\
             <ul><li>a list item that also needs to wrap across several display lines \
             to prove the continuation indent</li></ul>\
             <blockquote><p>a quoted passage, indented with the quote gutter, long \
             enough to wrap</p></blockquote>",
        )
        .write_to(&path);

    let book = ingest_path(&path).unwrap();
    let chapter = &book.chapters[0];
    let blocks = parse_chapter_blocks(&chapter.file_path, &chapter.raw_xhtml).unwrap();

    for width in [22usize, 40, 78] {
        let lines = format_chapter(
            chapter,
            &blocks,
            &FormatOptions {
                width,
                ..FormatOptions::default()
            },
        );
        for line in &lines {
            if line.segments.iter().any(|s| s.styles.preserve_whitespace) {
                continue;
            }
            assert!(
                visible_length(&line.text) <= width,
                "width {width} exceeded by {:?}",
                line.text
            );
        }
    }
}

#[test]
fn formatting_is_pure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pure.epub");
    trivial_epub(&path);

    let book = ingest_path(&path).unwrap();
    let chapter = &book.chapters[0];
    let blocks = parse_chapter_blocks(&chapter.file_path, &chapter.raw_xhtml).unwrap();
    let opts = FormatOptions {
        width: 33,
        ..FormatOptions::default()
    };

    let runs: Vec<_> = (0..3)
        .map(|_| format_chapter(chapter, &blocks, &opts))
        .collect();
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[test]
fn display_lines_carry_chapter_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.epub");
    trivial_epub(&path);

    let book = ingest_path(&path).unwrap();
    let chapter = &book.chapters[0];
    let blocks = parse_chapter_blocks(&chapter.file_path, &chapter.raw_xhtml).unwrap();
    let lines = format_chapter(chapter, &blocks, &FormatOptions::default());

    for line in &lines {
        assert_eq!(line.meta.chapter_index, 0);
        assert_eq!(line.meta.chapter_path, "OEBPS/ch1.xhtml");
    }
}
