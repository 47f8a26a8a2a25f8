//! The formatting engine: content blocks to wrapped display lines.
//!
//! `format_chapter` is a pure function of its inputs; equal inputs
//! produce structurally equal lines. Line spacing participates in the
//! cache key but only affects pagination, never the produced lines.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::OnceLock;

use regex::Regex;

use crate::book::{BlockKind, Chapter, ContentBlock, InlineImage, SegmentStyles, TextSegment};
use crate::layout::{DisplayLine, ImagePlacement, LineKind, LineMeta, LineSpacing, ViewMode};
use crate::text;

/// Quote gutter prefix.
const QUOTE_PREFIX: &str = "\u{2502} ";
/// Separator glyph.
const SEPARATOR_GLYPH: &str = "\u{2500}";
/// Widest separator rule.
const SEPARATOR_MAX: usize = 40;

/// Inputs the formatter depends on besides the chapter itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub width: usize,
    pub line_spacing: LineSpacing,
    pub view_mode: ViewMode,
    pub image_rendering: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            width: 80,
            line_spacing: LineSpacing::Normal,
            view_mode: ViewMode::Single,
            image_rendering: false,
        }
    }
}

/// Word-with-trailing-space splitter.
fn token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\S+\s*").expect("static regex"))
}

enum Token {
    Word(TextSegment),
    Newline,
    Image(InlineImage),
}

/// Format a chapter's blocks into display lines at the given width.
pub fn format_chapter(
    chapter: &Chapter,
    blocks: &[ContentBlock],
    opts: &FormatOptions,
) -> Vec<DisplayLine> {
    let width = opts.width.max(4);
    let mut out = Vec::new();
    let mut inline_counter = 0usize;

    for (block_index, block) in blocks.iter().enumerate() {
        let start = out.len();
        match &block.kind {
            BlockKind::Heading { .. } => {
                let tokens = tokenize(block, true);
                wrap_block(
                    &tokens,
                    width,
                    "",
                    "",
                    LineKind::Heading,
                    chapter,
                    opts,
                    block_index,
                    &mut inline_counter,
                    &mut out,
                );
            }
            BlockKind::Paragraph => {
                let tokens = tokenize(block, false);
                wrap_block(
                    &tokens,
                    width,
                    "",
                    "",
                    LineKind::Paragraph,
                    chapter,
                    opts,
                    block_index,
                    &mut inline_counter,
                    &mut out,
                );
            }
            BlockKind::ListItem { level, marker, .. } => {
                let indent = "  ".repeat(level.saturating_sub(1));
                let first = format!("{indent}{marker} ");
                let rest = " ".repeat(text::visible_length(&first));
                let tokens = tokenize(block, false);
                wrap_block(
                    &tokens,
                    width,
                    &first,
                    &rest,
                    LineKind::ListItem,
                    chapter,
                    opts,
                    block_index,
                    &mut inline_counter,
                    &mut out,
                );
            }
            BlockKind::Quote => {
                let tokens = tokenize(block, false);
                wrap_block(
                    &tokens,
                    width,
                    QUOTE_PREFIX,
                    QUOTE_PREFIX,
                    LineKind::Quote,
                    chapter,
                    opts,
                    block_index,
                    &mut inline_counter,
                    &mut out,
                );
            }
            BlockKind::Code | BlockKind::Table => {
                let kind = if block.kind == BlockKind::Code {
                    LineKind::Code
                } else {
                    LineKind::Table
                };
                preformatted_lines(block, kind, chapter, &mut out);
            }
            BlockKind::Separator => {
                let rule = SEPARATOR_GLYPH.repeat(width.min(SEPARATOR_MAX));
                out.push(plain_line(rule, LineKind::Separator, chapter));
            }
            BlockKind::Break => {
                out.push(DisplayLine::spacer(chapter.position, &chapter.file_path));
            }
            BlockKind::Image { src, alt } => {
                image_lines(
                    src,
                    alt,
                    width,
                    chapter,
                    opts,
                    &format!("{block_index}"),
                    &mut out,
                );
            }
        }

        // A block that produced nothing gets no trailing blank either.
        if out.len() == start {
            continue;
        }
        if wants_blank_after(block, blocks.get(block_index + 1)) {
            out.push(DisplayLine::spacer(chapter.position, &chapter.file_path));
        }
    }

    out
}

/// Blank-line policy: a blank after every block except before list
/// items and between immediately consecutive blocks of one semantic
/// group (preformatted and image blocks always keep their blank).
fn wants_blank_after(block: &ContentBlock, next: Option<&ContentBlock>) -> bool {
    let Some(next) = next else {
        return false; // last block
    };
    if matches!(next.kind, BlockKind::ListItem { .. }) {
        return false;
    }
    let grouped = !matches!(block.kind, BlockKind::Image { .. })
        && !block.kind.preserves_whitespace()
        && semantic_group(&block.kind) == semantic_group(&next.kind);
    !grouped
}

fn semantic_group(kind: &BlockKind) -> u8 {
    match kind {
        BlockKind::Heading { .. } => 0,
        BlockKind::Paragraph => 1,
        BlockKind::ListItem { .. } => 2,
        BlockKind::Quote => 3,
        BlockKind::Code => 4,
        BlockKind::Table => 5,
        BlockKind::Separator => 6,
        BlockKind::Break => 7,
        BlockKind::Image { .. } => 8,
    }
}

fn tokenize(block: &ContentBlock, force_bold: bool) -> Vec<Token> {
    let mut tokens = Vec::new();
    for segment in &block.segments {
        if segment.styles.line_break {
            tokens.push(Token::Newline);
            continue;
        }
        if let Some(image) = &segment.styles.inline_image {
            tokens.push(Token::Image(image.clone()));
            if segment.text.is_empty() {
                continue;
            }
        }
        let mut styles = segment.styles.clone();
        if force_bold {
            styles.bold = true;
        }
        if block.kind.preserves_whitespace() || styles.preserve_whitespace {
            tokens.push(Token::Word(TextSegment::new(segment.text.clone(), styles)));
            continue;
        }
        for m in token_pattern().find_iter(&segment.text) {
            tokens.push(Token::Word(TextSegment::new(m.as_str(), styles.clone())));
        }
    }
    tokens
}

/// Accumulates styled words into one display line.
struct LineBuilder {
    segments: Vec<TextSegment>,
    width: usize,
}

impl LineBuilder {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            width: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.text.trim().is_empty())
    }

    fn push(&mut self, word: &str, styles: &SegmentStyles) {
        match self.segments.last_mut() {
            Some(last) if last.styles == *styles => last.text.push_str(word),
            _ => self
                .segments
                .push(TextSegment::new(word, styles.clone())),
        }
        self.width += text::visible_length(word);
    }

    /// Finish the line: trim the trailing run of spaces.
    fn take(&mut self) -> Vec<TextSegment> {
        if let Some(last) = self.segments.last_mut() {
            last.text = last.text.trim_end().to_string();
        }
        self.width = 0;
        std::mem::take(&mut self.segments)
            .into_iter()
            .filter(|s| !s.text.is_empty())
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn wrap_block(
    tokens: &[Token],
    width: usize,
    first_prefix: &str,
    rest_prefix: &str,
    kind: LineKind,
    chapter: &Chapter,
    opts: &FormatOptions,
    block_index: usize,
    inline_counter: &mut usize,
    out: &mut Vec<DisplayLine>,
) {
    let first_indent = text::visible_length(first_prefix);
    let rest_indent = text::visible_length(rest_prefix);
    let inner_first = width.saturating_sub(first_indent).max(1);
    let inner_rest = width.saturating_sub(rest_indent).max(1);

    let mut builder = LineBuilder::new();
    let mut emitted = 0usize;
    let list_indent = (kind == LineKind::ListItem).then_some(rest_indent);

    let flush =
        |builder: &mut LineBuilder, emitted: &mut usize, out: &mut Vec<DisplayLine>| {
            let segments = builder.take();
            let prefix = if *emitted == 0 { first_prefix } else { rest_prefix };
            let mut all = Vec::with_capacity(segments.len() + 1);
            if !prefix.is_empty() {
                let style = if kind == LineKind::Quote {
                    SegmentStyles {
                        quote: true,
                        ..SegmentStyles::default()
                    }
                } else {
                    SegmentStyles::default()
                };
                all.push(TextSegment::new(prefix, style));
            }
            all.extend(segments);
            let plain: String = all.iter().map(|s| s.text.as_str()).collect();
            out.push(DisplayLine {
                text: plain,
                segments: all,
                meta: LineMeta {
                    kind: Some(kind),
                    chapter_index: chapter.position,
                    chapter_path: chapter.file_path.clone(),
                    spacer: false,
                    image: None,
                    list_indent,
                },
            });
            *emitted += 1;
        };

    for token in tokens {
        let inner = if emitted == 0 { inner_first } else { inner_rest };
        match token {
            Token::Newline => flush(&mut builder, &mut emitted, out),
            Token::Image(image) => {
                if !builder.is_empty() {
                    flush(&mut builder, &mut emitted, out);
                }
                if opts.image_rendering && is_renderable(&image.src) {
                    let tag = format!("inline{inline_counter}");
                    *inline_counter += 1;
                    image_lines(&image.src, &image.alt, width, chapter, opts, &tag, out);
                    emitted += 1;
                } else {
                    builder.push(&image_placeholder(&image.alt), &SegmentStyles::default());
                }
            }
            Token::Word(segment) => {
                let trimmed = segment.text.trim_end();
                let word_width = text::visible_length(trimmed);
                if word_width == 0 && builder.is_empty() {
                    continue;
                }
                if builder.width + word_width > inner && !builder.is_empty() {
                    flush(&mut builder, &mut emitted, out);
                }
                if word_width > inner {
                    // Token wider than the column: cell-split it.
                    let pieces = text::wrap_cells(trimmed, inner);
                    let last = pieces.len().saturating_sub(1);
                    for (i, piece) in pieces.into_iter().enumerate() {
                        builder.push(&piece, &segment.styles);
                        if i != last {
                            flush(&mut builder, &mut emitted, out);
                        }
                    }
                    // Re-attach the trailing whitespace the trim dropped.
                    let tail = &segment.text[trimmed.len()..];
                    if !tail.is_empty() {
                        builder.push(tail, &segment.styles);
                    }
                } else {
                    builder.push(&segment.text, &segment.styles);
                }
            }
        }
    }
    if !builder.is_empty() {
        flush(&mut builder, &mut emitted, out);
    }
    if emitted == 0 {
        // A block that wrapped to nothing still occupies one line.
        flush(&mut builder, &mut emitted, out);
    }
}

fn preformatted_lines(
    block: &ContentBlock,
    kind: LineKind,
    chapter: &Chapter,
    out: &mut Vec<DisplayLine>,
) {
    let styles = SegmentStyles {
        code: true,
        preserve_whitespace: true,
        ..SegmentStyles::default()
    };
    let content = block.plain_text();
    for row in content.split('\n') {
        let row = row.trim_end();
        out.push(DisplayLine {
            text: row.to_string(),
            segments: vec![TextSegment::new(row, styles.clone())],
            meta: LineMeta {
                kind: Some(kind),
                chapter_index: chapter.position,
                chapter_path: chapter.file_path.clone(),
                ..LineMeta::default()
            },
        });
    }
}

fn plain_line(token: String, kind: LineKind, chapter: &Chapter) -> DisplayLine {
    DisplayLine {
        text: token.clone(),
        segments: vec![TextSegment::plain(token)],
        meta: LineMeta {
            kind: Some(kind),
            chapter_index: chapter.position,
            chapter_path: chapter.file_path.clone(),
            ..LineMeta::default()
        },
    }
}

/// Reserve spacer rows for a terminal-graphics placement, or fall back
/// to an alt-text placeholder line.
fn image_lines(
    src: &str,
    alt: &str,
    width: usize,
    chapter: &Chapter,
    opts: &FormatOptions,
    disambiguator: &str,
    out: &mut Vec<DisplayLine>,
) {
    if !opts.image_rendering || !is_renderable(src) {
        out.push(plain_line(image_placeholder(alt), LineKind::Image, chapter));
        return;
    }

    let rows = ((width as f64 * 0.5).round() as usize).clamp(4, 18);
    let placement_id = placement_id(&chapter.file_path, src, disambiguator);

    for row in 0..rows {
        let mut line = DisplayLine::spacer(chapter.position, &chapter.file_path);
        line.meta.kind = Some(LineKind::Image);
        if row == 0 {
            line.meta.image = Some(ImagePlacement {
                src: src.to_string(),
                alt: alt.to_string(),
                cols: width,
                rows,
                placement_id,
                col_offset: None,
            });
        }
        out.push(line);
    }
}

fn image_placeholder(alt: &str) -> String {
    if alt.trim().is_empty() {
        "[image]".to_string()
    } else {
        format!("[image: {}]", alt.trim())
    }
}

/// Raster sources the terminal pipeline can place.
pub fn is_renderable(src: &str) -> bool {
    let lower = src.to_ascii_lowercase();
    lower.ends_with(".png") || lower.ends_with(".jpg") || lower.ends_with(".jpeg")
}

/// Stable placement id; the high 32 bits of the hash become the image id.
fn placement_id(chapter_path: &str, src: &str, disambiguator: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    chapter_path.hash(&mut hasher);
    src.hash(&mut hasher);
    disambiguator.hash(&mut hasher);
    (hasher.finish() >> 32) as u32
}
