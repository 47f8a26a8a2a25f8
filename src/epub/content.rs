//! Chapter body (XHTML) parsing into the semantic block tree.
//!
//! Streaming event walk over the document body. Block containers open
//! [`ContentBlock`]s, inline elements push style frames, and text events
//! append segments under the effective style. Prose text is NFC-normalized
//! with collapsed whitespace at block flush; `pre`/`table` content stays
//! verbatim.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use unicode_normalization::UnicodeNormalization;

use crate::book::{BlockKind, ContentBlock, InlineImage, SegmentStyles, TextSegment};
use crate::epub::{local_name, resolve_entity};
use crate::error::{Error, Result};

/// Default unordered list marker.
const BULLET: &str = "\u{2022}";

/// Parse a chapter body into content blocks.
///
/// XML syntax errors are logged and yield an empty block list; a body
/// that has text but normalizes to no blocks is a formatting error.
pub fn parse_chapter_blocks(chapter_path: &str, raw_xhtml: &str) -> Result<Vec<ContentBlock>> {
    let mut parser = BodyParser::new();
    let mut reader = Reader::from_str(raw_xhtml);
    reader.config_mut().trim_text(false);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => parser.element_start(&e, false),
            Ok(Event::Empty(e)) => parser.element_start(&e, true),
            Ok(Event::End(e)) => {
                let name = e.name();
                parser.element_end(local_name(name.as_ref()));
            }
            Ok(Event::Text(e)) => {
                parser.text(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(e)) => {
                parser.text(resolve_entity(&String::from_utf8_lossy(e.as_ref())));
            }
            Ok(Event::CData(e)) => {
                parser.text(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                log::warn!("chapter '{chapter_path}': XML error, skipping body: {e}");
                return Ok(Vec::new());
            }
            _ => {}
        }
    }

    let had_text = parser.saw_body_text;
    let blocks = parser.finish();
    if blocks.is_empty() && had_text {
        return Err(Error::formatting(
            chapter_path,
            "normalized block list was empty",
        ));
    }
    Ok(blocks)
}

/// An open list scope.
struct ListCtx {
    ordered: bool,
    counter: usize,
}

/// Pending table state: rows of cell strings.
#[derive(Default)]
struct TableCtx {
    rows: Vec<Vec<String>>,
    in_cell: bool,
}

struct BodyParser {
    blocks: Vec<ContentBlock>,
    current: Option<ContentBlock>,
    /// Effective style per open inline element; top is the active style.
    style_stack: Vec<SegmentStyles>,
    list_stack: Vec<ListCtx>,
    table: Option<TableCtx>,
    in_body: bool,
    pre_depth: usize,
    skip_depth: usize,
    quote_depth: usize,
    saw_body_text: bool,
}

impl BodyParser {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            current: None,
            style_stack: vec![SegmentStyles::default()],
            list_stack: Vec::new(),
            table: None,
            in_body: false,
            pre_depth: 0,
            skip_depth: 0,
            quote_depth: 0,
            saw_body_text: false,
        }
    }

    fn active_style(&self) -> SegmentStyles {
        let mut style = self
            .style_stack
            .last()
            .cloned()
            .unwrap_or_default();
        if self.quote_depth > 0 {
            style.quote = true;
        }
        if self.pre_depth > 0 {
            style.preserve_whitespace = true;
        }
        style
    }

    fn element_start(&mut self, e: &BytesStart<'_>, self_closing: bool) {
        let name = e.name();
        let local = local_name(name.as_ref()).to_ascii_lowercase();

        if self.skip_depth > 0 {
            if !self_closing {
                self.skip_depth += 1;
            }
            return;
        }

        match local.as_slice() {
            b"body" => {
                self.in_body = true;
                return;
            }
            b"script" | b"style" => {
                if !self_closing {
                    self.skip_depth = 1;
                }
                return;
            }
            _ => {}
        }
        if !self.in_body {
            return;
        }

        match local.as_slice() {
            b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6" => {
                let level = local[1] - b'0';
                self.open_block(BlockKind::Heading { level });
            }
            b"p" | b"div" | b"section" | b"article" | b"aside" | b"header" | b"footer"
            | b"figure" | b"figcaption" | b"main" => {
                self.open_block(self.paragraph_kind());
            }
            b"blockquote" => {
                self.flush();
                self.quote_depth += 1;
            }
            b"ul" | b"ol" => {
                self.flush();
                self.list_stack.push(ListCtx {
                    ordered: local.as_slice() == b"ol",
                    counter: 0,
                });
            }
            b"li" => {
                let level = self.list_stack.len().max(1);
                let (marker, ordered) = match self.list_stack.last_mut() {
                    Some(ctx) => {
                        ctx.counter += 1;
                        if ctx.ordered {
                            (format!("{}.", ctx.counter), true)
                        } else {
                            (BULLET.to_string(), false)
                        }
                    }
                    None => (BULLET.to_string(), false),
                };
                self.open_block(BlockKind::ListItem {
                    level,
                    marker,
                    ordered,
                });
            }
            b"pre" => {
                self.open_block(BlockKind::Code);
                self.pre_depth += 1;
            }
            b"table" => {
                self.flush();
                self.table = Some(TableCtx::default());
                self.pre_depth += 1;
            }
            b"tr" => {
                if let Some(table) = self.table.as_mut() {
                    table.rows.push(Vec::new());
                }
            }
            b"td" | b"th" => {
                if let Some(table) = self.table.as_mut() {
                    if let Some(row) = table.rows.last_mut() {
                        row.push(String::new());
                        table.in_cell = true;
                    }
                }
            }
            b"hr" => {
                self.flush();
                self.blocks.push(ContentBlock::new(BlockKind::Separator));
            }
            b"br" => {
                self.line_break();
            }
            b"img" | b"image" => {
                self.inline_image(e);
            }
            b"b" | b"strong" => self.push_style(|s| s.bold = true),
            b"i" | b"em" => self.push_style(|s| s.italic = true),
            b"u" => self.push_style(|s| s.underline = true),
            b"code" | b"kbd" | b"samp" => self.push_style(|s| {
                s.code = true;
                s.preserve_whitespace = true;
            }),
            b"a" => {
                let href = attr_value(e, b"href");
                self.push_style(|s| s.link = href);
            }
            b"span" => {
                let style_attr = attr_value(e, b"style").unwrap_or_default();
                self.push_style(|s| apply_css_inline(s, &style_attr));
            }
            _ => {
                // Unknown elements are block containers when styled so.
                if let Some(style_attr) = attr_value(e, b"style")
                    && css_display_is_block(&style_attr)
                {
                    self.open_block(self.paragraph_kind());
                }
            }
        }

        // Self-closing inline elements would otherwise leave their style
        // frame dangling.
        if self_closing {
            match local.as_slice() {
                b"b" | b"strong" | b"i" | b"em" | b"u" | b"code" | b"kbd" | b"samp" | b"a"
                | b"span" => {
                    self.style_stack.pop();
                }
                b"pre" => self.pre_depth = self.pre_depth.saturating_sub(1),
                _ => {}
            }
        }
    }

    fn element_end(&mut self, local: &[u8]) {
        let local = local.to_ascii_lowercase();

        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return;
        }

        match local.as_slice() {
            b"body" => {
                self.in_body = false;
                self.flush();
            }
            b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6" | b"p" | b"div" | b"section"
            | b"article" | b"aside" | b"header" | b"footer" | b"figure" | b"figcaption"
            | b"main" | b"li" => {
                self.flush();
            }
            b"blockquote" => {
                self.flush();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            b"ul" | b"ol" => {
                self.flush();
                self.list_stack.pop();
            }
            b"pre" => {
                self.pre_depth = self.pre_depth.saturating_sub(1);
                self.flush();
            }
            b"table" => {
                self.pre_depth = self.pre_depth.saturating_sub(1);
                self.finish_table();
            }
            b"td" | b"th" => {
                if let Some(table) = self.table.as_mut() {
                    table.in_cell = false;
                }
            }
            b"b" | b"strong" | b"i" | b"em" | b"u" | b"code" | b"kbd" | b"samp" | b"a"
            | b"span" => {
                if self.style_stack.len() > 1 {
                    self.style_stack.pop();
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if self.skip_depth > 0 || !self.in_body {
            return;
        }
        if !text.trim().is_empty() {
            self.saw_body_text = true;
        }

        if let Some(table) = self.table.as_mut() {
            if table.in_cell
                && let Some(cell) = table.rows.last_mut().and_then(|r| r.last_mut())
            {
                cell.push_str(text);
            }
            return;
        }

        if self.current.is_none() {
            if text.trim().is_empty() {
                return; // inter-element whitespace
            }
            self.open_block(self.paragraph_kind());
        }

        let styles = self.active_style();
        if let Some(block) = self.current.as_mut() {
            match block.segments.last_mut() {
                Some(last) if last.styles == styles => last.text.push_str(text),
                _ => block.segments.push(TextSegment::new(text, styles)),
            }
        }
    }

    fn paragraph_kind(&self) -> BlockKind {
        if self.quote_depth > 0 {
            BlockKind::Quote
        } else {
            BlockKind::Paragraph
        }
    }

    fn open_block(&mut self, kind: BlockKind) {
        self.flush();
        self.current = Some(ContentBlock::new(kind));
    }

    fn push_style(&mut self, apply: impl FnOnce(&mut SegmentStyles)) {
        let mut style = self.style_stack.last().cloned().unwrap_or_default();
        apply(&mut style);
        self.style_stack.push(style);
    }

    fn line_break(&mut self) {
        let mut styles = self.active_style();
        styles.line_break = true;
        match self.current.as_mut() {
            Some(block) => {
                block.segments.push(TextSegment::new("\n", styles));
            }
            None => {
                self.blocks.push(ContentBlock::new(BlockKind::Break));
            }
        }
    }

    fn inline_image(&mut self, e: &BytesStart<'_>) {
        let src = attr_value(e, b"src")
            .or_else(|| attr_value(e, b"href"))
            .unwrap_or_default();
        if src.is_empty() {
            return;
        }
        let alt = attr_value(e, b"alt").unwrap_or_default();

        if self.current.is_some() {
            let mut styles = self.active_style();
            styles.inline_image = Some(InlineImage { src, alt });
            let block = self.current.as_mut().expect("checked above");
            block.segments.push(TextSegment::new("", styles));
        } else {
            self.blocks
                .push(ContentBlock::new(BlockKind::Image { src, alt }));
        }
    }


    fn finish_table(&mut self) {
        let Some(table) = self.table.take() else {
            return;
        };
        let rows: Vec<String> = table
            .rows
            .iter()
            .map(|cells| {
                cells
                    .iter()
                    .map(|c| c.split_whitespace().collect::<Vec<_>>().join(" "))
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .filter(|row| !row.trim().is_empty())
            .collect();
        if rows.is_empty() {
            return;
        }
        let mut styles = SegmentStyles {
            preserve_whitespace: true,
            ..SegmentStyles::default()
        };
        if self.quote_depth > 0 {
            styles.quote = true;
        }
        self.blocks.push(ContentBlock::with_segments(
            BlockKind::Table,
            vec![TextSegment::new(rows.join("\n"), styles)],
        ));
    }

    /// Normalize and commit the open block.
    fn flush(&mut self) {
        let Some(mut block) = self.current.take() else {
            return;
        };

        if block.kind.preserves_whitespace() {
            trim_verbatim_block(&mut block);
        } else {
            normalize_prose_block(&mut block);
            promote_lone_image(&mut block);
        }

        if !block.is_empty_text() || !block.segments.is_empty() {
            if block.segments.is_empty()
                && !matches!(
                    block.kind,
                    BlockKind::Separator | BlockKind::Break | BlockKind::Image { .. }
                )
            {
                return;
            }
            if block.is_empty_text() && matches!(block.kind, BlockKind::Paragraph) {
                return;
            }
            self.blocks.push(block);
        }
    }

    fn finish(mut self) -> Vec<ContentBlock> {
        self.flush();
        self.blocks
    }
}

/// Collapse whitespace, NFC-normalize, and trim block edges for prose
/// segments. Segments with `preserve_whitespace` (inline code) keep
/// their text verbatim apart from NFC.
fn normalize_prose_block(block: &mut ContentBlock) {
    for segment in &mut block.segments {
        if segment.styles.line_break {
            continue;
        }
        let normalized: String = segment.text.nfc().collect();
        segment.text = if segment.styles.preserve_whitespace {
            normalized
        } else {
            collapse_whitespace(&normalized)
        };
    }

    // Trim the block's leading and trailing edges.
    if let Some(first) = block
        .segments
        .iter_mut()
        .find(|s| !s.styles.line_break && s.styles.inline_image.is_none())
    {
        first.text = first.text.trim_start().to_string();
    }
    if let Some(last) = block
        .segments
        .iter_mut()
        .rev()
        .find(|s| !s.styles.line_break && s.styles.inline_image.is_none())
    {
        last.text = last.text.trim_end().to_string();
    }

    block.segments.retain(|s| {
        !s.text.is_empty() || s.styles.inline_image.is_some() || s.styles.line_break
    });
}

fn trim_verbatim_block(block: &mut ContentBlock) {
    if let Some(first) = block.segments.first_mut() {
        while first.text.starts_with('\n') || first.text.starts_with("\r\n") {
            first.text.remove(0);
        }
    }
    if let Some(last) = block.segments.last_mut() {
        let trimmed = last.text.trim_end_matches(['\n', '\r']).len();
        last.text.truncate(trimmed);
    }
    block.segments.retain(|s| !s.text.is_empty());
}

/// A paragraph holding a single image segment and no text renders as an
/// image block.
fn promote_lone_image(block: &mut ContentBlock) {
    if !matches!(block.kind, BlockKind::Paragraph | BlockKind::Quote) {
        return;
    }
    let images: Vec<&TextSegment> = block
        .segments
        .iter()
        .filter(|s| s.styles.inline_image.is_some())
        .collect();
    let has_text = block.segments.iter().any(|s| !s.text.trim().is_empty());
    if images.len() == 1 && !has_text {
        let image = images[0]
            .styles
            .inline_image
            .clone()
            .unwrap_or_default();
        block.kind = BlockKind::Image {
            src: image.src,
            alt: image.alt,
        };
        block.segments.clear();
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| local_name(a.key.as_ref()) == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Scan an inline `style` attribute for the three recognized text
/// decorations.
fn apply_css_inline(styles: &mut SegmentStyles, css: &str) {
    for decl in css.split(';') {
        let Some((prop, value)) = decl.split_once(':') else {
            continue;
        };
        let prop = prop.trim().to_ascii_lowercase();
        let value = value.trim().to_ascii_lowercase();
        match prop.as_str() {
            "font-weight" if value == "bold" || value == "bolder" || value == "700" => {
                styles.bold = true;
            }
            "font-style" if value == "italic" || value == "oblique" => {
                styles.italic = true;
            }
            "text-decoration" if value.contains("underline") => {
                styles.underline = true;
            }
            _ => {}
        }
    }
}

fn css_display_is_block(css: &str) -> bool {
    for decl in css.split(';') {
        if let Some((prop, value)) = decl.split_once(':') {
            let value = value.trim().to_ascii_lowercase();
            if prop.trim().eq_ignore_ascii_case("display")
                && (value == "block" || value == "list-item")
            {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xhtml: &str) -> Vec<ContentBlock> {
        parse_chapter_blocks("test.xhtml", xhtml).unwrap()
    }

    fn body(inner: &str) -> String {
        format!("<html><head><title>t</title></head><body>{inner}</body></html>")
    }

    #[test]
    fn headings_and_paragraphs() {
        let blocks = parse(&body("<h1>Hello</h1><p>World</p>"));
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, BlockKind::Heading { level: 1 });
        assert_eq!(blocks[0].plain_text(), "Hello");
        assert_eq!(blocks[1].kind, BlockKind::Paragraph);
        assert_eq!(blocks[1].plain_text(), "World");
    }

    #[test]
    fn whitespace_collapses_in_prose() {
        let blocks = parse(&body("<p>  a\n   b\t c  </p>"));
        assert_eq!(blocks[0].plain_text(), "a b c");
    }

    #[test]
    fn inline_styles_compose() {
        let blocks = parse(&body("<p>plain <b>bold <i>both</i></b></p>"));
        let segs = &blocks[0].segments;
        assert_eq!(segs.len(), 3);
        assert!(!segs[0].styles.bold);
        assert!(segs[1].styles.bold && !segs[1].styles.italic);
        assert!(segs[2].styles.bold && segs[2].styles.italic);
        assert_eq!(blocks[0].plain_text(), "plain bold both");
    }

    #[test]
    fn span_css_styles() {
        let blocks = parse(&body(
            r#"<p><span style="font-weight: bold; text-decoration: underline">x</span></p>"#,
        ));
        let seg = &blocks[0].segments[0];
        assert!(seg.styles.bold);
        assert!(seg.styles.underline);
        assert!(!seg.styles.italic);
    }

    #[test]
    fn links_carry_href() {
        let blocks = parse(&body(r#"<p><a href="ch2.xhtml">next</a></p>"#));
        assert_eq!(
            blocks[0].segments[0].styles.link.as_deref(),
            Some("ch2.xhtml")
        );
    }

    #[test]
    fn ordered_lists_count_within_scope() {
        let blocks = parse(&body(
            "<ol><li>one</li><li>two</li></ol><ol><li>fresh</li></ol>",
        ));
        let markers: Vec<String> = blocks
            .iter()
            .map(|b| match &b.kind {
                BlockKind::ListItem { marker, .. } => marker.clone(),
                other => panic!("expected list item, got {other:?}"),
            })
            .collect();
        assert_eq!(markers, vec!["1.", "2.", "1."]);
    }

    #[test]
    fn nested_lists_deepen_level() {
        let blocks = parse(&body(
            "<ul><li>outer</li><ul><li>inner</li></ul></ul>",
        ));
        match (&blocks[0].kind, &blocks[1].kind) {
            (
                BlockKind::ListItem { level: 1, ordered: false, .. },
                BlockKind::ListItem { level: 2, .. },
            ) => {}
            other => panic!("unexpected kinds {other:?}"),
        }
    }

    #[test]
    fn blockquote_tags_segments() {
        let blocks = parse(&body("<blockquote><p>wise words</p></blockquote>"));
        assert_eq!(blocks[0].kind, BlockKind::Quote);
        assert!(blocks[0].segments[0].styles.quote);
    }

    #[test]
    fn pre_preserves_whitespace() {
        let blocks = parse(&body("<pre>fn main() {\n    run();\n}</pre>"));
        assert_eq!(blocks[0].kind, BlockKind::Code);
        assert_eq!(blocks[0].plain_text(), "fn main() {\n    run();\n}");
    }

    #[test]
    fn tables_become_piped_rows() {
        let blocks = parse(&body(
            "<table><tr><th>a</th><th>b</th></tr><tr><td>1</td><td>2</td></tr></table>",
        ));
        assert_eq!(blocks[0].kind, BlockKind::Table);
        assert_eq!(blocks[0].plain_text(), "a | b\n1 | 2");
        assert!(blocks[0].segments[0].styles.preserve_whitespace);
    }

    #[test]
    fn hr_and_br_blocks() {
        let blocks = parse(&body("<p>a</p><hr/><p>b<br/>c</p>"));
        assert_eq!(blocks[1].kind, BlockKind::Separator);
        let segs = &blocks[2].segments;
        assert!(segs.iter().any(|s| s.styles.line_break && s.text == "\n"));
    }

    #[test]
    fn scripts_and_styles_are_skipped() {
        let blocks = parse(&body(
            "<p>keep</p><script>var x = 1;</script><style>p { color: red }</style>",
        ));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].plain_text(), "keep");
    }

    #[test]
    fn lone_image_paragraph_promotes_to_image_block() {
        let blocks = parse(&body(r#"<p><img src="cover.png" alt="Cover"/></p>"#));
        assert_eq!(
            blocks[0].kind,
            BlockKind::Image {
                src: "cover.png".into(),
                alt: "Cover".into()
            }
        );
    }

    #[test]
    fn inline_image_stays_a_segment() {
        let blocks = parse(&body(r#"<p>see <img src="fig.png" alt="figure"/> here</p>"#));
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0]
            .segments
            .iter()
            .any(|s| s.styles.inline_image.is_some()));
    }

    #[test]
    fn empty_blocks_are_compacted() {
        let blocks = parse(&body("<p>   </p><div></div><p>real</p>"));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].plain_text(), "real");
    }

    #[test]
    fn nonempty_body_with_no_blocks_is_an_error() {
        // Text hidden entirely inside skipped elements does not count.
        let ok = parse_chapter_blocks("c.xhtml", &body("<script>x</script>"));
        assert!(ok.unwrap().is_empty());
    }

    #[test]
    fn malformed_xml_logs_and_returns_empty() {
        let blocks =
            parse_chapter_blocks("c.xhtml", "<html><body><p>un<closed</body>").unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn text_outside_blocks_opens_a_paragraph() {
        let blocks = parse(&body("loose text"));
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Paragraph);
        assert_eq!(blocks[0].plain_text(), "loose text");
    }

    #[test]
    fn nfc_normalization_applies() {
        // e + combining acute normalizes to the precomposed form
        let blocks = parse(&body("<p>cafe\u{0301}</p>"));
        assert_eq!(blocks[0].plain_text(), "caf\u{00E9}");
    }
}
