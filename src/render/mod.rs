//! Frame composition.
//!
//! The renderer consumes a pure [`ViewModel`], writes one frame into the
//! terminal buffer, flushes the diff through the port, and publishes
//! per-line geometry for selection. Kitty image *transmission* is the
//! app's concern; this module only places the Unicode placeholder cells.

pub mod geometry;
pub mod kitty;

use std::sync::Arc;

use crate::book::{SegmentStyles, TextSegment};
use crate::layout::{DisplayLine, LineSpacing, ViewMode};
use crate::state::Mode;
use crate::term::{TerminalBuffer, TerminalPort};
use crate::text;

pub use geometry::{CellGeometry, FrameGeometry, LineGeometry, RenderRegistry};

/// Row of the first content line.
const CONTENT_TOP: u16 = 2;

/// One column of content lines ready to draw.
#[derive(Debug, Clone, Default)]
pub struct ContentColumn {
    pub column_id: u8,
    /// Screen x of the column's first text cell.
    pub origin: u16,
    pub width: usize,
    /// `(line_offset within chapter, line)` pairs, top to bottom.
    pub lines: Vec<(usize, DisplayLine)>,
    pub page_number: Option<String>,
}

/// Full-region overlays for the non-read modes.
#[derive(Debug, Clone)]
pub enum Overlay {
    Help(Vec<String>),
    List {
        title: String,
        items: Vec<String>,
        selected: usize,
    },
    Editor {
        title: String,
        buffer: String,
    },
}

/// Everything one frame needs, with no access to mutable state.
#[derive(Debug, Clone, Default)]
pub struct ViewModel {
    pub page_id: u64,
    pub document_title: String,
    pub chapter_title: String,
    pub chapter_progress: String,
    pub page_progress: String,
    pub view_mode: ViewMode,
    pub line_spacing: LineSpacing,
    pub mode: Mode,
    pub message: Option<String>,
    pub columns: Vec<ContentColumn>,
    pub overlay: Option<Overlay>,
    pub show_page_numbers: bool,
    pub kitty_graphics: bool,
}

/// Draws frames and owns the published geometry registry.
pub struct Renderer {
    registry: Arc<RenderRegistry>,
}

impl Renderer {
    pub fn new(registry: Arc<RenderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RenderRegistry> {
        &self.registry
    }

    /// Compose one frame and flush its diff through the port.
    pub fn render(
        &mut self,
        view: &ViewModel,
        buf: &mut TerminalBuffer,
        port: &mut dyn TerminalPort,
    ) {
        let (cols, rows) = buf.size();
        let content_height = rows.saturating_sub(4).max(1);
        let mut frame = FrameGeometry::new(view.page_id);

        buf.start_frame();
        self.draw_header(view, buf, cols);

        match (&view.overlay, view.mode) {
            (Some(overlay), _) if view.mode != Mode::Read => {
                draw_overlay(overlay, buf, cols, content_height);
            }
            _ => self.draw_content(view, buf, cols, content_height, &mut frame),
        }

        self.draw_footer(view, buf, cols, rows);

        if let Some(message) = &view.message {
            draw_message(message, buf, cols, rows);
        }

        let bytes = buf.end_frame();
        if !bytes.is_empty() {
            port.write_bytes(&bytes);
            port.flush();
        }
        self.registry.publish(frame);
    }

    fn draw_header(&self, view: &ViewModel, buf: &mut TerminalBuffer, cols: u16) {
        let mode_tag = match view.view_mode {
            ViewMode::Single => "[1]",
            ViewMode::Split => "[2]",
        };
        let left_budget = (cols as usize).saturating_sub(mode_tag.len() + 1);
        let title = text::truncate_to(&view.document_title, left_budget * 2 / 3);
        let chapter = text::truncate_to(
            &view.chapter_title,
            left_budget.saturating_sub(text::visible_length(&title) + 3),
        );

        let mut header = String::new();
        header.push_str("\u{1b}[1m");
        header.push_str(&title);
        header.push_str("\u{1b}[0m");
        if !chapter.is_empty() {
            header.push_str(" \u{2500} ");
            header.push_str(&chapter);
        }
        buf.write(0, 0, &header);

        let tag_col = cols.saturating_sub(mode_tag.len() as u16);
        buf.write(0, tag_col, &format!("\u{1b}[2m{mode_tag}\u{1b}[0m"));
    }

    fn draw_content(
        &self,
        view: &ViewModel,
        buf: &mut TerminalBuffer,
        cols: u16,
        content_height: u16,
        frame: &mut FrameGeometry,
    ) {
        let step: u16 = match view.line_spacing {
            LineSpacing::Relaxed => 2,
            _ => 1,
        };

        for column in &view.columns {
            for (slot, (line_offset, line)) in column.lines.iter().enumerate() {
                let row = CONTENT_TOP + slot as u16 * step;
                if row >= CONTENT_TOP + content_height {
                    break;
                }

                if let Some(placement) = &line.meta.image
                    && view.kitty_graphics
                {
                    // The block reserved `rows` spacer lines below this
                    // one; fill them all with placeholder cells.
                    for r in 0..placement.rows {
                        let image_row = row + r as u16;
                        if image_row >= CONTENT_TOP + content_height {
                            break;
                        }
                        let placeholder = kitty::placeholder_row(
                            placement.placement_id,
                            r,
                            placement.cols.min(column.width),
                        );
                        buf.write(image_row, column.origin, &placeholder);
                    }
                    continue;
                }

                let styled = segments_to_ansi(&line.segments);
                buf.write(row, column.origin, &styled);
                frame.record(LineGeometry {
                    page_id: view.page_id,
                    column_id: column.column_id,
                    row,
                    column_origin: column.origin,
                    line_offset: *line_offset,
                    chapter_index: line.meta.chapter_index,
                    plain_text: line.text.clone(),
                    styled_text: styled,
                    cells: geometry::build_cells(&line.text, column.origin),
                });
            }

            if view.show_page_numbers
                && let Some(number) = &column.page_number
            {
                let label = format!("\u{1b}[2m{number}\u{1b}[0m");
                let label_width = text::visible_length(number) as u16;
                let center = column.origin
                    + (column.width as u16).saturating_sub(label_width) / 2;
                buf.write(CONTENT_TOP + content_height, center.min(cols), &label);
            }
        }
    }

    fn draw_footer(&self, view: &ViewModel, buf: &mut TerminalBuffer, cols: u16, rows: u16) {
        let row = rows.saturating_sub(1);
        let mut left = String::from("\u{1b}[2m");
        if !view.chapter_progress.is_empty() {
            left.push_str(&view.chapter_progress);
        }
        if !view.page_progress.is_empty() {
            if !view.chapter_progress.is_empty() {
                left.push_str(" \u{00B7} ");
            }
            left.push_str(&view.page_progress);
        }
        left.push_str("\u{1b}[0m");
        buf.write(row, 0, &left);

        let hints = mode_hints(view.mode);
        let hint_col = cols.saturating_sub(text::visible_length(hints) as u16);
        buf.write(row, hint_col, &format!("\u{1b}[2m{hints}\u{1b}[0m"));
    }
}

fn mode_hints(mode: Mode) -> &'static str {
    match mode {
        Mode::Read => "?:help t:toc b:marks q:quit",
        Mode::Help => "esc:back",
        Mode::Toc | Mode::Bookmarks | Mode::Annotations => "enter:open esc:back",
        Mode::AnnotationEditor => "enter:save esc:discard",
        Mode::Popup => "esc:close",
    }
}

fn draw_overlay(overlay: &Overlay, buf: &mut TerminalBuffer, cols: u16, content_height: u16) {
    match overlay {
        Overlay::Help(lines) => {
            for (i, line) in lines.iter().take(content_height as usize).enumerate() {
                buf.write(CONTENT_TOP + i as u16, 2, line);
            }
        }
        Overlay::List {
            title,
            items,
            selected,
        } => {
            buf.write(CONTENT_TOP, 2, &format!("\u{1b}[1m{title}\u{1b}[0m"));
            let visible = content_height.saturating_sub(2) as usize;
            // Keep the selected row on screen.
            let first = selected.saturating_sub(visible.saturating_sub(1));
            for (i, item) in items.iter().skip(first).take(visible).enumerate() {
                let row = CONTENT_TOP + 2 + i as u16;
                let index = first + i;
                let line = text::truncate_to(item, cols.saturating_sub(6) as usize);
                if index == *selected {
                    buf.write(row, 2, &format!("\u{1b}[7m> {line}\u{1b}[0m"));
                } else {
                    buf.write(row, 4, &line);
                }
            }
        }
        Overlay::Editor { title, buffer } => {
            buf.write(CONTENT_TOP, 2, &format!("\u{1b}[1m{title}\u{1b}[0m"));
            for (i, line) in buffer.split('\n').enumerate() {
                let row = CONTENT_TOP + 2 + i as u16;
                if row >= CONTENT_TOP + content_height {
                    break;
                }
                buf.write(row, 2, line);
            }
        }
    }
}

fn draw_message(message: &str, buf: &mut TerminalBuffer, cols: u16, rows: u16) {
    let width = text::visible_length(message).min((cols as usize).saturating_sub(4));
    let boxed = format!(
        "\u{1b}[7m {} \u{1b}[0m",
        text::truncate_to(message, width)
    );
    let col = (cols as usize).saturating_sub(width + 2) as u16 / 2;
    buf.write(rows / 2, col, &boxed);
}

/// Translate segment styles into ANSI SGR text.
pub fn segments_to_ansi(segments: &[TextSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        let codes = sgr_codes(&segment.styles);
        if codes.is_empty() {
            out.push_str(&segment.text);
        } else {
            out.push_str(&format!("\u{1b}[{codes}m{}\u{1b}[0m", segment.text));
        }
    }
    out
}

fn sgr_codes(styles: &SegmentStyles) -> String {
    let mut codes: Vec<&str> = Vec::new();
    if styles.bold {
        codes.push("1");
    }
    if styles.italic {
        codes.push("3");
    }
    if styles.underline || styles.link.is_some() {
        codes.push("4");
    }
    if styles.code {
        codes.push("36");
    }
    if styles.quote && !styles.bold {
        codes.push("2");
    }
    if styles.link.is_some() {
        codes.push("34");
    }
    codes.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LineKind, LineMeta};
    use crate::term::RecorderPort;

    fn plain_display_line(text: &str, chapter: usize) -> DisplayLine {
        DisplayLine {
            text: text.to_string(),
            segments: vec![TextSegment::plain(text)],
            meta: LineMeta {
                kind: Some(LineKind::Paragraph),
                chapter_index: chapter,
                chapter_path: "ch.xhtml".into(),
                ..LineMeta::default()
            },
        }
    }

    fn basic_view(lines: Vec<(usize, DisplayLine)>) -> ViewModel {
        ViewModel {
            page_id: 1,
            document_title: "Book".into(),
            chapter_title: "Chapter".into(),
            chapter_progress: "1/3".into(),
            page_progress: "2/40".into(),
            columns: vec![ContentColumn {
                column_id: 0,
                origin: 4,
                width: 40,
                lines,
                page_number: Some("2".into()),
            }],
            show_page_numbers: true,
            ..ViewModel::default()
        }
    }

    #[test]
    fn frame_reaches_port_and_registry() {
        let registry = Arc::new(RenderRegistry::new());
        let mut renderer = Renderer::new(registry.clone());
        let mut buf = TerminalBuffer::new(60, 20);
        let mut port = RecorderPort::new(60, 20);

        let view = basic_view(vec![
            (0, plain_display_line("first line", 0)),
            (1, plain_display_line("second line", 0)),
        ]);
        renderer.render(&view, &mut buf, &mut port);

        let out = String::from_utf8_lossy(&port.output()).into_owned();
        assert!(out.contains("first line"));
        assert!(out.contains("Book"));
        assert!(out.contains("1/3"));

        let frame = registry.snapshot();
        assert_eq!(frame.lines().len(), 2);
        assert_eq!(frame.lines()[0].column_origin, 4);
        assert_eq!(frame.lines()[0].row, 2);
        assert!(frame.by_key("0_1_3").is_some());
    }

    #[test]
    fn relaxed_spacing_doubles_row_step() {
        let registry = Arc::new(RenderRegistry::new());
        let mut renderer = Renderer::new(registry.clone());
        let mut buf = TerminalBuffer::new(60, 20);
        let mut port = RecorderPort::new(60, 20);

        let mut view = basic_view(vec![
            (0, plain_display_line("a", 0)),
            (1, plain_display_line("b", 0)),
        ]);
        view.line_spacing = LineSpacing::Relaxed;
        renderer.render(&view, &mut buf, &mut port);

        let frame = registry.snapshot();
        assert_eq!(frame.lines()[0].row, 2);
        assert_eq!(frame.lines()[1].row, 4);
    }

    #[test]
    fn overlay_replaces_content_region() {
        let registry = Arc::new(RenderRegistry::new());
        let mut renderer = Renderer::new(registry.clone());
        let mut buf = TerminalBuffer::new(60, 20);
        let mut port = RecorderPort::new(60, 20);

        let mut view = basic_view(vec![(0, plain_display_line("hidden text", 0))]);
        view.mode = Mode::Toc;
        view.overlay = Some(Overlay::List {
            title: "Contents".into(),
            items: vec!["One".into(), "Two".into()],
            selected: 1,
        });
        renderer.render(&view, &mut buf, &mut port);

        let out = String::from_utf8_lossy(&port.output()).into_owned();
        assert!(out.contains("Contents"));
        assert!(out.contains("Two"));
        assert!(!out.contains("hidden text"));
        assert!(registry.snapshot().lines().is_empty());
    }

    #[test]
    fn second_identical_frame_writes_nothing() {
        let registry = Arc::new(RenderRegistry::new());
        let mut renderer = Renderer::new(registry);
        let mut buf = TerminalBuffer::new(60, 20);
        let mut port = RecorderPort::new(60, 20);

        let view = basic_view(vec![(0, plain_display_line("stable", 0))]);
        renderer.render(&view, &mut buf, &mut port);
        let first_len = port.output().len();
        renderer.render(&view, &mut buf, &mut port);
        assert_eq!(port.output().len(), first_len);
    }

    #[test]
    fn message_is_drawn_over_content() {
        let registry = Arc::new(RenderRegistry::new());
        let mut renderer = Renderer::new(registry);
        let mut buf = TerminalBuffer::new(60, 20);
        let mut port = RecorderPort::new(60, 20);

        let mut view = basic_view(vec![(0, plain_display_line("body", 0))]);
        view.message = Some("Bookmark added".into());
        renderer.render(&view, &mut buf, &mut port);
        let out = String::from_utf8_lossy(&port.output()).into_owned();
        assert!(out.contains("Bookmark added"));
    }

    #[test]
    fn styled_segments_translate_to_sgr() {
        let styled = segments_to_ansi(&[
            TextSegment::new(
                "bold",
                SegmentStyles {
                    bold: true,
                    ..SegmentStyles::default()
                },
            ),
            TextSegment::plain(" plain"),
        ]);
        assert_eq!(styled, "\u{1b}[1mbold\u{1b}[0m plain");
    }
}
