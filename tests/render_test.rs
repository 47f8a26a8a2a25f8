//! Rendering and selection: differential writes and geometry mapping.

use std::sync::Arc;

use shoko::book::TextSegment;
use shoko::layout::{DisplayLine, LineKind, LineMeta};
use shoko::render::{ContentColumn, RenderRegistry, Renderer, ViewModel};
use shoko::select::{self, Bias, SelectionRange};
use shoko::term::{RecorderPort, TerminalBuffer, TerminalPort};

fn display_line(text: &str) -> DisplayLine {
    DisplayLine {
        text: text.to_string(),
        segments: vec![TextSegment::plain(text)],
        meta: LineMeta {
            kind: Some(LineKind::Paragraph),
            chapter_index: 0,
            chapter_path: "ch.xhtml".into(),
            ..LineMeta::default()
        },
    }
}

fn view_with_lines(page_id: u64, texts: &[&str]) -> ViewModel {
    ViewModel {
        page_id,
        document_title: "Render Test".into(),
        columns: vec![ContentColumn {
            column_id: 0,
            origin: 5,
            width: 40,
            lines: texts
                .iter()
                .enumerate()
                .map(|(i, t)| (i, display_line(t)))
                .collect(),
            page_number: None,
        }],
        ..ViewModel::default()
    }
}

#[test]
fn single_row_change_touches_a_single_row() {
    let registry = Arc::new(RenderRegistry::new());
    let mut renderer = Renderer::new(registry);
    let mut buf = TerminalBuffer::new(60, 20);
    let mut port = RecorderPort::new(60, 20);

    renderer.render(
        &view_with_lines(1, &["alpha line", "beta line", "gamma line"]),
        &mut buf,
        &mut port,
    );
    let first_len = port.output().len();

    renderer.render(
        &view_with_lines(2, &["alpha line", "CHANGED!!", "gamma line"]),
        &mut buf,
        &mut port,
    );
    let delta = String::from_utf8(port.output()[first_len..].to_vec()).unwrap();

    // Exactly one cursor-position sequence, addressing the changed row.
    let cursor_moves = delta
        .match_indices('H')
        .filter(|(i, _)| delta[..*i].ends_with(|c: char| c.is_ascii_digit()))
        .count();
    assert_eq!(cursor_moves, 1, "delta: {delta:?}");
    assert!(delta.contains("\u{1b}[4;6H"), "delta: {delta:?}");
    assert!(delta.contains("CHANGED!!"));
    assert!(!delta.contains("alpha"));
    assert!(!delta.contains("gamma"));
}

#[test]
fn geometry_supports_scenario_selection() {
    let registry = Arc::new(RenderRegistry::new());
    let mut renderer = Renderer::new(registry.clone());
    let mut buf = TerminalBuffer::new(60, 20);
    let mut port = RecorderPort::new(60, 20);

    renderer.render(&view_with_lines(1, &["abcdef"]), &mut buf, &mut port);
    let frame = registry.snapshot();
    let row = frame.lines()[0].row;

    // Cells are width-1 starting at column_origin = 5.
    let start = select::anchor_from_point(&frame, 7, row, Bias::Leading).unwrap();
    assert_eq!(start.cell_index, 2);

    let end = select::anchor_from_point(&frame, 9, row, Bias::Trailing).unwrap();
    let range = SelectionRange::new(start, end);
    assert_eq!(select::resolve_text(&frame, &range), "cd");
}

#[test]
fn selection_round_trips_every_rendered_cell() {
    let registry = Arc::new(RenderRegistry::new());
    let mut renderer = Renderer::new(registry.clone());
    let mut buf = TerminalBuffer::new(60, 20);
    let mut port = RecorderPort::new(60, 20);

    renderer.render(
        &view_with_lines(1, &["plain words here", "and a second row"]),
        &mut buf,
        &mut port,
    );
    let frame = registry.snapshot();

    for line in frame.lines() {
        for (i, cell) in line.cells.iter().enumerate() {
            if cell.display_width == 0 {
                continue;
            }
            let anchor =
                select::anchor_from_point(&frame, cell.screen_x, line.row, Bias::Leading)
                    .unwrap();
            assert_eq!(anchor.cell_index, i);
            assert_eq!(anchor.line_offset, line.line_offset);
        }
    }
}

#[test]
fn registry_serves_the_last_frame_between_renders() {
    let registry = Arc::new(RenderRegistry::new());
    let mut renderer = Renderer::new(registry.clone());
    let mut buf = TerminalBuffer::new(60, 20);
    let mut port = RecorderPort::new(60, 20);

    renderer.render(&view_with_lines(41, &["held frame"]), &mut buf, &mut port);
    let held = registry.snapshot();

    renderer.render(&view_with_lines(42, &["newer frame"]), &mut buf, &mut port);

    // The old snapshot is still complete and queryable.
    assert_eq!(held.page_id, 41);
    assert_eq!(held.lines()[0].plain_text, "held frame");
    assert_eq!(registry.snapshot().page_id, 42);
}

#[test]
fn recorder_port_captures_the_whole_session_shape() {
    let mut port = RecorderPort::new(40, 12);
    port.enter();
    port.write_bytes(b"\x1b[1;1Hhello");
    port.flush();
    port.leave();

    let ops = port.ops();
    assert!(matches!(ops.first(), Some(shoko::term::RecordedOp::Enter)));
    assert!(matches!(ops.last(), Some(shoko::term::RecordedOp::Leave)));
    assert!(String::from_utf8(port.output()).unwrap().contains("hello"));
}
