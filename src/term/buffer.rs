//! Double-buffered terminal cell grid.
//!
//! Renderers write ANSI-styled text into the back buffer; `end_frame`
//! diffs it against the front buffer and emits a minimal sequence of
//! cursor moves, SGR changes and text, then swaps. A frame that repeats
//! the previous one emits nothing.

use unicode_segmentation::UnicodeSegmentation;

use crate::text;

/// One screen cell: a grapheme cluster plus its active SGR prefix.
/// An empty cluster marks the continuation cell of a wide grapheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub cluster: String,
    pub sgr: String,
}

impl Cell {
    fn blank() -> Self {
        Self {
            cluster: " ".to_string(),
            sgr: String::new(),
        }
    }

    fn continuation(sgr: &str) -> Self {
        Self {
            cluster: String::new(),
            sgr: sgr.to_string(),
        }
    }

    fn is_continuation(&self) -> bool {
        self.cluster.is_empty()
    }
}

/// Back/front cell grids with diff-based emission.
pub struct TerminalBuffer {
    width: u16,
    height: u16,
    front: Vec<Cell>,
    back: Vec<Cell>,
}

impl TerminalBuffer {
    pub fn new(width: u16, height: u16) -> Self {
        let cells = width as usize * height as usize;
        Self {
            width,
            height,
            front: vec![Cell::blank(); cells],
            back: vec![Cell::blank(); cells],
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// Resize drops both buffers; the next frame repaints everything.
    pub fn resize(&mut self, width: u16, height: u16) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        let cells = width as usize * height as usize;
        self.width = width;
        self.height = height;
        // A sentinel front forces a full-width diff on the next frame.
        self.front = vec![Cell::continuation(""); cells];
        self.back = vec![Cell::blank(); cells];
    }

    /// Begin a frame: the back buffer starts blank.
    pub fn start_frame(&mut self) {
        for cell in &mut self.back {
            *cell = Cell::blank();
        }
    }

    /// Fill the back buffer with blanks (the configured background).
    pub fn clear(&mut self) {
        for cell in &mut self.back {
            *cell = Cell::blank();
        }
    }

    fn index(&self, row: u16, col: u16) -> Option<usize> {
        (row < self.height && col < self.width)
            .then(|| row as usize * self.width as usize + col as usize)
    }

    /// Overlay ANSI-styled text at a position in the back buffer.
    /// Existing cells under the text are replaced outright.
    pub fn write(&mut self, row: u16, col: u16, styled_text: &str) {
        let mut col = col;
        let mut sgr = String::new();
        let mut rest = styled_text;

        while !rest.is_empty() {
            if let Some(esc) = rest.find('\u{1b}') {
                let (head, tail) = rest.split_at(esc);
                col = self.write_plain(row, col, head, &sgr);
                match parse_sgr(tail) {
                    Some((seq, remainder)) => {
                        apply_sgr(&mut sgr, seq);
                        rest = remainder;
                    }
                    None => {
                        // Not an SGR sequence: drop the escape byte.
                        rest = &tail[1..];
                    }
                }
            } else {
                self.write_plain(row, col, rest, &sgr);
                break;
            }
        }
    }

    fn write_plain(&mut self, row: u16, mut col: u16, chunk: &str, sgr: &str) -> u16 {
        for cluster in chunk.graphemes(true) {
            if cluster == "\n" || cluster == "\r\n" || cluster == "\r" {
                continue;
            }
            let width = text::cluster_width(cluster);
            if width == 0 {
                // Combining input attaches to the previous cell.
                if col > 0
                    && let Some(idx) = self.index(row, col - 1)
                {
                    self.back[idx].cluster.push_str(cluster);
                }
                continue;
            }
            if col as usize + width > self.width as usize {
                break;
            }
            let Some(idx) = self.index(row, col) else {
                break;
            };
            self.back[idx] = Cell {
                cluster: cluster.to_string(),
                sgr: sgr.to_string(),
            };
            if width == 2
                && let Some(next) = self.index(row, col + 1)
            {
                self.back[next] = Cell::continuation(sgr);
            }
            col += width as u16;
        }
        col
    }

    /// Diff back against front, emit the update bytes, swap buffers.
    pub fn end_frame(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut emitted_any = false;
        let mut last_sgr: Option<String> = None;

        for row in 0..self.height {
            let mut col = 0u16;
            while col < self.width {
                let idx = row as usize * self.width as usize + col as usize;
                if self.back[idx] == self.front[idx] {
                    col += 1;
                    continue;
                }

                // Start of a changed run: one cursor move per run.
                out.extend_from_slice(format!("\u{1b}[{};{}H", row + 1, col + 1).as_bytes());
                emitted_any = true;

                while col < self.width {
                    let idx = row as usize * self.width as usize + col as usize;
                    if self.back[idx] == self.front[idx] {
                        break;
                    }
                    let cell = &self.back[idx];
                    if cell.is_continuation() {
                        col += 1;
                        continue;
                    }
                    if last_sgr.as_deref() != Some(cell.sgr.as_str()) {
                        out.extend_from_slice(b"\x1b[0m");
                        out.extend_from_slice(cell.sgr.as_bytes());
                        last_sgr = Some(cell.sgr.clone());
                    }
                    out.extend_from_slice(cell.cluster.as_bytes());
                    col += text::cluster_width(&cell.cluster).max(1) as u16;
                }
            }
        }

        if emitted_any {
            out.extend_from_slice(b"\x1b[0m");
        }
        std::mem::swap(&mut self.front, &mut self.back);
        out
    }

    /// The cluster at a cell of the most recently completed frame.
    pub fn front_cluster(&self, row: u16, col: u16) -> Option<&str> {
        self.index(row, col)
            .map(|idx| self.front[idx].cluster.as_str())
    }
}

/// Merge an SGR sequence into the running style prefix: a reset clears
/// it, anything else composes.
fn apply_sgr(current: &mut String, seq: &str) {
    if seq == "\u{1b}[0m" || seq == "\u{1b}[m" {
        current.clear();
    } else {
        current.push_str(seq);
    }
}

/// Split an SGR sequence off the front of `rest` (which starts at ESC).
fn parse_sgr(rest: &str) -> Option<(&str, &str)> {
    let bytes = rest.as_bytes();
    if bytes.len() < 3 || bytes[1] != b'[' {
        return None;
    }
    for (i, &b) in bytes.iter().enumerate().skip(2) {
        match b {
            b'0'..=b'9' | b';' => continue,
            b'm' => return Some(rest.split_at(i + 1)),
            _ => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(buf: &mut TerminalBuffer) -> String {
        String::from_utf8(buf.end_frame()).unwrap()
    }

    #[test]
    fn first_frame_emits_content() {
        let mut buf = TerminalBuffer::new(10, 3);
        buf.start_frame();
        buf.write(0, 0, "hi");
        let out = emitted(&mut buf);
        assert!(out.contains("hi"));
        assert!(out.contains("\u{1b}[1;1H"));
    }

    #[test]
    fn identical_frames_emit_nothing() {
        let mut buf = TerminalBuffer::new(10, 3);
        buf.start_frame();
        buf.write(0, 0, "same");
        let _ = buf.end_frame();

        buf.start_frame();
        buf.write(0, 0, "same");
        assert!(buf.end_frame().is_empty());
    }

    #[test]
    fn single_row_change_emits_one_cursor_move() {
        let mut buf = TerminalBuffer::new(10, 4);
        buf.start_frame();
        buf.write(0, 0, "aaaa");
        buf.write(2, 0, "bbbb");
        let _ = buf.end_frame();

        buf.start_frame();
        buf.write(0, 0, "aaaa");
        buf.write(2, 0, "bXbb");
        let out = emitted(&mut buf);

        let cursor_moves = out
            .match_indices('H')
            .filter(|(i, _)| out[..*i].ends_with(|c: char| c.is_ascii_digit()))
            .count();
        assert_eq!(cursor_moves, 1, "output: {out:?}");
        assert!(out.contains("\u{1b}[3;2H"));
        assert!(!out.contains('a'), "untouched rows re-emitted: {out:?}");
    }

    #[test]
    fn styled_cells_round_trip_sgr() {
        let mut buf = TerminalBuffer::new(20, 2);
        buf.start_frame();
        buf.write(0, 0, "\u{1b}[1mbold\u{1b}[0m plain");
        let out = emitted(&mut buf);
        assert!(out.contains("\u{1b}[1m"));
        assert!(out.contains("bold"));
        assert!(out.contains("plain"));
    }

    #[test]
    fn wide_clusters_occupy_two_cells() {
        let mut buf = TerminalBuffer::new(10, 1);
        buf.start_frame();
        buf.write(0, 0, "日x");
        let _ = buf.end_frame();
        assert_eq!(buf.front_cluster(0, 0), Some("日"));
        assert_eq!(buf.front_cluster(0, 1), Some(""));
        assert_eq!(buf.front_cluster(0, 2), Some("x"));
    }

    #[test]
    fn write_clips_at_the_edge() {
        let mut buf = TerminalBuffer::new(4, 1);
        buf.start_frame();
        buf.write(0, 2, "abc");
        let out = emitted(&mut buf);
        assert!(out.contains("ab"));
        assert!(!out.contains('c'));
    }

    #[test]
    fn resize_forces_full_repaint() {
        let mut buf = TerminalBuffer::new(6, 2);
        buf.start_frame();
        buf.write(0, 0, "x");
        let _ = buf.end_frame();

        buf.resize(8, 2);
        buf.start_frame();
        buf.write(0, 0, "x");
        let out = emitted(&mut buf);
        assert!(out.contains('x'));
    }

    #[test]
    fn overlay_replaces_prior_cells() {
        let mut buf = TerminalBuffer::new(10, 1);
        buf.start_frame();
        buf.write(0, 0, "aaaaaa");
        buf.write(0, 2, "bb");
        let out = emitted(&mut buf);
        assert!(out.contains("aabbaa"));
    }
}
