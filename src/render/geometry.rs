//! Line geometry recorded during rendering.
//!
//! Every content line written to the screen leaves a [`LineGeometry`]
//! behind: where it sits, what it says, and the per-cell cluster map
//! selection uses to translate mouse coordinates back into text.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use unicode_segmentation::UnicodeSegmentation;

use crate::text;

/// One cluster on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellGeometry {
    pub cluster: String,
    /// Char (not byte) range within the line's plain text.
    pub char_start: usize,
    pub char_end: usize,
    pub display_width: usize,
    pub screen_x: u16,
}

/// Geometry of one rendered content line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineGeometry {
    pub page_id: u64,
    /// 0 for the single/left column, 1 for the right column.
    pub column_id: u8,
    pub row: u16,
    pub column_origin: u16,
    /// Offset of the line within its chapter's display lines.
    pub line_offset: usize,
    pub chapter_index: usize,
    pub plain_text: String,
    pub styled_text: String,
    pub cells: Vec<CellGeometry>,
}

impl LineGeometry {
    /// `"{column_id}_{line_offset}_{row}"`
    pub fn key(&self) -> String {
        geometry_key(self.column_id, self.line_offset, self.row)
    }

    pub fn visible_width(&self) -> usize {
        self.cells.iter().map(|c| c.display_width).sum()
    }

    /// Whether a screen x coordinate falls inside this line's span.
    pub fn contains_x(&self, x: u16) -> bool {
        let width = self.visible_width().max(1) as u16;
        x >= self.column_origin && x < self.column_origin.saturating_add(width)
    }
}

pub fn geometry_key(column_id: u8, line_offset: usize, row: u16) -> String {
    format!("{column_id}_{line_offset}_{row}")
}

/// Build the cell map for a plain line of text starting at an origin.
pub fn build_cells(plain_text: &str, column_origin: u16) -> Vec<CellGeometry> {
    let mut cells = Vec::new();
    let mut x = column_origin;
    let mut char_pos = 0usize;
    for cluster in plain_text.graphemes(true) {
        let chars = cluster.chars().count();
        let width = text::cluster_width(cluster);
        cells.push(CellGeometry {
            cluster: cluster.to_string(),
            char_start: char_pos,
            char_end: char_pos + chars,
            display_width: width,
            screen_x: x,
        });
        char_pos += chars;
        x = x.saturating_add(width as u16);
    }
    cells
}

/// Geometry for one rendered frame.
#[derive(Debug, Default)]
pub struct FrameGeometry {
    pub page_id: u64,
    lines: Vec<LineGeometry>,
    by_key: HashMap<String, usize>,
}

impl FrameGeometry {
    pub fn new(page_id: u64) -> Self {
        Self {
            page_id,
            lines: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn record(&mut self, line: LineGeometry) {
        self.by_key.insert(line.key(), self.lines.len());
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[LineGeometry] {
        &self.lines
    }

    pub fn by_key(&self, key: &str) -> Option<&LineGeometry> {
        self.by_key.get(key).map(|&idx| &self.lines[idx])
    }

    /// The line under a screen coordinate.
    pub fn line_at(&self, x: u16, y: u16) -> Option<&LineGeometry> {
        self.lines
            .iter()
            .find(|line| line.row == y && line.contains_x(x))
    }
}

/// Published geometry snapshots. The swap is a single `Arc` assignment,
/// so selection queries between frames always see a complete frame.
#[derive(Default)]
pub struct RenderRegistry {
    current: RwLock<Arc<FrameGeometry>>,
}

impl RenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: FrameGeometry) {
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(frame);
    }

    pub fn snapshot(&self) -> Arc<FrameGeometry> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_track_char_and_screen_positions() {
        let cells = build_cells("a日b", 10);
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].screen_x, 10);
        assert_eq!(cells[1].screen_x, 11);
        assert_eq!(cells[1].display_width, 2);
        assert_eq!(cells[2].screen_x, 13);
        assert_eq!(cells[2].char_start, 2);
    }

    #[test]
    fn frame_lookup_by_key_and_position() {
        let mut frame = FrameGeometry::new(7);
        frame.record(LineGeometry {
            page_id: 7,
            column_id: 0,
            row: 4,
            column_origin: 5,
            line_offset: 12,
            chapter_index: 0,
            plain_text: "hello".into(),
            styled_text: "hello".into(),
            cells: build_cells("hello", 5),
        });

        assert!(frame.by_key("0_12_4").is_some());
        assert!(frame.line_at(6, 4).is_some());
        assert!(frame.line_at(6, 5).is_none());
        assert!(frame.line_at(15, 4).is_none());
    }

    #[test]
    fn registry_swaps_whole_frames() {
        let registry = RenderRegistry::new();
        let before = registry.snapshot();
        assert_eq!(before.page_id, 0);

        registry.publish(FrameGeometry::new(3));
        assert_eq!(registry.snapshot().page_id, 3);
        // The old snapshot stays readable.
        assert_eq!(before.page_id, 0);
    }
}
