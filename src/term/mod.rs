//! Terminal I/O port.
//!
//! The core renders through [`TerminalPort`]; the crossterm-backed port
//! is only constructed at program entry, and `SHOKO_TEST_MODE=1` (or
//! tests directly) swaps in the in-memory [`RecorderPort`].

pub mod buffer;

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use crossterm::event::{
    DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers,
    MouseButton, MouseEventKind,
};
use crossterm::{cursor, execute, terminal};

pub use buffer::TerminalBuffer;

/// Fallback winsize when the terminal cannot be queried.
pub const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Key input, decoupled from the backend's event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Left,
    Right,
    PageUp,
    PageDown,
    Home,
    End,
    Enter,
    Esc,
    Backspace,
    Tab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseKind {
    LeftDown,
    LeftDrag,
    LeftUp,
    ScrollUp,
    ScrollDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseInput {
    pub x: u16,
    pub y: u16,
    pub kind: MouseKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key(Key),
    Mouse(MouseInput),
    Resize(u16, u16),
}

/// Capability trait over the terminal. Write and control failures are
/// silently dropped: a closed terminal must never crash the reader.
pub trait TerminalPort {
    /// Raw mode, alternate screen, hidden cursor, mouse capture.
    fn enter(&mut self);
    /// Undo everything `enter` did.
    fn leave(&mut self);
    /// `(columns, rows)`, falling back to [`FALLBACK_SIZE`].
    fn size(&self) -> (u16, u16);
    fn write_bytes(&mut self, bytes: &[u8]);
    fn flush(&mut self);
    /// Poll for input with a timeout so resizes and worker completions
    /// are observed promptly.
    fn poll_input(&mut self, timeout: Duration) -> Option<InputEvent>;
}

// ============================================================================
// Crossterm port
// ============================================================================

/// The real terminal.
pub struct CrosstermPort {
    out: std::io::Stdout,
}

impl CrosstermPort {
    pub fn new() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl Default for CrosstermPort {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalPort for CrosstermPort {
    fn enter(&mut self) {
        let _ = terminal::enable_raw_mode();
        let _ = execute!(
            self.out,
            terminal::EnterAlternateScreen,
            cursor::Hide,
            EnableMouseCapture
        );
    }

    fn leave(&mut self) {
        let _ = execute!(
            self.out,
            DisableMouseCapture,
            cursor::Show,
            terminal::LeaveAlternateScreen
        );
        let _ = terminal::disable_raw_mode();
    }

    fn size(&self) -> (u16, u16) {
        terminal::size().unwrap_or(FALLBACK_SIZE)
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let _ = self.out.write_all(bytes);
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }

    fn poll_input(&mut self, timeout: Duration) -> Option<InputEvent> {
        if !crossterm::event::poll(timeout).unwrap_or(false) {
            return None;
        }
        match crossterm::event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                translate_key(key.code, key.modifiers)
            }
            Ok(Event::Mouse(mouse)) => {
                let kind = match mouse.kind {
                    MouseEventKind::Down(MouseButton::Left) => MouseKind::LeftDown,
                    MouseEventKind::Drag(MouseButton::Left) => MouseKind::LeftDrag,
                    MouseEventKind::Up(MouseButton::Left) => MouseKind::LeftUp,
                    MouseEventKind::ScrollUp => MouseKind::ScrollUp,
                    MouseEventKind::ScrollDown => MouseKind::ScrollDown,
                    _ => return None,
                };
                Some(InputEvent::Mouse(MouseInput {
                    x: mouse.column,
                    y: mouse.row,
                    kind,
                }))
            }
            Ok(Event::Resize(cols, rows)) => Some(InputEvent::Resize(cols, rows)),
            _ => None,
        }
    }
}

fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<InputEvent> {
    let key = match code {
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => Key::Char('q'),
        KeyCode::Char(c) => Key::Char(c),
        KeyCode::Up => Key::Up,
        KeyCode::Down => Key::Down,
        KeyCode::Left => Key::Left,
        KeyCode::Right => Key::Right,
        KeyCode::PageUp => Key::PageUp,
        KeyCode::PageDown => Key::PageDown,
        KeyCode::Home => Key::Home,
        KeyCode::End => Key::End,
        KeyCode::Enter => Key::Enter,
        KeyCode::Esc => Key::Esc,
        KeyCode::Backspace => Key::Backspace,
        KeyCode::Tab => Key::Tab,
        _ => return None,
    };
    Some(InputEvent::Key(key))
}

// ============================================================================
// Recorder port (test mode)
// ============================================================================

/// What the recorder saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    Enter,
    Leave,
    Write(Vec<u8>),
    Flush,
}

/// In-memory terminal double: scripted input, captured output.
pub struct RecorderPort {
    size: (u16, u16),
    script: VecDeque<InputEvent>,
    ops: Vec<RecordedOp>,
    quit_when_drained: bool,
}

impl RecorderPort {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            size: (cols, rows),
            script: VecDeque::new(),
            ops: Vec::new(),
            quit_when_drained: false,
        }
    }

    /// Synthesize a quit key once the script is exhausted, so headless
    /// runs terminate instead of polling forever.
    pub fn quit_when_drained(mut self) -> Self {
        self.quit_when_drained = true;
        self
    }

    pub fn push_input(&mut self, event: InputEvent) {
        self.script.push_back(event);
    }

    pub fn set_size(&mut self, cols: u16, rows: u16) {
        self.size = (cols, rows);
    }

    pub fn ops(&self) -> &[RecordedOp] {
        &self.ops
    }

    /// Everything written, concatenated.
    pub fn output(&self) -> Vec<u8> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                RecordedOp::Write(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .concat()
    }
}

impl TerminalPort for RecorderPort {
    fn enter(&mut self) {
        self.ops.push(RecordedOp::Enter);
    }

    fn leave(&mut self) {
        self.ops.push(RecordedOp::Leave);
    }

    fn size(&self) -> (u16, u16) {
        self.size
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.ops.push(RecordedOp::Write(bytes.to_vec()));
    }

    fn flush(&mut self) {
        self.ops.push(RecordedOp::Flush);
    }

    fn poll_input(&mut self, _timeout: Duration) -> Option<InputEvent> {
        match self.script.pop_front() {
            Some(event) => Some(event),
            None if self.quit_when_drained => Some(InputEvent::Key(Key::Char('q'))),
            None => None,
        }
    }
}

/// Whether the environment asks for the in-memory terminal.
pub fn test_mode_requested() -> bool {
    std::env::var("SHOKO_TEST_MODE").is_ok_and(|v| v == "1")
}
