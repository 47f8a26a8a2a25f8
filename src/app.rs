//! The reader application: event loop, dispatcher, background workers.
//!
//! A single UI thread owns the state, polls input with a short timeout,
//! and drains a mailbox of worker messages each tick. Ingestion and
//! pagination run on background threads; a resize cancels any in-flight
//! pagination build and schedules a new one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::book::Book;
use crate::cache::{CacheCoordinator, CacheStore};
use crate::config::Config;
use crate::epub::{self, parse_chapter_blocks};
use crate::error::{Error, Result};
use crate::layout::{
    AbsolutePagination, ChapterCursor, DisplayLine, DynamicPagination, FormatOptions,
    LayoutCache, LayoutCacheKey, LayoutMetrics, PageNumbering, ViewMode, format_chapter,
};
use crate::logging::profile_phase;
use crate::render::{
    ContentColumn, Overlay, RenderRegistry, Renderer, ViewModel, kitty,
};
use crate::select::{self, Bias};
use crate::state::{Bookmark, Mode, NoteStore, Progress, ReaderState};
use crate::term::{InputEvent, Key, MouseInput, MouseKind, TerminalBuffer, TerminalPort};

/// Input poll timeout; keeps resizes and worker messages responsive.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Filesystem scan budget.
const SCAN_BUDGET: Duration = Duration::from_secs(10);
/// Byte budget for the in-memory formatted-chapter cache.
const LAYOUT_CACHE_BUDGET: usize = 8 * 1024 * 1024;

/// Messages from background workers, consumed in causal order.
enum WorkerMsg {
    Ingested(Box<Result<Book>>),
    Paginated {
        token: u64,
        chapter_lines: Vec<Vec<DisplayLine>>,
        dynamic: Option<DynamicPagination>,
    },
}

/// Pure dispatcher actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    NextPage,
    PrevPage,
    NextChapter,
    PrevChapter,
    FirstPage,
    LastPage,
    ToggleViewMode,
    CycleLineSpacing,
    ShowHelp,
    ShowToc,
    ShowBookmarks,
    ShowAnnotations,
    AddBookmark,
    Annotate,
    OverlayUp,
    OverlayDown,
    OverlaySelect,
    Back,
    EditorChar(char),
    EditorBackspace,
    EditorSave,
}

/// `(mode, key) -> action`, with no access to state.
pub fn action_for(mode: Mode, key: Key) -> Option<Action> {
    match mode {
        Mode::Read => match key {
            Key::Char('q') => Some(Action::Quit),
            Key::Char(' ') | Key::Char('j') | Key::Char('n') | Key::Down | Key::Right
            | Key::PageDown => Some(Action::NextPage),
            Key::Char('k') | Key::Char('p') | Key::Up | Key::Left | Key::PageUp => {
                Some(Action::PrevPage)
            }
            Key::Char(']') | Key::Char('L') => Some(Action::NextChapter),
            Key::Char('[') | Key::Char('H') => Some(Action::PrevChapter),
            Key::Home | Key::Char('g') => Some(Action::FirstPage),
            Key::End | Key::Char('G') => Some(Action::LastPage),
            Key::Char('v') => Some(Action::ToggleViewMode),
            Key::Char('s') => Some(Action::CycleLineSpacing),
            Key::Char('?') => Some(Action::ShowHelp),
            Key::Char('t') => Some(Action::ShowToc),
            Key::Char('b') => Some(Action::AddBookmark),
            Key::Char('B') => Some(Action::ShowBookmarks),
            Key::Char('a') => Some(Action::ShowAnnotations),
            Key::Char('m') => Some(Action::Annotate),
            Key::Esc => Some(Action::Back),
            _ => None,
        },
        Mode::AnnotationEditor => match key {
            Key::Enter => Some(Action::EditorSave),
            Key::Esc => Some(Action::Back),
            Key::Backspace => Some(Action::EditorBackspace),
            Key::Char(c) => Some(Action::EditorChar(c)),
            _ => None,
        },
        _ => match key {
            Key::Up | Key::Char('k') => Some(Action::OverlayUp),
            Key::Down | Key::Char('j') => Some(Action::OverlayDown),
            Key::Enter => Some(Action::OverlaySelect),
            Key::Esc | Key::Char('q') => Some(Action::Back),
            _ => None,
        },
    }
}

/// The assembled reader.
pub struct App {
    config: Config,
    config_dir: PathBuf,
    coordinator: Arc<CacheCoordinator>,
    notes: NoteStore,
    port: Box<dyn TerminalPort>,
    buffer: TerminalBuffer,
    renderer: Renderer,
    state: ReaderState,

    book: Option<Arc<Book>>,
    chapter_lines: Vec<Vec<DisplayLine>>,
    dynamic: Option<DynamicPagination>,
    absolute: AbsolutePagination,
    metrics: LayoutMetrics,
    /// Formatted-chapter LRU shared with the pagination worker,
    /// bounded by a byte budget.
    layout_cache: Arc<Mutex<LayoutCache>>,

    mailbox: Receiver<WorkerMsg>,
    mailbox_tx: Sender<WorkerMsg>,
    pagination_cancel: Arc<AtomicBool>,
    pagination_token: u64,
    transmitted_images: HashSet<u32>,
    kitty_graphics: bool,

    /// Library results from the last completed scan.
    library: Vec<PathBuf>,
    editor_buffer: String,
}

impl App {
    pub fn new(
        config: Config,
        config_dir: PathBuf,
        cache_dir: PathBuf,
        port: Box<dyn TerminalPort>,
    ) -> Self {
        let (cols, rows) = port.size();
        let (tx, rx) = channel();
        let registry = Arc::new(RenderRegistry::new());
        let metrics =
            LayoutMetrics::compute(cols, rows, config.view_mode, config.line_spacing);
        let kitty_graphics = config.image_rendering && kitty::graphics_supported();

        Self {
            coordinator: Arc::new(CacheCoordinator::new(Arc::new(CacheStore::new(cache_dir)))),
            notes: NoteStore::load(&config_dir),
            buffer: TerminalBuffer::new(cols, rows),
            renderer: Renderer::new(registry),
            state: ReaderState::new(),
            book: None,
            chapter_lines: Vec::new(),
            dynamic: None,
            absolute: AbsolutePagination::default(),
            metrics,
            layout_cache: Arc::new(Mutex::new(LayoutCache::new(LAYOUT_CACHE_BUDGET))),
            mailbox: rx,
            mailbox_tx: tx,
            pagination_cancel: Arc::new(AtomicBool::new(false)),
            pagination_token: 0,
            transmitted_images: HashSet::new(),
            kitty_graphics,
            library: Vec::new(),
            editor_buffer: String::new(),
            config,
            config_dir,
            port,
        }
    }

    /// Run the reader. With no path, open the library picker over the
    /// current directory and the recent list.
    pub fn run(&mut self, path: Option<&Path>) -> Result<()> {
        self.port.enter();
        let result = self.run_inner(path);
        self.port.leave();
        result
    }

    fn run_inner(&mut self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => self.request_open(path.to_path_buf()),
            None => self.open_library(),
        }

        while self.state.running {
            self.drain_mailbox();

            let (cols, rows) = self.port.size();
            if (cols, rows) != self.state.last_size {
                self.handle_resize(cols, rows);
            }

            self.render_frame();

            if let Some(event) = self.port.poll_input(POLL_TIMEOUT) {
                match event {
                    InputEvent::Key(key) => self.handle_key(key),
                    InputEvent::Mouse(mouse) => self.handle_mouse(mouse),
                    InputEvent::Resize(cols, rows) => self.handle_resize(cols, rows),
                }
            }
        }

        self.save_progress();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Opening books
    // ------------------------------------------------------------------

    fn request_open(&mut self, path: PathBuf) {
        self.state.say(format!("Opening {}", path.display()));
        let tx = self.mailbox_tx.clone();
        let coordinator = self.coordinator.clone();
        std::thread::spawn(move || {
            let started = Instant::now();
            let result = coordinator.open(&path).map(|book| (*book).clone());
            profile_phase("ingest", started);
            let _ = tx.send(WorkerMsg::Ingested(Box::new(result)));
        });
    }

    fn install_book(&mut self, book: Book) {
        let book = Arc::new(book);
        let path_key = book.source.path.to_string_lossy().into_owned();
        if let Err(e) = self.notes.touch_recent(&path_key) {
            log::warn!("recent list not saved: {e}");
        }

        // Restore the saved reading position.
        let progress = self.notes.progress(&path_key).cloned().unwrap_or_default();
        self.state.cursor = ChapterCursor {
            chapter: progress.chapter.min(book.chapters.len().saturating_sub(1)),
            line_offset: progress.line_offset,
        };
        self.state.page_index = 0;
        self.state.mode = Mode::Read;
        self.state.message = None;
        self.transmitted_images.clear();

        self.book = Some(book);
        self.schedule_pagination();
    }

    fn open_library(&mut self) {
        let scan = scan_for_epubs(Path::new("."), SCAN_BUDGET, &self.library);
        self.library = scan;
        for recent in self.notes.recent() {
            let path = PathBuf::from(recent);
            if path.exists() && !self.library.contains(&path) {
                self.library.insert(0, path);
            }
        }
        if self.library.is_empty() {
            self.state.say("No EPUB files found");
        }
        self.state.mode = Mode::Popup;
        self.state.overlay_selected = 0;
    }

    // ------------------------------------------------------------------
    // Pagination
    // ------------------------------------------------------------------

    /// Format every chapter and rebuild the page list off-thread.
    fn schedule_pagination(&mut self) {
        let Some(book) = self.book.clone() else {
            return;
        };

        // Cancel whatever build is still running.
        self.pagination_cancel.store(true, Ordering::Relaxed);
        self.pagination_cancel = Arc::new(AtomicBool::new(false));
        self.pagination_token += 1;

        let token = self.pagination_token;
        let cancel = self.pagination_cancel.clone();
        let tx = self.mailbox_tx.clone();
        let opts = FormatOptions {
            width: self.metrics.column_width,
            line_spacing: self.config.line_spacing,
            view_mode: self.config.view_mode,
            image_rendering: self.config.image_rendering,
        };
        let displayable = self.metrics.displayable_lines;
        let dynamic_mode = self.config.page_numbering == PageNumbering::Dynamic;
        let store = self.coordinator.store().clone();
        let memory_cache = self.layout_cache.clone();
        let layout_key = crate::cache::layout_key(
            opts.width,
            opts.view_mode.as_str(),
            opts.line_spacing.as_str(),
        );

        std::thread::spawn(move || {
            let started = Instant::now();
            let sha = book.source.sha256.clone();

            // Whole-book layout persisted from an earlier session?
            let mut chapter_lines: Option<Vec<Vec<DisplayLine>>> = store
                .fetch_layout(&sha, &layout_key)
                .and_then(|record| serde_json::from_str(&record.payload_json).ok())
                .filter(|lines: &Vec<Vec<DisplayLine>>| lines.len() == book.chapters.len());
            let from_disk = chapter_lines.is_some();

            let chapter_lines = match chapter_lines.take() {
                Some(lines) => lines,
                None => {
                    let mut lines = Vec::with_capacity(book.chapters.len());
                    for chapter in &book.chapters {
                        if cancel.load(Ordering::Relaxed) {
                            return;
                        }
                        let cache_key = LayoutCacheKey {
                            sha: sha.clone(),
                            chapter_index: chapter.position,
                            width: opts.width,
                            view_mode: opts.view_mode,
                            line_spacing: opts.line_spacing,
                        };
                        if let Ok(mut cache) = memory_cache.lock()
                            && let Some(cached) = cache.get(&cache_key)
                        {
                            lines.push(cached.clone());
                            continue;
                        }
                        let formatted = format_one_chapter(chapter, &opts);
                        if let Ok(mut cache) = memory_cache.lock() {
                            cache.put(cache_key, formatted.clone());
                        }
                        lines.push(formatted);
                    }
                    lines
                }
            };

            // Persist the layout; a failed write leaves the in-memory
            // result authoritative.
            if !from_disk && !cancel.load(Ordering::Relaxed) {
                match serde_json::to_string(&chapter_lines) {
                    Ok(payload) => {
                        if let Err(e) = store.store_layout(&sha, &layout_key, payload) {
                            log::warn!("layout not persisted: {e}");
                        }
                    }
                    Err(e) => log::warn!("layout not serializable: {e}"),
                }
            }

            let counts: Vec<usize> = chapter_lines.iter().map(Vec::len).collect();
            let dynamic = if dynamic_mode {
                match DynamicPagination::build(&counts, displayable, &cancel) {
                    Some(pages) => Some(pages),
                    None => return, // cancelled mid-build
                }
            } else {
                None
            };
            profile_phase("paginate", started);
            let _ = tx.send(WorkerMsg::Paginated {
                token,
                chapter_lines,
                dynamic,
            });
        });
    }

    fn drain_mailbox(&mut self) {
        while let Ok(message) = self.mailbox.try_recv() {
            match message {
                WorkerMsg::Ingested(result) => match *result {
                    Ok(book) => self.install_book(book),
                    Err(e) => {
                        log::error!("open failed: {e}");
                        self.state.say(user_message(&e));
                    }
                },
                WorkerMsg::Paginated {
                    token,
                    chapter_lines,
                    dynamic,
                } => {
                    if token != self.pagination_token {
                        continue; // superseded by a newer build
                    }
                    let counts: Vec<usize> = chapter_lines.iter().map(Vec::len).collect();
                    self.absolute =
                        AbsolutePagination::build(counts, self.metrics.displayable_lines);
                    self.chapter_lines = chapter_lines;
                    self.dynamic = dynamic;
                    self.clamp_position();
                    if self.state.message.as_deref().is_some_and(|m| m.starts_with("Opening")) {
                        self.state.message = None;
                    }
                    // Restore the page index from the chapter cursor.
                    if let Some(dynamic) = &self.dynamic {
                        self.state.page_index = dynamic
                            .page_at_line(self.state.cursor.chapter, self.state.cursor.line_offset)
                            .unwrap_or(0);
                    }
                }
            }
        }
    }

    fn handle_resize(&mut self, cols: u16, rows: u16) {
        self.state.last_size = (cols, rows);
        self.buffer.resize(cols, rows);
        self.metrics =
            LayoutMetrics::compute(cols, rows, self.config.view_mode, self.config.line_spacing);
        if let Ok(mut cache) = self.layout_cache.lock() {
            cache.retain_width(self.metrics.column_width);
        }
        self.transmitted_images.clear();
        self.schedule_pagination();
    }

    fn clamp_position(&mut self) {
        if let Some(dynamic) = &self.dynamic {
            if self.state.page_index >= dynamic.len() {
                self.state.page_index = dynamic.len().saturating_sub(1);
            }
        }
        let chapters = self.chapter_lines.len();
        if self.state.cursor.chapter >= chapters {
            self.state.cursor = ChapterCursor::default();
        }
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    fn handle_key(&mut self, key: Key) {
        let Some(action) = action_for(self.state.mode, key) else {
            return;
        };
        self.apply_action(action);
    }

    fn apply_action(&mut self, action: Action) {
        match action {
            Action::Quit => self.state.running = false,
            Action::NextPage => self.advance(1),
            Action::PrevPage => self.advance(-1),
            Action::NextChapter => self.jump_chapter(1),
            Action::PrevChapter => self.jump_chapter(-1),
            Action::FirstPage => {
                self.state.page_index = 0;
                self.state.cursor = ChapterCursor::default();
            }
            Action::LastPage => {
                if let Some(dynamic) = &self.dynamic {
                    self.state.page_index = dynamic.len().saturating_sub(1);
                    if let Some(page) = dynamic.page(self.state.page_index) {
                        self.state.cursor = ChapterCursor {
                            chapter: page.chapter_index,
                            line_offset: page.line_start,
                        };
                    }
                } else {
                    let last = self.chapter_lines.len().saturating_sub(1);
                    self.state.cursor = ChapterCursor {
                        chapter: last,
                        line_offset: 0,
                    };
                }
            }
            Action::ToggleViewMode => {
                self.config.view_mode = match self.config.view_mode {
                    ViewMode::Single => ViewMode::Split,
                    ViewMode::Split => ViewMode::Single,
                };
                self.persist_config();
                self.handle_resize(self.state.last_size.0, self.state.last_size.1);
            }
            Action::CycleLineSpacing => {
                use crate::layout::LineSpacing::*;
                self.config.line_spacing = match self.config.line_spacing {
                    Compact => Normal,
                    Normal => Relaxed,
                    Relaxed => Compact,
                };
                self.persist_config();
                self.state
                    .say(format!("Line spacing: {}", self.config.line_spacing.as_str()));
                self.handle_resize(self.state.last_size.0, self.state.last_size.1);
            }
            Action::ShowHelp => self.enter_overlay(Mode::Help),
            Action::ShowToc => self.enter_overlay(Mode::Toc),
            Action::ShowBookmarks => self.enter_overlay(Mode::Bookmarks),
            Action::ShowAnnotations => self.enter_overlay(Mode::Annotations),
            Action::AddBookmark => self.add_bookmark(),
            Action::Annotate => {
                if self.state.selection.is_some() {
                    self.editor_buffer.clear();
                    self.state.mode = Mode::AnnotationEditor;
                } else {
                    self.state.say("Select text first (drag with the mouse)");
                }
            }
            Action::OverlayUp => {
                self.state.overlay_selected = self.state.overlay_selected.saturating_sub(1);
            }
            Action::OverlayDown => {
                let max = self.overlay_len().saturating_sub(1);
                self.state.overlay_selected = (self.state.overlay_selected + 1).min(max);
            }
            Action::OverlaySelect => self.overlay_select(),
            Action::Back => {
                if self.state.mode == Mode::Read {
                    self.state.message = None;
                    self.state.selection = None;
                } else {
                    self.state.mode = Mode::Read;
                }
            }
            Action::EditorChar(c) => self.editor_buffer.push(c),
            Action::EditorBackspace => {
                self.editor_buffer.pop();
            }
            Action::EditorSave => self.save_annotation(),
        }
    }

    fn handle_mouse(&mut self, mouse: MouseInput) {
        match mouse.kind {
            MouseKind::ScrollDown => self.advance(1),
            MouseKind::ScrollUp => self.advance(-1),
            MouseKind::LeftDown => {
                let frame = self.renderer.registry().snapshot();
                self.state.pending_selection =
                    select::anchor_from_point(&frame, mouse.x, mouse.y, Bias::Leading);
                self.state.selection = None;
            }
            MouseKind::LeftDrag | MouseKind::LeftUp => {
                let Some(start) = self.state.pending_selection.clone() else {
                    return;
                };
                let frame = self.renderer.registry().snapshot();
                if let Some(end) =
                    select::anchor_from_point(&frame, mouse.x, mouse.y, Bias::Trailing)
                {
                    let range = select::SelectionRange::new(start, end);
                    if mouse.kind == MouseKind::LeftUp {
                        let resolved = select::resolve_text(&frame, &range);
                        if !resolved.is_empty() {
                            self.state
                                .say(format!("Selected {} chars (m: annotate)", resolved.chars().count()));
                        }
                        self.state.pending_selection = None;
                    }
                    self.state.selection = Some(range);
                }
            }
        }
    }

    fn advance(&mut self, direction: i32) {
        let steps = if self.config.view_mode == ViewMode::Split { 2 } else { 1 };
        match self.config.page_numbering {
            PageNumbering::Dynamic => {
                let Some(dynamic) = &self.dynamic else { return };
                let len = dynamic.len();
                let mut index = self.state.page_index as i64;
                index += direction as i64 * steps as i64;
                self.state.page_index = index.clamp(0, len.saturating_sub(1) as i64) as usize;
                if let Some(page) = dynamic.page(self.state.page_index) {
                    self.state.cursor = ChapterCursor {
                        chapter: page.chapter_index,
                        line_offset: page.line_start,
                    };
                }
            }
            PageNumbering::Absolute => {
                for _ in 0..steps {
                    self.state.cursor = if direction > 0 {
                        self.absolute.next_page(self.state.cursor)
                    } else {
                        self.absolute.prev_page(self.state.cursor)
                    };
                }
            }
        }
        self.save_progress();
    }

    fn jump_chapter(&mut self, direction: i32) {
        match self.config.page_numbering {
            PageNumbering::Dynamic => {
                let Some(dynamic) = &self.dynamic else { return };
                let target = if direction > 0 {
                    dynamic.next_chapter_page(self.state.page_index)
                } else {
                    let chapter = dynamic.chapter_at(self.state.page_index).unwrap_or(0);
                    let first = dynamic.page_for_chapter(chapter);
                    if first == Some(self.state.page_index) && chapter > 0 {
                        dynamic.page_for_chapter(chapter - 1)
                    } else {
                        first
                    }
                };
                if let Some(page_index) = target {
                    self.state.page_index = page_index;
                    if let Some(page) = dynamic.page(page_index) {
                        self.state.cursor = ChapterCursor {
                            chapter: page.chapter_index,
                            line_offset: page.line_start,
                        };
                    }
                }
            }
            PageNumbering::Absolute => {
                self.state.cursor = if direction > 0 {
                    self.absolute.next_chapter(self.state.cursor)
                } else {
                    self.absolute.prev_chapter(self.state.cursor)
                };
            }
        }
        self.save_progress();
    }

    // ------------------------------------------------------------------
    // Overlays, bookmarks, annotations
    // ------------------------------------------------------------------

    fn enter_overlay(&mut self, mode: Mode) {
        self.state.mode = if self.state.mode == mode { Mode::Read } else { mode };
        self.state.overlay_selected = 0;
    }

    fn overlay_len(&self) -> usize {
        let Some(book) = &self.book else {
            return if self.state.mode == Mode::Popup {
                self.library.len()
            } else {
                0
            };
        };
        let path_key = book.source.path.to_string_lossy().into_owned();
        match self.state.mode {
            Mode::Toc => book.toc.len(),
            Mode::Bookmarks => self.notes.bookmarks(&path_key).len(),
            Mode::Annotations => self.notes.annotations(&path_key).len(),
            Mode::Popup => self.library.len(),
            _ => 0,
        }
    }

    fn overlay_select(&mut self) {
        let selected = self.state.overlay_selected;
        match self.state.mode {
            Mode::Popup => {
                if let Some(path) = self.library.get(selected).cloned() {
                    self.state.mode = Mode::Read;
                    self.request_open(path);
                }
            }
            Mode::Toc => {
                let Some(book) = &self.book else { return };
                let Some(entry) = book.toc.get(selected) else {
                    return;
                };
                if let Some(chapter) = entry.chapter_index {
                    self.go_to(chapter, 0);
                    self.state.mode = Mode::Read;
                } else {
                    self.state.say("Part heading has no target");
                }
            }
            Mode::Bookmarks => {
                let Some(book) = &self.book else { return };
                let path_key = book.source.path.to_string_lossy().into_owned();
                if let Some(bookmark) = self.notes.bookmarks(&path_key).get(selected).cloned() {
                    self.go_to(bookmark.chapter, bookmark.line_offset);
                    self.state.mode = Mode::Read;
                }
            }
            Mode::Annotations => {
                let Some(book) = &self.book else { return };
                let path_key = book.source.path.to_string_lossy().into_owned();
                if let Some(annotation) =
                    self.notes.annotations(&path_key).get(selected).cloned()
                {
                    self.go_to(annotation.chapter, annotation.range.start.line_offset);
                    self.state.mode = Mode::Read;
                }
            }
            _ => {}
        }
    }

    fn go_to(&mut self, chapter: usize, line_offset: usize) {
        self.state.cursor = ChapterCursor {
            chapter,
            line_offset,
        };
        if let Some(dynamic) = &self.dynamic {
            self.state.page_index = dynamic
                .page_at_line(chapter, line_offset)
                .or_else(|| dynamic.page_for_chapter(chapter))
                .unwrap_or(0);
        }
        self.save_progress();
    }

    fn add_bookmark(&mut self) {
        let Some(book) = &self.book else { return };
        let path_key = book.source.path.to_string_lossy().into_owned();
        let cursor = self.current_position();
        let snippet = self
            .chapter_lines
            .get(cursor.chapter)
            .and_then(|lines| {
                lines[cursor.line_offset.min(lines.len().saturating_sub(1))..]
                    .iter()
                    .find(|l| !l.text.trim().is_empty())
            })
            .map(|l| crate::text::truncate_to(&l.text, 60))
            .unwrap_or_default();

        let result = self.notes.add_bookmark(
            &path_key,
            Bookmark {
                chapter: cursor.chapter,
                line_offset: cursor.line_offset,
                text: snippet,
                timestamp: chrono::Utc::now().timestamp(),
            },
        );
        match result {
            Ok(()) => self.state.say("Bookmark added"),
            Err(e) => {
                log::warn!("bookmark not saved: {e}");
                self.state.say("Bookmark could not be saved");
            }
        }
    }

    fn save_annotation(&mut self) {
        let Some(book) = &self.book else { return };
        let Some(range) = self.state.selection.clone() else {
            self.state.mode = Mode::Read;
            return;
        };
        let path_key = book.source.path.to_string_lossy().into_owned();
        let frame = self.renderer.registry().snapshot();
        let text = select::resolve_text(&frame, &range);
        let chapter = self.current_position().chapter;
        let note = std::mem::take(&mut self.editor_buffer);

        match self
            .notes
            .add_annotation(&path_key, chapter, range, text, note, chrono::Utc::now().timestamp())
        {
            Ok(_) => self.state.say("Annotation saved"),
            Err(e) => {
                log::warn!("annotation not saved: {e}");
                self.state.say("Annotation could not be saved");
            }
        }
        self.state.selection = None;
        self.state.mode = Mode::Read;
    }

    fn save_progress(&mut self) {
        let Some(book) = &self.book else { return };
        let path_key = book.source.path.to_string_lossy().into_owned();
        let cursor = self.current_position();
        let result = self.notes.set_progress(
            &path_key,
            Progress {
                chapter: cursor.chapter,
                line_offset: cursor.line_offset,
                timestamp: chrono::Utc::now().timestamp(),
            },
        );
        if let Err(e) = result {
            log::warn!("progress not saved: {e}");
        }
    }

    fn persist_config(&mut self) {
        if let Err(e) = self.config.save(&self.config_dir) {
            log::warn!("config not saved: {e}");
        }
    }

    /// The effective reading position under either numbering policy.
    fn current_position(&self) -> ChapterCursor {
        match self.config.page_numbering {
            PageNumbering::Absolute => self.state.cursor,
            PageNumbering::Dynamic => self
                .dynamic
                .as_ref()
                .and_then(|d| d.page(self.state.page_index))
                .map(|page| ChapterCursor {
                    chapter: page.chapter_index,
                    line_offset: page.line_start,
                })
                .unwrap_or(self.state.cursor),
        }
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    fn render_frame(&mut self) {
        let started = Instant::now();
        let view = self.view_model();
        self.transmit_pending_images(&view);
        self.renderer
            .render(&view, &mut self.buffer, self.port.as_mut());
        profile_phase("render", started);
    }

    /// Send Kitty transmissions for placements visible in this frame.
    fn transmit_pending_images(&mut self, view: &ViewModel) {
        if !self.kitty_graphics {
            return;
        }
        let Some(book) = &self.book else { return };
        let mut payloads: Vec<(u32, Vec<u8>, usize, usize)> = Vec::new();
        for column in &view.columns {
            for (_, line) in &column.lines {
                let Some(placement) = &line.meta.image else {
                    continue;
                };
                if self.transmitted_images.contains(&placement.placement_id) {
                    continue;
                }
                let chapter_dir = line
                    .meta
                    .chapter_path
                    .rsplit_once('/')
                    .map(|(dir, _)| dir)
                    .unwrap_or("");
                let resolved = epub::resolve_relative(chapter_dir, &placement.src);
                let Some(resource) = book
                    .resources
                    .get(&resolved)
                    .or_else(|| book.resources.get(&placement.src))
                else {
                    continue;
                };
                if let Some(png) = kitty::ensure_png(&resource.data, &placement.src) {
                    payloads.push((
                        placement.placement_id,
                        png,
                        placement.cols,
                        placement.rows,
                    ));
                }
            }
        }
        for (id, png, cols, rows) in payloads {
            self.port
                .write_bytes(&kitty::transmit_virtual(id, &png, cols, rows));
            self.transmitted_images.insert(id);
        }
    }

    fn view_model(&self) -> ViewModel {
        let book = self.book.as_deref();
        let position = self.current_position();
        let chapter_title = book
            .and_then(|b| b.chapters.get(position.chapter))
            .and_then(|c| c.title.clone())
            .unwrap_or_default();

        let (chapter_progress, page_progress) = match self.config.page_numbering {
            PageNumbering::Dynamic => {
                let total = self.dynamic.as_ref().map(|d| d.len()).unwrap_or(0);
                (
                    format!(
                        "ch {}/{}",
                        position.chapter + 1,
                        book.map(|b| b.chapters.len()).unwrap_or(0)
                    ),
                    format!("page {}/{}", self.state.page_index + 1, total.max(1)),
                )
            }
            PageNumbering::Absolute => (
                format!(
                    "ch {}/{}",
                    position.chapter + 1,
                    book.map(|b| b.chapters.len()).unwrap_or(0)
                ),
                format!(
                    "page {}/{}",
                    self.absolute.page_within_chapter(self.state.cursor),
                    self.absolute
                        .page_map()
                        .get(position.chapter)
                        .copied()
                        .unwrap_or(1)
                ),
            ),
        };

        ViewModel {
            page_id: self.page_id(),
            document_title: book.map(|b| b.title.clone()).unwrap_or_default(),
            chapter_title,
            chapter_progress,
            page_progress,
            view_mode: self.config.view_mode,
            line_spacing: self.config.line_spacing,
            mode: self.state.mode,
            message: self.state.message.clone(),
            columns: self.columns(),
            overlay: self.overlay(),
            show_page_numbers: self.config.show_page_numbers,
            kitty_graphics: self.kitty_graphics,
        }
    }

    fn page_id(&self) -> u64 {
        match self.config.page_numbering {
            PageNumbering::Dynamic => self.state.page_index as u64,
            PageNumbering::Absolute => {
                (self.state.cursor.chapter as u64) << 32 | self.state.cursor.line_offset as u64
            }
        }
    }

    fn columns(&self) -> Vec<ContentColumn> {
        let (cols, _) = self.state.last_size;
        let width = self.metrics.column_width;
        let height = self.metrics.displayable_lines;

        let slices: Vec<(usize, usize, usize)> = match self.config.page_numbering {
            PageNumbering::Dynamic => {
                let Some(dynamic) = &self.dynamic else {
                    return Vec::new();
                };
                let mut slices = Vec::new();
                let count = if self.config.view_mode == ViewMode::Split { 2 } else { 1 };
                for offset in 0..count {
                    if let Some(page) = dynamic.page(self.state.page_index + offset) {
                        slices.push((page.chapter_index, page.line_start, page.line_end));
                    }
                }
                slices
            }
            PageNumbering::Absolute => {
                let cursor = self.state.cursor;
                let count = if self.config.view_mode == ViewMode::Split { 2 } else { 1 };
                (0..count)
                    .map(|i| {
                        let start = cursor.line_offset + i * height;
                        (cursor.chapter, start, start + height)
                    })
                    .collect()
            }
        };

        let gap = 4usize;
        slices
            .into_iter()
            .enumerate()
            .map(|(i, (chapter, start, end))| {
                let origin = match self.config.view_mode {
                    ViewMode::Single => {
                        ((cols as usize).saturating_sub(width) / 2) as u16
                    }
                    ViewMode::Split => {
                        (2 + i * (width + gap)) as u16
                    }
                };
                let lines: Vec<(usize, DisplayLine)> = self
                    .chapter_lines
                    .get(chapter)
                    .map(|all| {
                        all.iter()
                            .enumerate()
                            .skip(start)
                            .take(end.saturating_sub(start).min(height))
                            .map(|(offset, line)| (offset, line.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                let page_number = self.dynamic.as_ref().map(|_| {
                    format!("{}", self.state.page_index + i + 1)
                });
                ContentColumn {
                    column_id: i as u8,
                    origin,
                    width,
                    lines,
                    page_number,
                }
            })
            .collect()
    }

    fn overlay(&self) -> Option<Overlay> {
        let book = self.book.as_deref();
        match self.state.mode {
            Mode::Help => Some(Overlay::Help(
                HELP_TEXT.lines().map(str::to_string).collect(),
            )),
            Mode::Toc => book.map(|b| Overlay::List {
                title: "Table of Contents".into(),
                items: b
                    .toc
                    .iter()
                    .map(|e| format!("{}{}", "  ".repeat(e.level), e.title))
                    .collect(),
                selected: self.state.overlay_selected,
            }),
            Mode::Bookmarks => book.map(|b| {
                let path_key = b.source.path.to_string_lossy().into_owned();
                Overlay::List {
                    title: "Bookmarks".into(),
                    items: self
                        .notes
                        .bookmarks(&path_key)
                        .iter()
                        .map(|m| format!("ch{} +{}  {}", m.chapter + 1, m.line_offset, m.text))
                        .collect(),
                    selected: self.state.overlay_selected,
                }
            }),
            Mode::Annotations => book.map(|b| {
                let path_key = b.source.path.to_string_lossy().into_owned();
                Overlay::List {
                    title: "Annotations".into(),
                    items: self
                        .notes
                        .annotations(&path_key)
                        .iter()
                        .map(|a| {
                            let text = crate::text::truncate_to(&a.text, 40);
                            if a.note.is_empty() {
                                text
                            } else {
                                format!("{text} \u{2014} {}", a.note)
                            }
                        })
                        .collect(),
                    selected: self.state.overlay_selected,
                }
            }),
            Mode::Popup => Some(Overlay::List {
                title: "Library".into(),
                items: self
                    .library
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
                selected: self.state.overlay_selected,
            }),
            Mode::AnnotationEditor => Some(Overlay::Editor {
                title: "Annotation note".into(),
                buffer: self.editor_buffer.clone(),
            }),
            Mode::Read => None,
        }
    }
}

const HELP_TEXT: &str = "\
Navigation
  space/j/n     next page        k/p        previous page
  ]  [          chapter forward / back
  g  G          first / last page
  t             table of contents
Reading
  v             toggle single/split view
  s             cycle line spacing
  b  B          add bookmark / list bookmarks
  drag + m      annotate selection
  a             list annotations
Other
  ?             this help
  q             quit";

/// Parse and format one chapter, degrading to the placeholder line when
/// the body cannot be formatted.
fn format_one_chapter(chapter: &crate::book::Chapter, opts: &FormatOptions) -> Vec<DisplayLine> {
    let blocks = match chapter
        .blocks
        .clone()
        .map(Ok)
        .unwrap_or_else(|| parse_chapter_blocks(&chapter.file_path, &chapter.raw_xhtml))
    {
        Ok(blocks) => blocks,
        Err(e) => {
            log::warn!("{e}");
            Vec::new()
        }
    };
    if blocks.is_empty() && !chapter.raw_xhtml.is_empty() {
        return vec![unavailable_line(chapter.position)];
    }
    format_chapter(chapter, &blocks, opts)
}

fn unavailable_line(chapter_index: usize) -> DisplayLine {
    DisplayLine {
        text: "[chapter unavailable]".to_string(),
        segments: vec![crate::book::TextSegment::plain("[chapter unavailable]")],
        meta: crate::layout::LineMeta {
            kind: Some(crate::layout::LineKind::Paragraph),
            chapter_index,
            ..crate::layout::LineMeta::default()
        },
    }
}

fn user_message(error: &Error) -> String {
    match error {
        Error::FileNotFound(_) => "File not found".to_string(),
        Error::ZipRead { .. } | Error::InvalidArchive(_) => "Cannot open book".to_string(),
        Error::ZipLimitExceeded(limit) => format!("Book refused: {limit}"),
        other => other.to_string(),
    }
}

/// Scan a directory tree for `.epub` files within a time budget; on
/// overrun the previous scan result wins.
fn scan_for_epubs(root: &Path, budget: Duration, previous: &[PathBuf]) -> Vec<PathBuf> {
    let started = Instant::now();
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        if started.elapsed() > budget {
            log::warn!("library scan exceeded {budget:?}; using previous result");
            return previous.to_vec();
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'))
                {
                    pending.push(path);
                }
            } else if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("epub"))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}
