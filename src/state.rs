//! Reader state and the persistent note stores.
//!
//! The state struct is owned by the event loop; background workers
//! communicate through the mailbox in [`crate::app`], never by mutating
//! state directly. Bookmarks, annotations, reading progress and the
//! recent-books list persist under the config root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::store::write_json_atomic;
use crate::error::Result;
use crate::layout::ChapterCursor;
use crate::select::SelectionRange;

/// What the content region is currently showing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Read,
    Help,
    Toc,
    Bookmarks,
    Annotations,
    AnnotationEditor,
    Popup,
}

/// Mutable session state owned by the UI thread.
#[derive(Debug, Default)]
pub struct ReaderState {
    pub mode: Mode,
    /// Cursor for absolute pagination (scroll within chapter).
    pub cursor: ChapterCursor,
    /// Page index for dynamic pagination.
    pub page_index: usize,
    /// Selected row in list overlays (TOC, bookmarks, annotations).
    pub overlay_selected: usize,
    pub sidebar_visible: bool,
    pub last_size: (u16, u16),
    /// Transient status message shown centered over the content.
    pub message: Option<String>,
    pub running: bool,
    /// In-progress mouse selection (anchor set on press).
    pub pending_selection: Option<crate::select::SelectionAnchor>,
    pub selection: Option<SelectionRange>,
}

impl ReaderState {
    pub fn new() -> Self {
        Self {
            running: true,
            ..Self::default()
        }
    }

    pub fn say(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }
}

// ============================================================================
// Persistent notes
// ============================================================================

/// A saved reading position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub chapter: usize,
    pub line_offset: usize,
    pub timestamp: i64,
}

/// A bookmark: position plus a context snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub chapter: usize,
    pub line_offset: usize,
    pub text: String,
    pub timestamp: i64,
}

/// A highlighted range with an optional note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: u64,
    pub chapter: usize,
    pub range: SelectionRange,
    pub text: String,
    #[serde(default)]
    pub note: String,
    pub timestamp: i64,
}

/// All per-user note files, keyed by book path.
pub struct NoteStore {
    root: PathBuf,
    bookmarks: BTreeMap<String, Vec<Bookmark>>,
    annotations: BTreeMap<String, Vec<Annotation>>,
    progress: BTreeMap<String, Progress>,
    recent: Vec<String>,
}

const BOOKMARKS_FILE: &str = "bookmarks.json";
const ANNOTATIONS_FILE: &str = "annotations.json";
const PROGRESS_FILE: &str = "progress.json";
const RECENT_FILE: &str = "recent.json";
const RECENT_CAP: usize = 32;

impl NoteStore {
    /// Load every store; unreadable files start empty.
    pub fn load(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            bookmarks: read_or_default(&root.join(BOOKMARKS_FILE)),
            annotations: read_or_default(&root.join(ANNOTATIONS_FILE)),
            progress: read_or_default(&root.join(PROGRESS_FILE)),
            recent: read_or_default(&root.join(RECENT_FILE)),
            root,
        }
    }

    // -- bookmarks ------------------------------------------------------

    pub fn bookmarks(&self, book_path: &str) -> &[Bookmark] {
        self.bookmarks
            .get(book_path)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn add_bookmark(&mut self, book_path: &str, bookmark: Bookmark) -> Result<()> {
        let list = self.bookmarks.entry(book_path.to_string()).or_default();
        // One bookmark per line; replace instead of stacking.
        list.retain(|b| {
            !(b.chapter == bookmark.chapter && b.line_offset == bookmark.line_offset)
        });
        list.push(bookmark);
        list.sort_by_key(|b| (b.chapter, b.line_offset));
        self.save_bookmarks()
    }

    pub fn remove_bookmark(&mut self, book_path: &str, index: usize) -> Result<()> {
        if let Some(list) = self.bookmarks.get_mut(book_path)
            && index < list.len()
        {
            list.remove(index);
        }
        self.save_bookmarks()
    }

    fn save_bookmarks(&self) -> Result<()> {
        self.persist(BOOKMARKS_FILE, &self.bookmarks)
    }

    // -- annotations ----------------------------------------------------

    pub fn annotations(&self, book_path: &str) -> &[Annotation] {
        self.annotations
            .get(book_path)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn add_annotation(
        &mut self,
        book_path: &str,
        chapter: usize,
        range: SelectionRange,
        text: String,
        note: String,
        timestamp: i64,
    ) -> Result<u64> {
        let list = self.annotations.entry(book_path.to_string()).or_default();
        let id = list.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        list.push(Annotation {
            id,
            chapter,
            range,
            text,
            note,
            timestamp,
        });
        self.persist(ANNOTATIONS_FILE, &self.annotations)?;
        Ok(id)
    }

    pub fn set_annotation_note(&mut self, book_path: &str, id: u64, note: String) -> Result<()> {
        if let Some(list) = self.annotations.get_mut(book_path)
            && let Some(annotation) = list.iter_mut().find(|a| a.id == id)
        {
            annotation.note = note;
        }
        self.persist(ANNOTATIONS_FILE, &self.annotations)
    }

    pub fn remove_annotation(&mut self, book_path: &str, id: u64) -> Result<()> {
        if let Some(list) = self.annotations.get_mut(book_path) {
            list.retain(|a| a.id != id);
        }
        self.persist(ANNOTATIONS_FILE, &self.annotations)
    }

    // -- progress -------------------------------------------------------

    pub fn progress(&self, book_path: &str) -> Option<&Progress> {
        self.progress.get(book_path)
    }

    pub fn set_progress(&mut self, book_path: &str, progress: Progress) -> Result<()> {
        self.progress.insert(book_path.to_string(), progress);
        self.persist(PROGRESS_FILE, &self.progress)
    }

    // -- recent ---------------------------------------------------------

    pub fn recent(&self) -> &[String] {
        &self.recent
    }

    pub fn touch_recent(&mut self, book_path: &str) -> Result<()> {
        self.recent.retain(|p| p != book_path);
        self.recent.insert(0, book_path.to_string());
        self.recent.truncate(RECENT_CAP);
        self.persist(RECENT_FILE, &self.recent)
    }

    fn persist<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| crate::error::Error::CacheWrite {
            path: self.root.clone(),
            source: e,
        })?;
        write_json_atomic(&self.root.join(file), value)
    }
}

fn read_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            log::warn!("unreadable {}: {e}", path.display());
            T::default()
        }),
        Err(_) => T::default(),
    }
}
