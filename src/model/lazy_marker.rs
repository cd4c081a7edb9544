/// Markers that name a position in a file that may not be open yet
///
/// A `LazyMarker` only remembers a path and a position. The document is
/// loaded through the `DocumentRegistry` the first time the marker's range
/// is asked for; from then on the marker is backed by a real marker in that
/// document and follows its edits. Disposing a marker that was never
/// resolved does not load anything.
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use anyhow::{Context, Result};

use crate::model::document::{Document, TextBuffer};
use crate::model::marker::{MarkerId, MarkerOptions, TextRange};

pub type SharedDocument = Rc<RefCell<Document>>;

/// Source of documents for the registry
pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Document>;
}

/// Loads UTF-8 files from the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl DocumentLoader for FileLoader {
    fn load(&self, path: &Path) -> Result<Document> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Document::new(text))
    }
}

/// Open documents, keyed by path
pub struct DocumentRegistry {
    loader: Box<dyn DocumentLoader>,
    open: HashMap<PathBuf, SharedDocument>,
}

impl DocumentRegistry {
    pub fn new(loader: impl DocumentLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            open: HashMap::new(),
        }
    }

    /// The document at `path` if it is already open; never loads
    pub fn get(&self, path: &Path) -> Option<SharedDocument> {
        self.open.get(path).cloned()
    }

    /// The document at `path`, loading it on first use
    pub fn open(&mut self, path: &Path) -> Result<SharedDocument> {
        if let Some(document) = self.open.get(path) {
            return Ok(Rc::clone(document));
        }
        let document = Rc::new(RefCell::new(self.loader.load(path)?));
        tracing::debug!(path = %path.display(), "document loaded");
        self.open.insert(path.to_path_buf(), Rc::clone(&document));
        Ok(document)
    }

    /// Register an already built document under `path`
    pub fn insert(&mut self, path: impl Into<PathBuf>, document: Document) -> SharedDocument {
        let document = Rc::new(RefCell::new(document));
        self.open.insert(path.into(), Rc::clone(&document));
        document
    }

    /// Drop the registry's handle on a document
    pub fn close(&mut self, path: &Path) -> Option<SharedDocument> {
        self.open.remove(path)
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.open.contains_key(path)
    }
}

/// Where a lazy marker starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyPosition {
    /// Byte offset from start of file
    Offset(usize),
    /// 0-based line and byte column
    LineColumn { line: usize, column: usize },
}

#[derive(Debug)]
enum LazyState {
    Pending,
    Attached {
        document: Weak<RefCell<Document>>,
        id: MarkerId,
    },
    Disposed,
}

#[derive(Debug)]
pub struct LazyMarker {
    path: PathBuf,
    position: LazyPosition,
    len: usize,
    options: MarkerOptions,
    state: LazyState,
}

impl LazyMarker {
    pub fn new(
        path: impl Into<PathBuf>,
        position: LazyPosition,
        len: usize,
        options: MarkerOptions,
    ) -> Self {
        Self {
            path: path.into(),
            position,
            len,
            options,
            state: LazyState::Pending,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> LazyPosition {
        self.position
    }

    /// Whether a real marker currently backs this one
    pub fn is_resolved(&self) -> bool {
        matches!(&self.state, LazyState::Attached { document, .. } if document.strong_count() > 0)
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state, LazyState::Disposed)
    }

    /// Create the backing marker if there is none yet.
    ///
    /// Positions past the end of a line or of the document are clamped. If
    /// the document this marker was resolved against has been dropped, the
    /// marker is resolved again against a freshly opened copy.
    pub fn resolve(&mut self, registry: &mut DocumentRegistry) -> Result<Option<MarkerId>> {
        match &self.state {
            LazyState::Disposed => return Ok(None),
            LazyState::Attached { document, id } if document.strong_count() > 0 => {
                return Ok(Some(*id))
            }
            _ => {}
        }

        let document = registry.open(&self.path)?;
        let id = {
            let mut doc = document.borrow_mut();
            let start = match self.position {
                LazyPosition::Offset(offset) => doc.clamp_offset(offset),
                LazyPosition::LineColumn { line, column } => doc
                    .line_col_to_offset(line, column)
                    .unwrap_or_else(|| doc.len()),
            };
            let end = doc.clamp_offset(start.saturating_add(self.len));
            doc.create_range_marker(TextRange::new(start, end), self.options)
                .with_context(|| {
                    format!("Failed to place marker in {}", self.path.display())
                })?
        };

        tracing::debug!(path = %self.path.display(), marker = id.0, "lazy marker resolved");
        self.state = LazyState::Attached {
            document: Rc::downgrade(&document),
            id,
        };
        Ok(Some(id))
    }

    /// Current range, loading the document if needed.
    ///
    /// `None` once the marker is disposed. An invalidated marker reports its
    /// last valid range.
    pub fn range(&mut self, registry: &mut DocumentRegistry) -> Result<Option<TextRange>> {
        let Some(id) = self.resolve(registry)? else {
            return Ok(None);
        };
        Ok(self
            .document()
            .and_then(|document| document.borrow().marker_range(id)))
    }

    pub fn is_valid(&mut self, registry: &mut DocumentRegistry) -> Result<bool> {
        let Some(id) = self.resolve(registry)? else {
            return Ok(false);
        };
        Ok(self
            .document()
            .is_some_and(|document| document.borrow().is_valid(id)))
    }

    /// Dispose the marker without ever loading its document.
    ///
    /// Returns true if a backing marker was removed.
    pub fn dispose(&mut self) -> bool {
        let state = std::mem::replace(&mut self.state, LazyState::Disposed);
        match state {
            LazyState::Attached { document, id } => {
                let Some(document) = document.upgrade() else {
                    return false;
                };
                let mut document = document.borrow_mut();
                let removed = document.dispose(id);
                document.forget(id);
                removed
            }
            LazyState::Pending | LazyState::Disposed => false,
        }
    }

    fn document(&self) -> Option<SharedDocument> {
        match &self.state {
            LazyState::Attached { document, .. } => document.upgrade(),
            _ => None,
        }
    }
}
