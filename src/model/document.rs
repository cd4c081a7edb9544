/// A text buffer that owns the range markers anchored to it
///
/// `Document` keeps its text in a `String` addressed by byte offsets and
/// notifies its `MarkerTree` of every change, so markers always describe
/// the current text. Replacements are minimised before they are applied:
/// the common prefix and suffix of the old and new text are stripped, and a
/// replacement with identical text is dropped entirely.
///
/// Offsets must fall on `char` boundaries; anything else is rejected with
/// `MarkerError::NotCharBoundary` before the text is touched.
use crate::config::MarkerTreeConfig;
use crate::error::{MarkerError, Result};
use crate::model::edit::DocumentChange;
use crate::model::marker::{MarkerId, MarkerOptions, TextRange};
use crate::model::marker_tree::MarkerTree;

/// Read access to the text that markers are anchored to
pub trait TextBuffer {
    /// Length in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text of `range`, or `None` if it is out of bounds or splits a character
    fn text_in(&self, range: TextRange) -> Option<&str>;

    /// Number of lines; an empty buffer has one line
    fn line_count(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct Document {
    text: String,
    markers: MarkerTree,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_config(text, MarkerTreeConfig::default())
    }

    pub fn with_config(text: impl Into<String>, config: MarkerTreeConfig) -> Self {
        Self {
            text: text.into(),
            markers: MarkerTree::with_config(config),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Shared access to the marker tree for queries and iteration
    pub fn markers(&self) -> &MarkerTree {
        &self.markers
    }

    /// Mutable access for per-marker attributes (values, tastes, flags).
    ///
    /// Text changes must go through the document, never through
    /// `MarkerTree::update_on_change` directly.
    pub fn markers_mut(&mut self) -> &mut MarkerTree {
        &mut self.markers
    }

    // ===== Markers =====

    /// Create a zero-length marker at `offset`
    pub fn create_marker(&mut self, offset: usize, options: MarkerOptions) -> Result<MarkerId> {
        self.create_range_marker(TextRange::point(offset), options)
    }

    pub fn create_range_marker(
        &mut self,
        range: TextRange,
        options: MarkerOptions,
    ) -> Result<MarkerId> {
        self.check_range(range.start, range.end)?;
        self.markers.add_interval(range.start, range.end, options)
    }

    /// Remove a marker. Disposing twice is harmless and returns false.
    pub fn dispose(&mut self, id: MarkerId) -> bool {
        self.markers.remove_interval(id)
    }

    /// Remove a marker and release everything kept for it, including its
    /// last range. Returns false for ids the document no longer knows.
    pub fn forget(&mut self, id: MarkerId) -> bool {
        self.markers.forget(id)
    }

    /// Release the last ranges of all disposed and invalidated markers
    pub fn forget_invalid(&mut self) -> usize {
        self.markers.forget_invalid()
    }

    pub fn marker_range(&self, id: MarkerId) -> Option<TextRange> {
        self.markers.range(id)
    }

    pub fn is_valid(&self, id: MarkerId) -> bool {
        self.markers.is_valid(id)
    }

    /// Text currently covered by a valid marker
    pub fn marker_text(&self, id: MarkerId) -> Result<&str> {
        if !self.markers.is_valid(id) {
            return Err(MarkerError::UnknownMarker(id));
        }
        self.markers
            .range(id)
            .and_then(|range| self.text_in(range))
            .ok_or(MarkerError::UnknownMarker(id))
    }

    // ===== Editing =====

    pub fn insert_string(&mut self, offset: usize, text: &str) -> Result<()> {
        self.check_range(offset, offset)?;
        if text.is_empty() {
            return Ok(());
        }
        self.apply(DocumentChange::insert(offset, text));
        Ok(())
    }

    pub fn delete_string(&mut self, start: usize, end: usize) -> Result<()> {
        self.check_range(start, end)?;
        if start == end {
            return Ok(());
        }
        let old_text = self.text[start..end].to_string();
        self.apply(DocumentChange::delete(start, old_text));
        Ok(())
    }

    /// Replace `[start, end)` with `text`.
    ///
    /// Only the part that actually differs is reported to the markers, so a
    /// marker over unchanged text keeps its range.
    pub fn replace_string(&mut self, start: usize, end: usize, text: &str) -> Result<()> {
        self.check_range(start, end)?;
        let Some(change) = DocumentChange::minimized(start, &self.text[start..end], text) else {
            return Ok(());
        };
        self.apply(change);
        Ok(())
    }

    /// Move `[src_start, src_end)` so that it starts at `dst` (an offset in
    /// the current text).
    ///
    /// Markers inside the moved segment travel with it; markers outside it
    /// shift to close the gap and make room. A move never invalidates a
    /// marker.
    pub fn move_text(&mut self, src_start: usize, src_end: usize, dst: usize) -> Result<()> {
        self.check_range(src_start, src_end)?;
        self.check_range(dst, dst)?;
        if src_start < dst && dst < src_end {
            return Err(MarkerError::MoveIntoSource {
                src_start,
                src_end,
                dst,
            });
        }
        if src_start == src_end || dst == src_start || dst == src_end {
            return Ok(());
        }

        let segment = self.text[src_start..src_end].to_string();
        let len = segment.len();
        self.apply(DocumentChange::insert(dst, segment));

        let (start, end) = if dst < src_start {
            (src_start + len, src_end + len)
        } else {
            (src_start, src_end)
        };
        self.markers.retarget(start, end, dst);

        let old_text = self.text[start..end].to_string();
        self.apply(DocumentChange::delete(start, old_text));

        tracing::debug!(src_start, src_end, dst, len, "text moved");
        Ok(())
    }

    fn apply(&mut self, change: DocumentChange) {
        self.text
            .replace_range(change.offset..change.old_end(), &change.new_text);
        tracing::trace!(
            offset = change.offset,
            old_len = change.old_len(),
            new_len = change.new_len(),
            "document changed"
        );
        self.markers.update_on_change(&change, self.text.len());
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        if start > end {
            return Err(MarkerError::InvalidRange { start, end });
        }
        if end > self.text.len() {
            return Err(MarkerError::OutOfBounds {
                start,
                end,
                len: self.text.len(),
            });
        }
        for offset in [start, end] {
            if !self.text.is_char_boundary(offset) {
                return Err(MarkerError::NotCharBoundary(offset));
            }
        }
        Ok(())
    }

    // ===== Line / column =====

    /// Offset of a 0-based `line` / byte `column` pair.
    ///
    /// The column is clamped to the end of the line. Returns `None` when the
    /// line does not exist.
    pub fn line_col_to_offset(&self, line: usize, column: usize) -> Option<usize> {
        let mut line_start = 0;
        for (index, line_text) in self.text.split('\n').enumerate() {
            if index == line {
                let mut offset = line_start + column.min(line_text.len());
                while !self.text.is_char_boundary(offset) {
                    offset -= 1;
                }
                return Some(offset);
            }
            line_start += line_text.len() + 1;
        }
        None
    }

    /// 0-based line and byte column of `offset`
    pub fn offset_to_line_col(&self, offset: usize) -> Option<(usize, usize)> {
        let before = self.text.get(..offset)?;
        let line = before.matches('\n').count();
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        Some((line, offset - line_start))
    }

    /// Clamp `offset` into the text and back onto a character boundary
    pub fn clamp_offset(&self, offset: usize) -> usize {
        let mut offset = offset.min(self.text.len());
        while !self.text.is_char_boundary(offset) {
            offset -= 1;
        }
        offset
    }
}

impl TextBuffer for Document {
    fn len(&self) -> usize {
        self.text.len()
    }

    fn text_in(&self, range: TextRange) -> Option<&str> {
        self.text.get(range.start..range.end)
    }

    fn line_count(&self) -> usize {
        self.text.matches('\n').count() + 1
    }
}

impl From<&str> for Document {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}
