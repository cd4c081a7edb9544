/// Marker primitives: ids, ranges, boundary affinity and tastes
///
/// A range marker tracks a half-open span `[start, end)` of a text buffer
/// and keeps tracking it while the text around it is edited. This module
/// holds the plain value types and the translation rule that maps a
/// marker's range through a single `DocumentChange`. The tree that stores
/// markers and applies the rule to all of them lives in `marker_tree`.
use crate::error::{MarkerError, Result};
use crate::model::edit::DocumentChange;

/// Unique identifier for a marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerId(pub u64);

/// Half-open span of byte offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Zero-length range at `offset`
    pub const fn point(offset: usize) -> Self {
        Self {
            start: offset,
            end: offset,
        }
    }

    /// Build a range, rejecting `start > end`
    pub fn checked(start: usize, end: usize) -> Result<Self> {
        if start > end {
            return Err(MarkerError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Closed-interval intersection test: ranges that only touch intersect.
    pub fn intersects(&self, start: usize, end: usize) -> bool {
        self.start.max(start) <= self.end.min(end)
    }

    pub fn contains_offset(&self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    pub fn contains_range(&self, other: TextRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn shifted(&self, delta: i64) -> Self {
        Self {
            start: (self.start as i64 + delta) as usize,
            end: (self.end as i64 + delta) as usize,
        }
    }
}

impl From<std::ops::Range<usize>> for TextRange {
    fn from(range: std::ops::Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// How a marker's boundaries react to text inserted exactly at them
///
/// - `greedy_to_left`: an insertion at `start` becomes part of the marker
/// - `greedy_to_right`: an insertion at `end` becomes part of the marker
/// - `sticking_to_right`: a zero-length marker moves after text inserted at
///   its offset instead of staying before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Affinity {
    pub greedy_to_left: bool,
    pub greedy_to_right: bool,
    pub sticking_to_right: bool,
}

impl Affinity {
    pub const fn greedy(greedy_to_left: bool, greedy_to_right: bool) -> Self {
        Self {
            greedy_to_left,
            greedy_to_right,
            sticking_to_right: false,
        }
    }
}

/// Maximum number of distinct tastes
pub const MAX_TASTES: u8 = 32;

/// A small tag used to filter overlap iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Taste(u8);

impl Taste {
    /// Returns `None` for tags outside `0..MAX_TASTES`
    pub const fn new(tag: u8) -> Option<Self> {
        if tag < MAX_TASTES {
            Some(Self(tag))
        } else {
            None
        }
    }

    pub const fn tag(self) -> u8 {
        self.0
    }

    pub const fn bit(self) -> u32 {
        1 << self.0
    }
}

/// Set of tastes carried by one marker, stored as a bit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TasteSet(u32);

impl TasteSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, taste: Taste) -> bool {
        self.0 & taste.bit() != 0
    }

    pub const fn with(self, taste: Taste) -> Self {
        Self(self.0 | taste.bit())
    }

    pub fn insert(&mut self, taste: Taste) {
        self.0 |= taste.bit();
    }

    pub fn remove(&mut self, taste: Taste) {
        self.0 &= !taste.bit();
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Taste> for TasteSet {
    fn from_iter<I: IntoIterator<Item = Taste>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// Everything besides the range that a marker is created with
///
/// Affinity and layer are part of a node's identity in the tree: two markers
/// share a node only when their ranges, affinities and layers are equal.
/// Value and tastes are per marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkerOptions {
    pub affinity: Affinity,
    pub layer: i32,
    /// Contribution to `sum_of_values_up_to`
    pub value: u64,
    pub tastes: TasteSet,
}

impl MarkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn greedy(mut self, greedy_to_left: bool, greedy_to_right: bool) -> Self {
        self.affinity.greedy_to_left = greedy_to_left;
        self.affinity.greedy_to_right = greedy_to_right;
        self
    }

    pub fn greedy_to_left(mut self, greedy: bool) -> Self {
        self.affinity.greedy_to_left = greedy;
        self
    }

    pub fn greedy_to_right(mut self, greedy: bool) -> Self {
        self.affinity.greedy_to_right = greedy;
        self
    }

    pub fn sticking_to_right(mut self, sticking: bool) -> Self {
        self.affinity.sticking_to_right = sticking;
        self
    }

    pub fn layer(mut self, layer: i32) -> Self {
        self.layer = layer;
        self
    }

    pub fn value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    pub fn taste(mut self, taste: Taste) -> Self {
        self.tastes.insert(taste);
        self
    }

    pub fn tastes(mut self, tastes: TasteSet) -> Self {
        self.tastes = tastes;
        self
    }
}

/// Translate a marker's range through one change.
///
/// Returns `None` when the change destroys the marker, i.e. it deleted the
/// marked text without covering it exactly. The caller still has to check
/// the result against the new document length.
pub fn apply_change(
    range: TextRange,
    affinity: Affinity,
    change: &DocumentChange,
) -> Option<TextRange> {
    let start = range.start as i64;
    let end = range.end as i64;
    if start == end {
        return apply_change_to_point(start, affinity, change);
    }

    let offset = change.offset as i64;
    let old_len = change.old_len() as i64;
    let new_len = change.new_len() as i64;
    let old_end = offset + old_len;
    let delta = new_len - old_len;

    // entirely before the change
    if end < offset {
        return Some(range);
    }
    if !affinity.greedy_to_right && end == offset {
        // a replacement that started inside the marker and was minimised
        // down to an append at its end
        if old_len == 0 && (change.initial_offset as i64) < offset {
            return collapse(start, end + new_len);
        }
        return Some(range);
    }

    // entirely after the change
    if start > old_end {
        return collapse(start + delta, end + delta);
    }
    if !affinity.greedy_to_left && start == old_end {
        if old_len == 0 && (change.initial_offset + change.initial_old_len) as i64 > offset {
            return collapse(start, end + new_len);
        }
        return collapse(start + delta, end + delta);
    }

    // the change happened inside the marker
    if start <= offset && end >= old_end {
        return collapse(start, end + delta);
    }

    // prefix of the marker replaced
    if start >= offset && start <= old_end && end > old_end {
        return collapse(offset + new_len, end + delta);
    }

    // suffix of the marker replaced
    if end >= offset && end <= old_end && start < offset {
        return collapse(start, offset);
    }

    None
}

fn apply_change_to_point(
    point: i64,
    affinity: Affinity,
    change: &DocumentChange,
) -> Option<TextRange> {
    let offset = change.offset as i64;
    let old_len = change.old_len() as i64;
    let new_len = change.new_len() as i64;
    let old_end = offset + old_len;

    if offset < point && point < old_end {
        return None;
    }

    if offset == point && old_len == 0 {
        return if affinity.sticking_to_right {
            collapse(point + new_len, point + new_len)
        } else if affinity.greedy_to_right {
            collapse(point, point + new_len)
        } else {
            collapse(point, point)
        };
    }

    if point > old_end || (point == old_end && old_len > 0) {
        let shifted = point + new_len - old_len;
        return collapse(shifted, shifted);
    }

    collapse(point, point)
}

/// Negative offsets mean the marker fell off the front of the buffer; an
/// inverted range collapses onto its start.
fn collapse(start: i64, end: i64) -> Option<TextRange> {
    if start < 0 {
        return None;
    }
    let end = end.max(start);
    Some(TextRange::new(start as usize, end as usize))
}
