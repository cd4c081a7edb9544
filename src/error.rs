use crate::model::marker::MarkerId;

/// Errors raised when a marker or an edit is built from bad coordinates.
///
/// Edits that merely make an existing marker meaningless never produce an
/// error; the marker is invalidated instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerError {
    /// `start > end`
    InvalidRange { start: usize, end: usize },
    /// The range does not fit into a buffer of `len` bytes
    OutOfBounds {
        start: usize,
        end: usize,
        len: usize,
    },
    /// The offset splits a multi-byte character
    NotCharBoundary(usize),
    /// `move_text` destination lies strictly inside the moved segment
    MoveIntoSource {
        src_start: usize,
        src_end: usize,
        dst: usize,
    },
    UnknownMarker(MarkerId),
}

impl std::fmt::Display for MarkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerError::InvalidRange { start, end } => {
                write!(f, "Invalid range: start {start} is greater than end {end}")
            }
            MarkerError::OutOfBounds { start, end, len } => {
                write!(f, "Range {start}..{end} is out of bounds for length {len}")
            }
            MarkerError::NotCharBoundary(offset) => {
                write!(f, "Offset {offset} is not on a character boundary")
            }
            MarkerError::MoveIntoSource {
                src_start,
                src_end,
                dst,
            } => write!(
                f,
                "Cannot move {src_start}..{src_end} to {dst}: destination is inside the source"
            ),
            MarkerError::UnknownMarker(id) => write!(f, "Unknown marker {id:?}"),
        }
    }
}

impl std::error::Error for MarkerError {}

pub type Result<T> = std::result::Result<T, MarkerError>;
