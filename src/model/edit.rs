/// A single change to the text of a document
///
/// `[offset, offset + old_text.len())` was replaced with `new_text`.
/// `initial_offset` / `initial_old_len` describe the replacement as the
/// caller requested it, before the common prefix and suffix of old and new
/// text were stripped. Marker translation uses them to tell a genuine
/// insertion at a marker boundary from the tail of a larger replacement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentChange {
    pub offset: usize,
    pub old_text: String,
    pub new_text: String,
    pub initial_offset: usize,
    pub initial_old_len: usize,
}

impl DocumentChange {
    pub fn new(offset: usize, old_text: impl Into<String>, new_text: impl Into<String>) -> Self {
        let old_text = old_text.into();
        let initial_old_len = old_text.len();
        Self {
            offset,
            old_text,
            new_text: new_text.into(),
            initial_offset: offset,
            initial_old_len,
        }
    }

    /// Create an insertion of `text` at `offset`
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(offset, String::new(), text)
    }

    /// Create a deletion of `old_text`, which started at `offset`
    pub fn delete(offset: usize, old_text: impl Into<String>) -> Self {
        Self::new(offset, old_text, String::new())
    }

    /// Build the change for replacing `old_text` at `offset` with `new_text`,
    /// with the common prefix and suffix removed.
    ///
    /// Returns `None` when both texts are identical.
    pub fn minimized(offset: usize, old_text: &str, new_text: &str) -> Option<Self> {
        if old_text == new_text {
            return None;
        }

        let prefix: usize = old_text
            .chars()
            .zip(new_text.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.len_utf8())
            .sum();
        let old_rest = &old_text[prefix..];
        let new_rest = &new_text[prefix..];

        let suffix: usize = old_rest
            .chars()
            .rev()
            .zip(new_rest.chars().rev())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.len_utf8())
            .sum();

        Some(Self {
            offset: offset + prefix,
            old_text: old_rest[..old_rest.len() - suffix].to_string(),
            new_text: new_rest[..new_rest.len() - suffix].to_string(),
            initial_offset: offset,
            initial_old_len: old_text.len(),
        })
    }

    pub fn old_len(&self) -> usize {
        self.old_text.len()
    }

    pub fn new_len(&self) -> usize {
        self.new_text.len()
    }

    /// End of the replaced area in pre-change coordinates
    pub fn old_end(&self) -> usize {
        self.offset + self.old_len()
    }

    /// How much every offset after the change moves
    pub fn length_delta(&self) -> i64 {
        self.new_len() as i64 - self.old_len() as i64
    }

    /// Whether `minimized` moved the start of this change
    pub fn is_minimized(&self) -> bool {
        self.initial_offset != self.offset || self.initial_old_len != self.old_len()
    }
}
