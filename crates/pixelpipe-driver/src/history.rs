//! The edit history source: an ordered, externally-owned log of
//! per-operator parameter snapshots. The driver only ever reads it.

use pixelpipe_operator::ParamsBlob;

/// One snapshot of an operator's state at a point in the edit history.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    /// Canonical name of the operator this item targets.
    pub operator_name: String,
    /// Parameters at this point in history.
    pub params: ParamsBlob,
    /// Blend parameters at this point in history.
    pub blend_params: ParamsBlob,
    /// Whether the operator is enabled at this point in history.
    pub enabled: bool,
}

impl HistoryItem {
    /// Convenience constructor for tests and callers that don't need blend
    /// parameters.
    #[must_use]
    pub fn new(operator_name: impl Into<String>, params: ParamsBlob, enabled: bool) -> Self {
        Self {
            operator_name: operator_name.into(),
            params,
            blend_params: ParamsBlob::empty(),
            enabled,
        }
    }
}

/// An ordered sequence of history items with a cursor identifying the
/// current replay depth (`0..=items.len()`). The pipeline driver never
/// mutates this; only the GUI/edit-history owner does.
#[derive(Debug, Clone, Default)]
pub struct History {
    items: Vec<HistoryItem>,
    cursor: usize,
}

impl History {
    /// Creates a history with every item replayed (cursor at the end).
    #[must_use]
    pub fn new(items: Vec<HistoryItem>) -> Self {
        let cursor = items.len();
        Self { items, cursor }
    }

    /// Items up to (not including) the current cursor, the ones actually
    /// "live" for this replay depth.
    #[must_use]
    pub fn live_items(&self) -> &[HistoryItem] {
        &self.items[..self.cursor]
    }

    /// All items, regardless of cursor (used by `change`'s "top changed"
    /// detection, which needs to see the full tail).
    #[must_use]
    pub fn all_items(&self) -> &[HistoryItem] {
        &self.items
    }

    /// The current replay depth.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the cursor, e.g. after an undo/redo in the GUI.
    pub fn set_cursor(&mut self, cursor: usize) {
        assert!(cursor <= self.items.len(), "cursor out of range");
        self.cursor = cursor;
    }

    /// Appends a new item at the current cursor, truncating any redo tail,
    /// and advances the cursor over it.
    pub fn push(&mut self, item: HistoryItem) {
        self.items.truncate(self.cursor);
        self.items.push(item);
        self.cursor = self.items.len();
    }
}
