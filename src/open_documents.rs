//! Tracks which documents are currently open, in the order they were opened.
//!
//! The supervisor replays this set's contents as `textDocument/didOpen`
//! notifications against a freshly spawned server after a crash, so
//! insertion order must be preserved — hence `IndexSet` rather than a plain
//! `HashSet`.

use indexmap::IndexSet;
use lsp_types::Uri;

/// The set of documents the client currently considers open.
///
/// Double-opening an already-open URI, or closing one that isn't open, is a
/// caller bug: both are asserted against rather than silently tolerated.
#[derive(Debug, Default)]
pub struct OpenDocumentSet {
    uris: IndexSet<Uri>,
}

impl OpenDocumentSet {
    pub fn new() -> Self {
        Self {
            uris: IndexSet::new(),
        }
    }

    /// Record `uri` as open.
    pub fn open(&mut self, uri: Uri) {
        let inserted = self.uris.insert(uri.clone());
        debug_assert!(inserted, "didOpen for an already-open document: {uri:?}");
    }

    /// Record `uri` as closed.
    pub fn close(&mut self, uri: &Uri) {
        let removed = self.uris.shift_remove(uri);
        debug_assert!(removed, "didClose for a document that was not open: {uri:?}");
    }

    /// Iterate the open URIs in the order they were opened.
    pub fn iter(&self) -> impl Iterator<Item = &Uri> {
        self.uris.iter()
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn uri(s: &str) -> Uri {
        Uri::from_str(s).unwrap()
    }

    #[test]
    fn preserves_insertion_order() {
        let mut set = OpenDocumentSet::new();
        set.open(uri("file:///a.rs"));
        set.open(uri("file:///b.rs"));
        set.open(uri("file:///c.rs"));
        set.close(&uri("file:///b.rs"));
        set.open(uri("file:///d.rs"));

        let order: Vec<String> = set.iter().map(|u| u.as_str().to_string()).collect();
        assert_eq!(order, vec!["file:///a.rs", "file:///c.rs", "file:///d.rs"]);
    }

    #[test]
    #[should_panic(expected = "already-open")]
    fn double_open_asserts() {
        let mut set = OpenDocumentSet::new();
        set.open(uri("file:///a.rs"));
        set.open(uri("file:///a.rs"));
    }

    #[test]
    #[should_panic(expected = "was not open")]
    fn close_of_absent_asserts() {
        let mut set = OpenDocumentSet::new();
        set.close(&uri("file:///a.rs"));
    }
}
