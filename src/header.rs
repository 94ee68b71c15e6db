//! Ordered key/value header list.
//!
//! Keys are not unique. Lookups scan in insertion order and return the
//! first match, so adding a key a second time never shadows the first one.
//! The connect path uses this as the list of HTTP request headers handed to
//! the [`Dialer`](crate::transport::Dialer).

/// Ordered association list of string pairs.
///
/// Stored flat as alternating key and value slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<String>,
}

impl Header {
    /// Create an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair. Existing entries with the same key are left alone.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(key.into());
        self.entries.push(value.into());
    }

    /// Value of the first entry whose key equals `key` (case-sensitive).
    pub fn contains(&self, key: &str) -> Option<&str> {
        self.index(key).map(|i| self.entries[i + 1].as_str())
    }

    /// Like [`contains`](Self::contains) but returns `""` on a miss.
    pub fn get(&self, key: &str) -> &str {
        self.contains(key).unwrap_or_default()
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.entries.len() / 2
    }

    /// Whether no pair has been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .chunks_exact(2)
            .map(|pair| (pair[0].as_str(), pair[1].as_str()))
    }

    fn index(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .step_by(2)
            .position(|k| k == key)
            .map(|pair| pair * 2)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Header {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = Self::new();
        for (key, value) in iter {
            header.add(key, value);
        }
        header
    }
}
