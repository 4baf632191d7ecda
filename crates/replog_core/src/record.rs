//! Key/value records stored in a log.

use std::fmt;

/// An immutable (key, value) pair stored in a log.
///
/// Records of one log are appended in strictly increasing key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record<K, V> {
    key: K,
    value: V,
}

impl<K, V> Record<K, V> {
    /// Creates a record.
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    /// Returns the key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Splits the record into its key and value.
    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

impl<K: fmt::Display, V: fmt::Display> fmt::Display for Record<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record [{}:{}]", self.key, self.value)
    }
}

/// An item exposing the key used to order it among items of other sources.
///
/// Composite cursors use it to merge several ordered streams.
pub trait Keyed {
    /// Type of the ordering key.
    type Key: Ord + Clone;

    /// Returns the key this item is ordered by.
    fn ordering_key(&self) -> &Self::Key;
}

impl<K: Ord + Clone, V> Keyed for Record<K, V> {
    type Key = K;

    fn ordering_key(&self) -> &K {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_and_parts() {
        let record = Record::new(3u64, "three".to_string());
        assert_eq!(*record.key(), 3);
        assert_eq!(record.value(), "three");
        assert_eq!(*record.ordering_key(), 3);
        assert_eq!(record.into_parts(), (3, "three".to_string()));
    }

    #[test]
    fn display() {
        assert_eq!(Record::new(1, "a").to_string(), "Record [1:a]");
    }
}
