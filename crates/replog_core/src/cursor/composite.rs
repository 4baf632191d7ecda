//! Merging several ordered cursors into one.

use super::DbCursor;
use crate::error::ChangelogResult;
use crate::record::Keyed;
use std::collections::{BTreeMap, BTreeSet};

type KeyOf<C> = <<C as DbCursor>::Item as Keyed>::Key;

/// Merges cursors, each ordered by the key of its items, into one stream
/// ordered by that key.
///
/// Each cursor is identified by an `Id`, which also breaks ties between
/// items with equal keys. A cursor that has no more items is set aside and
/// tried again on every call to [`DbCursor::next`], so items appended to
/// its source later are still merged in. Cursors added or removed take
/// effect on the next call to `next`.
pub struct CompositeCursor<Id, C>
where
    C: DbCursor,
    C::Item: Keyed,
{
    cursors: BTreeMap<Id, C>,
    ready: BTreeSet<(KeyOf<C>, Id)>,
    exhausted: BTreeSet<Id>,
    pending: Vec<(Id, C)>,
    to_remove: Vec<Id>,
    // the head of `ready` was handed out and must be advanced first
    delivered: bool,
}

impl<Id, C> CompositeCursor<Id, C>
where
    Id: Ord + Clone,
    C: DbCursor,
    C::Item: Keyed,
{
    /// Creates a cursor merging nothing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursors: BTreeMap::new(),
            ready: BTreeSet::new(),
            exhausted: BTreeSet::new(),
            pending: Vec::new(),
            to_remove: Vec::new(),
            delivered: false,
        }
    }

    /// Adds a cursor positioned before its first item. A cursor already
    /// merged under the same id is replaced.
    pub fn add_cursor(&mut self, id: Id, cursor: C) {
        self.pending.push((id, cursor));
    }

    /// Removes the cursor merged under `id`.
    pub fn remove_cursor(&mut self, id: Id) {
        self.to_remove.push(id);
    }

    /// Returns the ids of the cursors merged, pending additions excluded.
    pub fn ids(&self) -> impl Iterator<Item = &Id> {
        self.cursors.keys()
    }

    /// Returns the id of the cursor holding the current item.
    pub fn current_id(&self) -> Option<&Id> {
        self.ready.first().map(|(_, id)| id)
    }

    /// Advances `id` and files it under ready or exhausted.
    fn advance(&mut self, id: Id) -> ChangelogResult<()> {
        let Some(cursor) = self.cursors.get_mut(&id) else {
            return Ok(());
        };
        let advanced = cursor.next();
        match (advanced, cursor.record()) {
            (Ok(true), Some(item)) => {
                self.ready.insert((item.ordering_key().clone(), id));
                Ok(())
            }
            (Ok(_), _) => {
                self.exhausted.insert(id);
                Ok(())
            }
            (Err(e), _) => {
                self.exhausted.insert(id);
                Err(e)
            }
        }
    }

    fn unlink(&mut self, id: &Id) -> Option<C> {
        self.ready.retain(|(_, ready)| ready != id);
        self.exhausted.remove(id);
        self.cursors.remove(id)
    }

    /// Applies removals, retries exhausted cursors and merges pending ones.
    ///
    /// Every cursor is tried even if one fails; a failed cursor is left
    /// exhausted so the next call tries it again. Returns the first error.
    fn apply_changes(&mut self) -> ChangelogResult<()> {
        for id in std::mem::take(&mut self.to_remove) {
            self.unlink(&id);
        }

        let mut first_error = None;
        let exhausted: Vec<Id> = std::mem::take(&mut self.exhausted).into_iter().collect();
        for id in exhausted {
            if let Err(e) = self.advance(id) {
                first_error.get_or_insert(e);
            }
        }

        for (id, cursor) in std::mem::take(&mut self.pending) {
            self.unlink(&id);
            self.cursors.insert(id.clone(), cursor);
            if let Err(e) = self.advance(id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<Id, C> Default for CompositeCursor<Id, C>
where
    Id: Ord + Clone,
    C: DbCursor,
    C::Item: Keyed,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Id, C> DbCursor for CompositeCursor<Id, C>
where
    Id: Ord + Clone + Send,
    C: DbCursor,
    C::Item: Keyed,
    KeyOf<C>: Send,
{
    type Item = C::Item;

    fn record(&self) -> Option<&C::Item> {
        let (_, id) = self.ready.first()?;
        self.cursors.get(id)?.record()
    }

    fn next(&mut self) -> ChangelogResult<bool> {
        let mut result = Ok(());
        if std::mem::take(&mut self.delivered) {
            if let Some((_, id)) = self.ready.pop_first() {
                result = self.advance(id);
            }
        }
        let applied = self.apply_changes();
        result.and(applied)?;
        self.delivered = !self.ready.is_empty();
        Ok(self.delivered)
    }
}

impl<Id, C> std::fmt::Debug for CompositeCursor<Id, C>
where
    Id: std::fmt::Debug,
    C: DbCursor,
    C::Item: Keyed,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeCursor")
            .field("cursors", &self.cursors.keys().collect::<Vec<_>>())
            .field("exhausted", &self.exhausted)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChangelogError;
    use crate::record::Record;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// A cursor over a shared queue that can be refilled after exhaustion.
    struct QueueCursor {
        queue: Arc<Mutex<VecDeque<u64>>>,
        current: Option<Record<u64, ()>>,
        failures: usize,
    }

    impl QueueCursor {
        fn new(keys: impl IntoIterator<Item = u64>) -> (Self, Arc<Mutex<VecDeque<u64>>>) {
            let queue = Arc::new(Mutex::new(keys.into_iter().collect()));
            let cursor = Self {
                queue: Arc::clone(&queue),
                current: None,
                failures: 0,
            };
            (cursor, queue)
        }
    }

    impl DbCursor for QueueCursor {
        type Item = Record<u64, ()>;

        fn record(&self) -> Option<&Record<u64, ()>> {
            self.current.as_ref()
        }

        fn next(&mut self) -> ChangelogResult<bool> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(ChangelogError::invalid_operation("broken cursor"));
            }
            self.current = self.queue.lock().pop_front().map(|k| Record::new(k, ()));
            Ok(self.current.is_some())
        }
    }

    fn drain<Id: Ord + Clone + Send>(cursor: &mut CompositeCursor<Id, QueueCursor>) -> Vec<u64> {
        let mut keys = Vec::new();
        while cursor.next().unwrap() {
            keys.push(*cursor.record().unwrap().key());
        }
        keys
    }

    #[test]
    fn merges_in_key_order() {
        let mut cursor = CompositeCursor::new();
        cursor.add_cursor(1, QueueCursor::new([1, 3, 5]).0);
        cursor.add_cursor(2, QueueCursor::new([2, 4, 6]).0);
        assert!(cursor.record().is_none());
        assert_eq!(drain(&mut cursor), vec![1, 2, 3, 4, 5, 6]);
        assert!(cursor.record().is_none());
    }

    #[test]
    fn record_can_be_peeked_repeatedly() {
        let mut cursor = CompositeCursor::new();
        cursor.add_cursor(1, QueueCursor::new([7]).0);
        assert!(cursor.next().unwrap());
        assert_eq!(*cursor.record().unwrap().key(), 7);
        assert_eq!(*cursor.record().unwrap().key(), 7);
        assert_eq!(cursor.current_id(), Some(&1));
    }

    #[test]
    fn equal_keys_ordered_by_id() {
        let mut cursor = CompositeCursor::new();
        cursor.add_cursor("b", QueueCursor::new([1, 2]).0);
        cursor.add_cursor("a", QueueCursor::new([1, 3]).0);
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push((*cursor.record().unwrap().key(), *cursor.current_id().unwrap()));
        }
        assert_eq!(seen, vec![(1, "a"), (1, "b"), (2, "b"), (3, "a")]);
    }

    #[test]
    fn exhausted_cursor_is_recycled() {
        let mut cursor = CompositeCursor::new();
        let (source, queue) = QueueCursor::new([1]);
        cursor.add_cursor(1, source);
        assert_eq!(drain(&mut cursor), vec![1]);

        queue.lock().extend([2, 3]);
        assert_eq!(drain(&mut cursor), vec![2, 3]);
    }

    #[test]
    fn cursor_added_later_is_merged_on_next() {
        let mut cursor = CompositeCursor::new();
        cursor.add_cursor(1, QueueCursor::new([1, 5]).0);
        assert!(cursor.next().unwrap());
        assert_eq!(*cursor.record().unwrap().key(), 1);

        cursor.add_cursor(2, QueueCursor::new([3]).0);
        assert_eq!(*cursor.record().unwrap().key(), 1);
        assert_eq!(drain(&mut cursor), vec![3, 5]);
        assert_eq!(cursor.ids().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn removed_cursor_stops_contributing() {
        let mut cursor = CompositeCursor::new();
        cursor.add_cursor(1, QueueCursor::new([1, 3, 5]).0);
        cursor.add_cursor(2, QueueCursor::new([2, 4, 6]).0);
        assert!(cursor.next().unwrap());
        cursor.remove_cursor(2);
        assert_eq!(drain(&mut cursor), vec![3, 5]);
        assert_eq!(cursor.ids().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn failing_cursor_reports_error() {
        let mut cursor = CompositeCursor::new();
        let (mut broken, _) = QueueCursor::new([1]);
        broken.failures = usize::MAX;
        cursor.add_cursor(1, broken);
        assert!(cursor.next().is_err());
    }

    #[test]
    fn failing_cursor_does_not_drop_the_others() {
        let mut cursor = CompositeCursor::new();
        let (mut flaky, _) = QueueCursor::new([10]);
        flaky.failures = 1;
        cursor.add_cursor(1, flaky);
        cursor.add_cursor(2, QueueCursor::new([1, 2, 3]).0);

        assert!(cursor.next().is_err());
        assert_eq!(drain(&mut cursor), vec![1, 2, 3, 10]);
        assert_eq!(cursor.ids().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn error_while_advancing_keeps_current_item_pending() {
        let mut cursor = CompositeCursor::new();
        let (source, queue) = QueueCursor::new([1]);
        cursor.add_cursor(1, source);
        cursor.add_cursor(2, QueueCursor::new([2, 3]).0);
        assert!(cursor.next().unwrap());
        assert_eq!(*cursor.record().unwrap().key(), 1);

        cursor.cursors.get_mut(&2).unwrap().failures = 1;
        queue.lock().push_back(4);
        assert!(cursor.next().unwrap());
        assert_eq!(*cursor.record().unwrap().key(), 2);
        assert!(cursor.next().is_err());
        assert_eq!(drain(&mut cursor), vec![3, 4]);
    }

    proptest! {
        #[test]
        fn prop_merge_is_sorted(sources in proptest::collection::vec(
            proptest::collection::btree_set(0u64..1000, 0..20), 1..6)
        ) {
            let mut cursor = CompositeCursor::new();
            let mut expected = Vec::new();
            for (id, keys) in sources.iter().enumerate() {
                expected.extend(keys.iter().copied());
                cursor.add_cursor(id, QueueCursor::new(keys.iter().copied()).0);
            }
            expected.sort_unstable();
            prop_assert_eq!(drain(&mut cursor), expected);
        }
    }
}
