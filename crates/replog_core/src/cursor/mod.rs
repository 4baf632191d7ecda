//! Cursors over logs and over merged streams of logs.
//!
//! A cursor starts *before* its first element: [`DbCursor::record`] returns
//! `None` until [`DbCursor::next`] has returned `true`. Once `next` returns
//! `false` the cursor is exhausted for now, but a cursor on a live log keeps
//! returning new records as they get appended.

mod composite;
mod domain;
mod multi_domain;

pub use composite::CompositeCursor;
pub(crate) use domain::ReplicaAdditions;
pub use domain::{DomainCursor, ReplicaCursorSource};
pub use multi_domain::{DomainCursorSource, MultiDomainCursor};

use crate::error::ChangelogResult;

/// A forward-only cursor.
pub trait DbCursor: Send {
    /// Type of the elements returned.
    type Item;

    /// Returns the current element, `None` before the first call to
    /// [`Self::next`] or once exhausted.
    fn record(&self) -> Option<&Self::Item>;

    /// Moves to the next element, returning `false` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails or the cursor was
    /// aborted.
    fn next(&mut self) -> ChangelogResult<bool>;
}

impl<C: DbCursor + ?Sized> DbCursor for Box<C> {
    type Item = C::Item;

    fn record(&self) -> Option<&Self::Item> {
        (**self).record()
    }

    fn next(&mut self) -> ChangelogResult<bool> {
        (**self).next()
    }
}

/// A cursor that can be moved to a key.
pub trait RepositionableCursor: DbCursor {
    /// Type of the keys.
    type Key;

    /// Positions the cursor on `key`, or on the first record if `key` is
    /// `None`. Returns `false` if no record matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn position_to(
        &mut self,
        key: Option<&Self::Key>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<bool>;
}

/// How a key is matched when positioning a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyMatchingStrategy {
    /// Only a record with this exact key matches.
    #[default]
    EqualToKey,
    /// The greatest record with a key lower than or equal to the key.
    LessThanOrEqualToKey,
    /// The smallest record with a key greater than or equal to the key.
    GreaterThanOrEqualToKey,
}

/// Where a cursor ends up relative to the matched record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PositionStrategy {
    /// The first call to `next` returns the matched record.
    #[default]
    OnMatchingKey,
    /// The first call to `next` returns the record following the match.
    AfterMatchingKey,
}

/// Key matching and position strategies used to open a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CursorOptions {
    /// How the start key is matched.
    pub matching: KeyMatchingStrategy,
    /// Where the cursor is left relative to the match.
    pub position: PositionStrategy,
}

impl CursorOptions {
    /// Creates cursor options.
    #[must_use]
    pub const fn new(matching: KeyMatchingStrategy, position: PositionStrategy) -> Self {
        Self { matching, position }
    }

    /// Options returning the records strictly after a key, or the first
    /// record above it when the key is gone.
    #[must_use]
    pub const fn after() -> Self {
        Self::new(
            KeyMatchingStrategy::GreaterThanOrEqualToKey,
            PositionStrategy::AfterMatchingKey,
        )
    }
}
