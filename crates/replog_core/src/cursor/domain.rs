//! Cursor over all the replicas of one domain.

use super::{CompositeCursor, CursorOptions, DbCursor};
use crate::csn::{Csn, ServerState};
use crate::error::ChangelogResult;
use crate::replica::{ReplicaCursor, UpdateMsg};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Opens cursors on the replica DBs of a domain.
pub trait ReplicaCursorSource: Send + Sync {
    /// Returns a cursor on the messages of `server_id` in `base_dn`,
    /// positioned on `start` with `options`, or before the oldest message if
    /// `start` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the replica is unknown or its log cannot be read.
    fn replica_cursor(
        &self,
        base_dn: &str,
        server_id: u16,
        start: Option<&Csn>,
        options: CursorOptions,
    ) -> ChangelogResult<ReplicaCursor>;
}

/// Replicas waiting to be merged by a domain cursor, with their start CSN.
pub(crate) type ReplicaAdditions = Mutex<BTreeMap<u16, Option<Csn>>>;

/// Merges the messages of every replica of one domain in CSN order.
///
/// Replicas can be added at any time, from any thread holding the cursor
/// or through the changelog DB when a new replica appears; they are merged
/// from the next call to [`DbCursor::next`].
pub struct DomainCursor {
    base_dn: String,
    source: Arc<dyn ReplicaCursorSource>,
    options: CursorOptions,
    additions: Arc<ReplicaAdditions>,
    inner: CompositeCursor<u16, ReplicaCursor>,
}

impl DomainCursor {
    /// Creates a cursor on `base_dn` merging no replica yet.
    ///
    /// `options` positions the cursors of replicas added with a start CSN.
    pub fn new(base_dn: &str, source: Arc<dyn ReplicaCursorSource>, options: CursorOptions) -> Self {
        Self {
            base_dn: base_dn.to_string(),
            source,
            options,
            additions: Arc::new(Mutex::new(BTreeMap::new())),
            inner: CompositeCursor::new(),
        }
    }

    /// Creates a cursor merging `server_ids`, each starting at its CSN in
    /// `start_state`, or at its oldest message.
    pub fn with_replicas(
        base_dn: &str,
        source: Arc<dyn ReplicaCursorSource>,
        options: CursorOptions,
        server_ids: impl IntoIterator<Item = u16>,
        start_state: &ServerState,
    ) -> Self {
        let cursor = Self::new(base_dn, source, options);
        for server_id in server_ids {
            cursor.add_replica_db(server_id, start_state.csn(server_id).copied());
        }
        cursor
    }

    /// Returns the base DN of the domain.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Merges the messages of `server_id`, from `start` or from its oldest
    /// message. Takes effect on the next call to `next`.
    pub fn add_replica_db(&self, server_id: u16, start: Option<Csn>) {
        self.additions.lock().entry(server_id).or_insert(start);
    }

    /// Stops merging the messages of `server_id`.
    pub fn remove_replica_db(&mut self, server_id: u16) {
        self.additions.lock().remove(&server_id);
        self.inner.remove_cursor(server_id);
    }

    /// Returns a handle through which replicas can be added while the cursor
    /// is in use elsewhere.
    pub(crate) fn additions(&self) -> Weak<ReplicaAdditions> {
        Arc::downgrade(&self.additions)
    }

    /// Returns the id of the replica that produced the current message.
    pub fn current_server_id(&self) -> Option<u16> {
        self.inner.current_id().copied()
    }

    /// Opens a cursor for every pending replica. Replicas whose cursor
    /// cannot be opened stay pending and are retried on the next call.
    fn incorporate_additions(&mut self) -> ChangelogResult<()> {
        let added = std::mem::take(&mut *self.additions.lock());
        let mut first_error = None;
        for (server_id, start) in added {
            let options = if start.is_some() {
                self.options
            } else {
                CursorOptions::default()
            };
            match self
                .source
                .replica_cursor(&self.base_dn, server_id, start.as_ref(), options)
            {
                Ok(cursor) => self.inner.add_cursor(server_id, cursor),
                Err(e) => {
                    tracing::warn!(
                        base_dn = %self.base_dn,
                        server_id,
                        error = %e,
                        "cannot open replica cursor"
                    );
                    self.additions.lock().entry(server_id).or_insert(start);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl DbCursor for DomainCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.inner.record()
    }

    fn next(&mut self) -> ChangelogResult<bool> {
        self.incorporate_additions()?;
        self.inner.next()
    }
}

impl std::fmt::Debug for DomainCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainCursor")
            .field("base_dn", &self.base_dn)
            .field("options", &self.options)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
