//! Cursor over several domains.

use super::{CompositeCursor, CursorOptions, DbCursor, DomainCursor};
use crate::csn::ServerState;
use crate::error::ChangelogResult;
use crate::replica::UpdateMsg;
use std::sync::Arc;

/// Opens domain cursors.
pub trait DomainCursorSource: Send + Sync {
    /// Returns a cursor merging every replica of `base_dn`, each starting
    /// at its CSN in `start_state` positioned with `options`, or at its
    /// oldest message.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is unknown.
    fn domain_cursor(
        &self,
        base_dn: &str,
        start_state: &ServerState,
        options: CursorOptions,
    ) -> ChangelogResult<DomainCursor>;
}

/// Merges the messages of several domains in CSN order. Messages with the
/// same CSN in two domains are ordered by base DN.
pub struct MultiDomainCursor {
    source: Arc<dyn DomainCursorSource>,
    options: CursorOptions,
    inner: CompositeCursor<String, DomainCursor>,
}

impl MultiDomainCursor {
    /// Creates a cursor merging no domain yet.
    pub fn new(source: Arc<dyn DomainCursorSource>, options: CursorOptions) -> Self {
        Self {
            source,
            options,
            inner: CompositeCursor::new(),
        }
    }

    /// Merges the messages of `base_dn` from `start_state`. Takes effect on
    /// the next call to `next`.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cursor cannot be created.
    pub fn add_domain(&mut self, base_dn: &str, start_state: &ServerState) -> ChangelogResult<()> {
        let cursor = self.source.domain_cursor(base_dn, start_state, self.options)?;
        self.inner.add_cursor(base_dn.to_string(), cursor);
        Ok(())
    }

    /// Stops merging the messages of `base_dn`.
    pub fn remove_domain(&mut self, base_dn: &str) {
        self.inner.remove_cursor(base_dn.to_string());
    }

    /// Returns the base DN of the domain of the current message.
    pub fn current_base_dn(&self) -> Option<&str> {
        self.inner.current_id().map(String::as_str)
    }
}

impl DbCursor for MultiDomainCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.inner.record()
    }

    fn next(&mut self) -> ChangelogResult<bool> {
        self.inner.next()
    }
}

impl std::fmt::Debug for MultiDomainCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiDomainCursor")
            .field("options", &self.options)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
