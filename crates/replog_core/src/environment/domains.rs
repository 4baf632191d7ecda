//! The domain id mapping persisted in `domains.state`.

use crate::error::{ChangelogError, ChangelogResult};
use std::collections::BTreeMap;

/// Separates the domain id from the base DN on each line.
const FIELD_SEPARATOR: char = ':';

/// Mapping from base DN to the short id naming its directory.
///
/// Persisted as one `id:dn` line per domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainIds {
    ids: BTreeMap<String, u64>,
    next_id: u64,
}

impl DomainIds {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ids: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Returns the id of a domain.
    #[must_use]
    pub fn get(&self, base_dn: &str) -> Option<u64> {
        self.ids.get(base_dn).copied()
    }

    /// Returns the id of a domain, allocating one if it has none.
    /// The boolean is true if the id was just allocated.
    pub fn get_or_allocate(&mut self, base_dn: &str) -> (u64, bool) {
        if let Some(&id) = self.ids.get(base_dn) {
            return (id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(base_dn.to_string(), id);
        (id, true)
    }

    /// Forgets a domain, returning its id.
    pub fn remove(&mut self, base_dn: &str) -> Option<u64> {
        self.ids.remove(base_dn)
    }

    /// Iterates over (base DN, id) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.ids.iter().map(|(dn, id)| (dn.as_str(), *id))
    }

    /// Returns the number of domains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if no domain is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Encodes the mapping, ordered by id.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut by_id: Vec<_> = self.ids.iter().collect();
        by_id.sort_by_key(|(_, id)| **id);
        by_id
            .into_iter()
            .map(|(dn, id)| format!("{id}{FIELD_SEPARATOR}{dn}\n"))
            .collect()
    }

    /// Decodes the mapping. Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns an invalid format error for a line without separator, with a
    /// non-numeric id, or repeating an id or a base DN.
    pub fn decode(text: &str) -> ChangelogResult<Self> {
        let mut domains = Self::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let invalid = |reason: &str| {
                ChangelogError::invalid_format(format!(
                    "line {} of domains state '{line}': {reason}",
                    number + 1
                ))
            };
            let (id, base_dn) = line
                .split_once(FIELD_SEPARATOR)
                .ok_or_else(|| invalid("missing separator"))?;
            let id: u64 = id.trim().parse().map_err(|_| invalid("invalid domain id"))?;
            if domains.ids.values().any(|known| *known == id) {
                return Err(invalid("duplicate domain id"));
            }
            if domains.ids.insert(base_dn.to_string(), id).is_some() {
                return Err(invalid("duplicate base DN"));
            }
            domains.next_id = domains.next_id.max(id + 1);
        }
        Ok(domains)
    }
}
