//! Snapshot of what the environment holds on disk.

use crate::csn::{Csn, ServerState};
use std::collections::{BTreeMap, BTreeSet};

/// The domains, replicas and offline replicas found on disk when the
/// changelog starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangelogState {
    domain_to_generation_id: BTreeMap<String, i64>,
    domain_to_server_ids: BTreeMap<String, BTreeSet<u16>>,
    offline_replicas: BTreeMap<String, ServerState>,
}

impl ChangelogState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the generation id of a domain.
    pub fn set_domain_generation_id(&mut self, base_dn: &str, generation_id: i64) {
        self.domain_to_generation_id
            .insert(base_dn.to_string(), generation_id);
    }

    /// Records a replica of a domain.
    pub fn add_server_id_to_domain(&mut self, server_id: u16, base_dn: &str) {
        self.domain_to_server_ids
            .entry(base_dn.to_string())
            .or_default()
            .insert(server_id);
    }

    /// Records a replica that went offline at `offline_csn`.
    pub fn add_offline_replica(&mut self, base_dn: &str, offline_csn: Csn) {
        self.offline_replicas
            .entry(base_dn.to_string())
            .or_default()
            .update(offline_csn);
    }

    /// Returns the generation id of each domain.
    pub fn domain_to_generation_id(&self) -> &BTreeMap<String, i64> {
        &self.domain_to_generation_id
    }

    /// Returns the replicas of each domain.
    pub fn domain_to_server_ids(&self) -> &BTreeMap<String, BTreeSet<u16>> {
        &self.domain_to_server_ids
    }

    /// Returns the offline replicas of each domain.
    pub fn offline_replicas(&self) -> &BTreeMap<String, ServerState> {
        &self.offline_replicas
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.domain_to_generation_id.is_empty()
            && self.domain_to_server_ids.is_empty()
            && self.offline_replicas.is_empty()
    }
}
