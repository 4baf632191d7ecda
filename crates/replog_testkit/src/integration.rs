//! Cross-crate integration test helpers.
//!
//! [`ChangelogHarness`] publishes messages to a changelog while tracking
//! them, then checks that cursors return exactly what was published, in
//! CSN order.

use crate::fixtures::{TestEnvironment, TEST_GENERATION_ID};
use replog_core::{
    ChangelogConfig, ChangelogResult, Csn, CursorOptions, DbCursor, FileChangelogDb, ServerState,
    UpdateMsg,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A test harness for integration testing.
pub struct ChangelogHarness {
    /// The changelog instance.
    pub changelog: Arc<FileChangelogDb>,
    env: TestEnvironment,
    published: BTreeMap<String, BTreeMap<Csn, UpdateMsg>>,
}

impl ChangelogHarness {
    /// Creates a harness on a changelog with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ChangelogConfig::default())
    }

    /// Creates a harness on a changelog with `config`.
    pub fn with_config(config: ChangelogConfig) -> Self {
        let env = TestEnvironment::with_config(config);
        Self {
            changelog: env.changelog(),
            env,
            published: BTreeMap::new(),
        }
    }

    /// Returns the environment of the changelog.
    pub fn environment(&self) -> &TestEnvironment {
        &self.env
    }

    /// Publishes a message and tracks it for later verification.
    pub fn publish(&mut self, base_dn: &str, msg: UpdateMsg) {
        self.changelog
            .publish_update_msg(base_dn, TEST_GENERATION_ID, &msg)
            .expect("Failed to publish update message");
        self.published
            .entry(base_dn.to_string())
            .or_default()
            .insert(msg.csn(), msg);
    }

    /// Purges the changelog up to `csn` and forgets the messages older than
    /// the oldest message left in their replica.
    pub fn purge_up_to(&mut self, csn: &Csn) {
        self.changelog.purge_up_to(csn).expect("Failed to purge changelog");
        for (base_dn, msgs) in &mut self.published {
            let oldest = self.changelog.domain_oldest_csns(base_dn);
            msgs.retain(|key, _| {
                oldest
                    .csn(key.server_id())
                    .map_or(false, |oldest| key >= oldest)
            });
        }
    }

    /// Returns the messages of `base_dn` still tracked, in CSN order.
    pub fn expected(&self, base_dn: &str) -> Vec<UpdateMsg> {
        self.published
            .get(base_dn)
            .map(|msgs| msgs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the messages of `base_dn` a domain cursor reads from the
    /// oldest ones.
    pub fn read_domain(&self, base_dn: &str) -> ChangelogResult<Vec<UpdateMsg>> {
        let mut cursor =
            self.changelog
                .domain_cursor(base_dn, &ServerState::new(), CursorOptions::after())?;
        let mut msgs = Vec::new();
        while cursor.next()? {
            if let Some(msg) = cursor.record() {
                msgs.push(msg.clone());
            }
        }
        Ok(msgs)
    }

    /// Returns every message a multi-domain cursor reads, with its base DN.
    pub fn read_all(&self) -> ChangelogResult<Vec<(String, UpdateMsg)>> {
        let start: BTreeMap<String, ServerState> = self
            .published
            .keys()
            .map(|dn| (dn.clone(), ServerState::new()))
            .collect();
        let mut cursor = self
            .changelog
            .multi_domain_cursor(&start, CursorOptions::after())?;
        let mut msgs = Vec::new();
        while cursor.next()? {
            if let (Some(msg), Some(dn)) = (cursor.record(), cursor.current_base_dn()) {
                msgs.push((dn.to_string(), msg.clone()));
            }
        }
        Ok(msgs)
    }

    /// Verifies that the domain cursor of `base_dn` returns exactly the
    /// tracked messages.
    pub fn verify_domain(&self, base_dn: &str) {
        let actual = self.read_domain(base_dn).expect("Failed to read domain");
        assert_eq!(
            actual,
            self.expected(base_dn),
            "Messages read from domain {base_dn} do not match"
        );
    }

    /// Verifies every domain, then the merge of all domains.
    pub fn verify_all(&self) {
        for base_dn in self.published.keys() {
            self.verify_domain(base_dn);
        }
        let actual = self.read_all().expect("Failed to read changelog");
        let mut expected: Vec<(String, UpdateMsg)> = self
            .published
            .iter()
            .flat_map(|(dn, msgs)| msgs.values().map(move |msg| (dn.clone(), msg.clone())))
            .collect();
        expected.sort_by(|(dn_a, a), (dn_b, b)| a.csn().cmp(&b.csn()).then_with(|| dn_a.cmp(dn_b)));
        assert_eq!(actual, expected, "Messages read from all domains do not match");
    }

    /// Returns the number of tracked messages.
    pub fn tracked_count(&self) -> usize {
        self.published.values().map(BTreeMap::len).sum()
    }
}

impl Default for ChangelogHarness {
    fn default() -> Self {
        Self::new()
    }
}
