//! Property-based test generators using proptest.
//!
//! Provides strategies for generating CSNs, update messages and payloads
//! that maintain the ordering the logs require.

use crate::fixtures::UPDATE_MSG_OVERHEAD;
use proptest::prelude::*;
use replog_core::block::BLOCK_SIZE;
use replog_core::{Csn, ServerState, UpdateMsg};

/// Strategy for generating any CSN.
pub fn csn_strategy() -> impl Strategy<Value = Csn> {
    (any::<u64>(), any::<u32>(), any::<u16>())
        .prop_map(|(timestamp, seqnum, server_id)| Csn::new(timestamp, seqnum, server_id))
}

/// Strategy for generating a CSN of `server_id`.
pub fn replica_csn_strategy(server_id: u16) -> impl Strategy<Value = Csn> {
    (0u64..1 << 48, any::<u32>())
        .prop_map(move |(timestamp, seqnum)| Csn::new(timestamp, seqnum, server_id))
}

/// Strategy for generating between `min` and `max` distinct CSNs of
/// `server_id`, sorted in increasing order.
pub fn increasing_csns_strategy(
    server_id: u16,
    min: usize,
    max: usize,
) -> impl Strategy<Value = Vec<Csn>> {
    prop::collection::btree_set(1u64..1_000_000, min..max).prop_map(move |timestamps| {
        timestamps
            .into_iter()
            .map(|t| Csn::new(t, 0, server_id))
            .collect()
    })
}

/// Strategy for generating message payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..1024)
}

/// Strategy for generating payloads whose framed message ends just before,
/// on, or just after a block boundary, or spans several blocks.
pub fn straddling_payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    let block = BLOCK_SIZE as usize;
    let overhead = UPDATE_MSG_OVERHEAD as usize;
    prop_oneof![
        (block - overhead - 2..block - overhead + 2),
        (2 * block - overhead - 2..2 * block - overhead + 2),
        (3 * block..6 * block),
    ]
    .prop_flat_map(|len| prop::collection::vec(any::<u8>(), len))
}

/// Strategy for generating update messages of `server_id` in increasing CSN
/// order.
pub fn update_msgs_strategy(
    server_id: u16,
    min: usize,
    max: usize,
) -> impl Strategy<Value = Vec<UpdateMsg>> {
    increasing_csns_strategy(server_id, min, max).prop_flat_map(|csns| {
        let len = csns.len();
        prop::collection::vec(payload_strategy(), len).prop_map(move |payloads| {
            csns.iter()
                .zip(payloads)
                .map(|(csn, payload)| UpdateMsg::new(*csn, payload))
                .collect()
        })
    })
}

/// Strategy for generating a server state over replicas `1..=replicas`.
pub fn server_state_strategy(replicas: u16) -> impl Strategy<Value = ServerState> {
    prop::collection::vec(0u64..1_000_000, usize::from(replicas)).prop_map(|timestamps| {
        timestamps
            .into_iter()
            .zip(1u16..)
            .map(|(t, server_id)| Csn::new(t, 0, server_id))
            .collect()
    })
}

/// Strategy for generating timestamps in any order, duplicates included.
pub fn unordered_timestamps_strategy(min: usize, max: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..200, min..max)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests, suited to tests touching
    /// the file system.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
