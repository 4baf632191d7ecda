//! # Replog Testkit
//!
//! Test utilities for the replication changelog.
//!
//! This crate provides:
//! - Temporary environments, changelogs and logs
//! - Property-based test generators using proptest
//! - Crash simulation: torn writes and damaged file tails
//! - An integration harness checking what cursors return against what
//!   was published
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replog_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_changelog() {
//!     with_temp_changelog(|changelog| {
//!         changelog.publish_update_msg("dc=example,dc=com", 1, &msg(1_000, 1)).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
