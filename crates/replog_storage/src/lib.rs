//! # Replog Storage
//!
//! Byte-store backends for the replication changelog.
//!
//! This crate provides the lowest-level storage abstraction used by the
//! changelog log files. Backends are **opaque byte stores** - they do not
//! interpret the block framing or the records written through them.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, flush, truncate)
//! - No knowledge of block offsets, records or segment naming
//! - Must be `Send + Sync` so reader pools can hand them across threads
//! - Read-only handles observe data appended through another handle
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing; clones of a handle share the same bytes
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use replog_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut writer = InMemoryBackend::new();
//! let reader = writer.handle();
//! let offset = writer.append(b"hello world").unwrap();
//! let data = reader.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
