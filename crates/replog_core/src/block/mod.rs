//! Block framing of log files.
//!
//! A log file is a sequence of records, each stored as a 4-byte big-endian
//! length followed by the encoded record. The byte stream is cut into blocks
//! of [`BLOCK_SIZE`] bytes; every block except the first starts with a 4-byte
//! big-endian offset giving the distance back to the beginning of the record
//! that straddles (or starts at) that block boundary:
//!
//! ```text
//! | block 0 (256 bytes)        | block 1                     | block 2 ...
//! | len | rec | len | rec ...  | off | ... rec | len | rec   | off | ...
//!                  ^<------------off-|
//! ```
//!
//! The offsets make it possible to find a record start from any block
//! boundary, which enables a binary search on keys and a fast lookup of the
//! last record of a file.

mod reader;
mod writer;

pub use reader::{BlockReader, Positioned};
pub use writer::BlockWriter;

/// Size of a block in bytes.
pub const BLOCK_SIZE: u64 = 256;

/// Size of the back-offset stored at every block boundary.
pub const OFFSET_SIZE: u64 = 4;

/// Size of the length prefix of a record.
pub const LENGTH_SIZE: usize = 4;

/// Returns the number of data bytes before the next block boundary.
///
/// The start of the file is treated as a full block with no offset.
pub(crate) fn distance_to_next_block_start(position: u64) -> u64 {
    if position == 0 {
        return BLOCK_SIZE;
    }
    match position % BLOCK_SIZE {
        0 => 0,
        r => BLOCK_SIZE - r,
    }
}
