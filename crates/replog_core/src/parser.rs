//! Pluggable codecs turning records into bytes and keys into file names.

use crate::error::ChangelogResult;
use crate::record::Record;
use std::fmt;

/// Bounds required from the key of a log.
pub trait LogKey: Ord + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Ord + Clone + fmt::Debug + Send + Sync + 'static> LogKey for T {}

/// Bounds required from the value of a log.
pub trait LogValue: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> LogValue for T {}

/// Encodes and decodes the records of one log.
///
/// # Contract
///
/// - `decode_record(encode_record(r)) == r`
/// - `decode_key_from_string(encode_key_to_string(k)) == k`, and the string
///   form contains neither `_` nor a path separator, since it is used to name
///   read-only log files `<lowest>_<highest>.log`
/// - `max_key()` is strictly greater than any key that is ever appended; it
///   tags the head log file
pub trait RecordParser<K, V>: Send + Sync {
    /// Encodes a record to bytes.
    fn encode_record(&self, record: &Record<K, V>) -> Vec<u8>;

    /// Decodes a record from bytes.
    ///
    /// # Errors
    ///
    /// Returns a decoding error if the bytes are malformed.
    fn decode_record(&self, data: &[u8]) -> ChangelogResult<Record<K, V>>;

    /// Encodes a key to the string used in log file names.
    fn encode_key_to_string(&self, key: &K) -> String;

    /// Decodes a key from its file name form.
    ///
    /// # Errors
    ///
    /// Returns a decoding error if the string is not a valid key.
    fn decode_key_from_string(&self, value: &str) -> ChangelogResult<K>;

    /// Returns the sentinel key associated with the head log file.
    fn max_key(&self) -> K;
}
