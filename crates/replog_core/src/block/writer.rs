//! Writes length-prefixed records, inserting block offsets.

use super::{distance_to_next_block_start, BLOCK_SIZE, OFFSET_SIZE};
use crate::error::{ChangelogError, ChangelogResult};
use crate::parser::RecordParser;
use crate::record::Record;
use replog_storage::StorageBackend;
use std::sync::Arc;

/// Appends records to a storage backend using the block format.
///
/// The writer is the only component that appends to a file. Each record is
/// framed in memory, offsets included, and handed to the backend in a single
/// `append` call so that readers never observe a half-written frame other
/// than a torn tail after a crash.
pub struct BlockWriter<K, V> {
    backend: Box<dyn StorageBackend>,
    parser: Arc<dyn RecordParser<K, V>>,
    bytes_written: u64,
}

impl<K, V> BlockWriter<K, V> {
    /// Creates a writer appending after the current end of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the size of the backend cannot be read.
    pub fn new(
        backend: Box<dyn StorageBackend>,
        parser: Arc<dyn RecordParser<K, V>>,
    ) -> ChangelogResult<Self> {
        let bytes_written = backend.size()?;
        Ok(Self {
            backend,
            parser,
            bytes_written,
        })
    }

    /// Returns the number of bytes in the file, offsets included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoded record does not fit a 4-byte length
    /// or if the write fails.
    pub fn append(&mut self, record: &Record<K, V>) -> ChangelogResult<()> {
        let data = self.parser.encode_record(record);
        let len = u32::try_from(data.len())
            .map_err(|_| ChangelogError::invalid_operation("record too large to be framed"))?;

        let mut payload = Vec::with_capacity(super::LENGTH_SIZE + data.len());
        payload.extend_from_slice(&len.to_be_bytes());
        payload.extend_from_slice(&data);

        let (framed, end) = frame(&payload, self.bytes_written)?;
        self.backend.append(&framed)?;
        self.bytes_written = end;
        Ok(())
    }

    /// Flushes and syncs the file to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> ChangelogResult<()> {
        self.backend.flush()?;
        self.backend.sync()?;
        Ok(())
    }

    /// Truncates the file, dropping everything after `size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails.
    pub fn truncate(&mut self, size: u64) -> ChangelogResult<()> {
        self.backend.truncate(size)?;
        self.bytes_written = size;
        Ok(())
    }
}

/// Splits `payload` across blocks starting at file position `start`.
///
/// Returns the bytes to append and the file position after them.
fn frame(payload: &[u8], start: u64) -> ChangelogResult<(Vec<u8>, u64)> {
    let block_count = payload.len() / (BLOCK_SIZE - OFFSET_SIZE) as usize + 2;
    let mut out = Vec::with_capacity(payload.len() + block_count * OFFSET_SIZE as usize);

    let mut position = start;
    let mut distance = distance_to_next_block_start(position);
    // distance from the record start to the next block boundary
    let mut cumulated = distance;
    let mut remaining = payload;

    while !remaining.is_empty() {
        if distance == 0 {
            let offset = u32::try_from(cumulated)
                .map_err(|_| ChangelogError::invalid_operation("record too large to be framed"))?;
            out.extend_from_slice(&offset.to_be_bytes());
            cumulated += BLOCK_SIZE;
            position += OFFSET_SIZE;
            distance = BLOCK_SIZE - OFFSET_SIZE;
        }
        let chunk = remaining.len().min(usize::try_from(distance).unwrap_or(usize::MAX));
        out.extend_from_slice(&remaining[..chunk]);
        remaining = &remaining[chunk..];
        position += chunk as u64;
        distance = distance_to_next_block_start(position);
    }

    Ok((out, position))
}
