//! Reads records framed by [`super::BlockWriter`].

use super::{distance_to_next_block_start, BLOCK_SIZE, LENGTH_SIZE, OFFSET_SIZE};
use crate::cursor::{KeyMatchingStrategy, PositionStrategy};
use crate::error::{ChangelogError, ChangelogResult};
use crate::parser::RecordParser;
use crate::record::Record;
use replog_storage::StorageBackend;
use std::cmp::Ordering;
use std::sync::Arc;

/// Outcome of positioning a reader on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Positioned<K, V> {
    /// No record matches the key with the requested strategy.
    NotFound,
    /// A record matched. The reader sits after the returned record, which is
    /// the next one a cursor must return. `None` means the match was the last
    /// record of the file and the cursor must return what comes next.
    Found(Option<Record<K, V>>),
}

/// Sequential and random-access reader over a block-framed file.
pub struct BlockReader<K, V> {
    backend: Box<dyn StorageBackend>,
    parser: Arc<dyn RecordParser<K, V>>,
    position: u64,
    readable_size: Option<u64>,
}

impl<K, V> BlockReader<K, V> {
    /// Creates a reader positioned at the start of the file.
    pub fn new(backend: Box<dyn StorageBackend>, parser: Arc<dyn RecordParser<K, V>>) -> Self {
        Self {
            backend,
            parser,
            position: 0,
            readable_size: None,
        }
    }

    /// Restricts the reader to the first `size` bytes of the file. Whatever
    /// follows is ignored as if the file ended there.
    #[must_use]
    pub fn with_readable_size(mut self, size: u64) -> Self {
        self.readable_size = Some(size);
        self
    }

    fn size(&self) -> ChangelogResult<u64> {
        let size = self.backend.size()?;
        Ok(self.readable_size.map_or(size, |limit| size.min(limit)))
    }

    /// Returns the current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the reader to a record start previously obtained from
    /// [`Self::position`].
    pub fn seek_to_position(&mut self, position: u64) {
        self.position = position;
    }

    /// Moves the reader to the end of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file size cannot be read.
    pub fn seek_to_end(&mut self) -> ChangelogResult<()> {
        self.position = self.size()?;
        Ok(())
    }

    /// Returns the size of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file size cannot be read.
    pub fn file_size(&self) -> ChangelogResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Reads the next record.
    ///
    /// Returns `None` at the end of the file, including when the tail only
    /// holds part of a record; the position is then left unchanged so that a
    /// later call sees the record once it is complete.
    ///
    /// # Errors
    ///
    /// Returns an error if a complete record cannot be decoded.
    pub fn read_record(&mut self) -> ChangelogResult<Option<Record<K, V>>> {
        match self.read_record_bytes()? {
            Some(bytes) => self.parser.decode_record(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Reads the raw bytes of the next record, without its length prefix.
    fn read_record_bytes(&mut self) -> ChangelogResult<Option<Vec<u8>>> {
        let start = self.position;
        let size = self.size()?;

        let Some(prefix) = self.read_data(LENGTH_SIZE, size)? else {
            self.position = start;
            return Ok(None);
        };
        let mut len = [0u8; LENGTH_SIZE];
        len.copy_from_slice(&prefix);
        let len = u32::from_be_bytes(len) as usize;

        match self.read_data(len, size)? {
            Some(bytes) => Ok(Some(bytes)),
            None => {
                self.position = start;
                Ok(None)
            }
        }
    }

    /// Reads `len` data bytes, skipping the offsets found at block
    /// boundaries. Returns `None` if the file ends before.
    fn read_data(&mut self, len: usize, size: u64) -> ChangelogResult<Option<Vec<u8>>> {
        if self.position + len as u64 > size {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(len);
        let mut position = self.position;
        while out.len() < len {
            let mut distance = distance_to_next_block_start(position);
            if distance == 0 {
                position += OFFSET_SIZE;
                distance = BLOCK_SIZE - OFFSET_SIZE;
            }
            let chunk = (len - out.len()).min(usize::try_from(distance).unwrap_or(usize::MAX));
            if position + chunk as u64 > size {
                return Ok(None);
            }
            out.extend_from_slice(&self.backend.read_at(position, chunk)?);
            position += chunk as u64;
        }
        self.position = position;
        Ok(Some(out))
    }

    /// Returns the start of the record stored at or straddling the block
    /// boundary `block_start`, or `None` if its offset is not complete yet.
    fn record_start_of_block(&self, block_start: u64, size: u64) -> ChangelogResult<Option<u64>> {
        if block_start == 0 {
            return Ok(Some(0));
        }
        if block_start + OFFSET_SIZE > size {
            return Ok(None);
        }
        let bytes = self.backend.read_at(block_start, OFFSET_SIZE as usize)?;
        let mut offset = [0u8; OFFSET_SIZE as usize];
        offset.copy_from_slice(&bytes);
        let offset = u64::from(u32::from_be_bytes(offset));
        if offset > block_start {
            return Err(ChangelogError::invalid_format(format!(
                "invalid block offset {offset} at position {block_start}"
            )));
        }
        Ok(Some(block_start - offset))
    }

    /// Returns the start of the last record whose block offset is complete.
    fn last_block_record_start(&self, size: u64) -> ChangelogResult<u64> {
        let mut block_start = (size.saturating_sub(1) / BLOCK_SIZE) * BLOCK_SIZE;
        loop {
            if let Some(start) = self.record_start_of_block(block_start, size)? {
                return Ok(start);
            }
            block_start -= BLOCK_SIZE;
        }
    }

    /// Checks the file and returns the size it must be truncated to if its
    /// tail holds a torn or undecodable record, `None` if the file is valid.
    ///
    /// Only the records following the last block boundary are examined.
    ///
    /// # Errors
    ///
    /// Returns an error if a block offset is invalid or on I/O failure.
    pub fn check_log_is_valid(&mut self) -> ChangelogResult<Option<u64>> {
        let size = self.size()?;
        if size == 0 {
            return Ok(None);
        }
        self.position = self.last_block_record_start(size)?;
        loop {
            let before = self.position;
            if before >= size {
                return Ok(None);
            }
            match self.read_record_bytes()? {
                None => return Ok(Some(before)),
                Some(bytes) => match self.parser.decode_record(&bytes) {
                    Ok(_) => {}
                    Err(e) if e.is_decoding() => {
                        tracing::warn!(position = before, error = %e, "undecodable record at log tail");
                        return Ok(Some(before));
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Returns the first record of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be decoded.
    pub fn oldest_record(&mut self) -> ChangelogResult<Option<Record<K, V>>> {
        self.position = 0;
        self.read_record()
    }

    /// Returns the last complete record of the file.
    ///
    /// Starts from the last block boundary and falls back to a full scan if
    /// nothing complete follows it.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be decoded.
    pub fn newest_record(&mut self) -> ChangelogResult<Option<Record<K, V>>> {
        let size = self.size()?;
        if size == 0 {
            return Ok(None);
        }
        let start = self.last_block_record_start(size)?;
        self.position = start;
        let newest = self.read_until_end()?;
        if newest.is_some() || start == 0 {
            return Ok(newest);
        }
        self.position = 0;
        self.read_until_end()
    }

    fn read_until_end(&mut self) -> ChangelogResult<Option<Record<K, V>>> {
        let mut last = None;
        while let Some(record) = self.read_record()? {
            last = Some(record);
        }
        Ok(last)
    }

    /// Counts the complete records of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be decoded.
    pub fn number_of_records(&mut self) -> ChangelogResult<u64> {
        self.position = 0;
        let mut count = 0;
        while self.read_record_bytes()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

impl<K: Ord, V> BlockReader<K, V> {
    /// Binary searches the block boundaries for the record start closest to
    /// `key` from below.
    ///
    /// Returns the start of the record with the greatest key less than or
    /// equal to `key` among the records found at block boundaries, `0` if
    /// all of them are greater, and `None` for an empty file. A boundary
    /// whose record is not complete yet is treated as greater.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, invalid block offset or if a
    /// complete record at a boundary cannot be decoded.
    pub fn search_closest_block_start_to_key(&mut self, key: &K) -> ChangelogResult<Option<u64>> {
        let size = self.size()?;
        if size == 0 {
            return Ok(None);
        }

        let mut low = 0u64;
        let mut high = (size - 1) / BLOCK_SIZE;
        let mut best = 0u64;
        while low <= high {
            let middle = low + (high - low) / 2;
            let at_or_below = match self.record_start_of_block(middle * BLOCK_SIZE, size)? {
                Some(start) => {
                    self.position = start;
                    match self.read_record()? {
                        Some(record) if record.key() <= key => {
                            best = start;
                            true
                        }
                        _ => false,
                    }
                }
                None => false,
            };
            if at_or_below {
                low = middle + 1;
            } else if middle == 0 {
                break;
            } else {
                high = middle - 1;
            }
        }
        Ok(Some(best))
    }

    /// Positions the reader on `key`, scanning forward from `start`.
    ///
    /// With [`KeyMatchingStrategy::LessThanOrEqualToKey`], when the scan
    /// reaches a greater key or the end of the file, the last record read
    /// before is the match. With
    /// [`KeyMatchingStrategy::GreaterThanOrEqualToKey`], a match on a greater
    /// key is returned even with [`PositionStrategy::AfterMatchingKey`]
    /// since it already comes after `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be decoded.
    pub fn position_to_key(
        &mut self,
        start: u64,
        key: &K,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<Positioned<K, V>> {
        self.position = start;
        let mut previous: Option<(Record<K, V>, u64)> = None;
        loop {
            let before = self.position;
            let Some(record) = self.read_record()? else {
                return match (matching, previous) {
                    (KeyMatchingStrategy::LessThanOrEqualToKey, Some((record, after))) => {
                        self.finish_match(record, after, position)
                    }
                    _ => Ok(Positioned::NotFound),
                };
            };
            let after = self.position;
            match record.key().cmp(key) {
                Ordering::Less => previous = Some((record, after)),
                Ordering::Equal => return self.finish_match(record, after, position),
                Ordering::Greater => {
                    return match matching {
                        KeyMatchingStrategy::EqualToKey => {
                            self.position = before;
                            Ok(Positioned::NotFound)
                        }
                        // the record is already past the key, it is never skipped
                        KeyMatchingStrategy::GreaterThanOrEqualToKey => {
                            self.finish_match(record, after, PositionStrategy::OnMatchingKey)
                        }
                        KeyMatchingStrategy::LessThanOrEqualToKey => match previous {
                            Some((record, after)) => self.finish_match(record, after, position),
                            None => {
                                self.position = before;
                                Ok(Positioned::NotFound)
                            }
                        },
                    };
                }
            }
        }
    }

    fn finish_match(
        &mut self,
        record: Record<K, V>,
        after: u64,
        position: PositionStrategy,
    ) -> ChangelogResult<Positioned<K, V>> {
        self.position = after;
        match position {
            PositionStrategy::OnMatchingKey => Ok(Positioned::Found(Some(record))),
            PositionStrategy::AfterMatchingKey => Ok(Positioned::Found(self.read_record()?)),
        }
    }

    /// Positions the reader on `key` using the block index to skip most of
    /// the file.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be decoded.
    pub fn seek_to_record(
        &mut self,
        key: &K,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> ChangelogResult<Positioned<K, V>> {
        match self.search_closest_block_start_to_key(key)? {
            Some(start) => self.position_to_key(start, key, matching, position),
            None => Ok(Positioned::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockWriter;
    use crate::parser::test_support::{record, StringParser};
    use proptest::prelude::*;
    use replog_storage::InMemoryBackend;

    fn write(backend: &InMemoryBackend, keys: impl IntoIterator<Item = u64>) {
        let mut writer =
            BlockWriter::new(Box::new(backend.handle()), Arc::new(StringParser)).unwrap();
        for key in keys {
            writer.append(&record(key)).unwrap();
        }
    }

    fn reader(backend: &InMemoryBackend) -> BlockReader<u64, String> {
        BlockReader::new(Box::new(backend.handle()), Arc::new(StringParser))
    }

    fn keys_of(reader: &mut BlockReader<u64, String>) -> Vec<u64> {
        let mut keys = Vec::new();
        while let Some(r) = reader.read_record().unwrap() {
            keys.push(*r.key());
        }
        keys
    }

    #[test]
    fn read_back_across_many_blocks() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=100);
        let mut r = reader(&backend);
        assert_eq!(keys_of(&mut r), (1..=100).collect::<Vec<_>>());
        // end of file is sticky
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn read_large_record() {
        let backend = InMemoryBackend::new();
        let mut writer =
            BlockWriter::new(Box::new(backend.handle()), Arc::new(StringParser)).unwrap();
        writer.append(&record(1)).unwrap();
        writer.append(&Record::new(2, "y".repeat(1000))).unwrap();
        writer.append(&record(3)).unwrap();

        let mut r = reader(&backend);
        assert_eq!(r.read_record().unwrap().unwrap(), record(1));
        assert_eq!(r.read_record().unwrap().unwrap().value().len(), 1000);
        assert_eq!(r.read_record().unwrap().unwrap(), record(3));
    }

    #[test]
    fn partial_record_is_not_returned() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=3);
        let full = backend.data();
        let torn = InMemoryBackend::with_data(full[..full.len() - 3].to_vec());

        let mut r = reader(&torn);
        assert_eq!(keys_of(&mut r), vec![1, 2]);
        let position = r.position();
        assert!(r.read_record().unwrap().is_none());
        assert_eq!(r.position(), position);
    }

    #[test]
    fn reader_sees_records_appended_later() {
        let backend = InMemoryBackend::new();
        write(&backend, [1]);
        let mut r = reader(&backend);
        assert_eq!(keys_of(&mut r), vec![1]);
        write(&backend, [2]);
        assert_eq!(keys_of(&mut r), vec![2]);
    }

    #[test]
    fn search_on_empty_file() {
        let backend = InMemoryBackend::new();
        assert_eq!(reader(&backend).search_closest_block_start_to_key(&1).unwrap(), None);
    }

    #[test]
    fn search_returns_record_at_or_below_key() {
        let backend = InMemoryBackend::new();
        write(&backend, (1..=200).map(|k| k * 2));
        let mut r = reader(&backend);

        for key in [1u64, 2, 77, 250, 399, 400, 1000] {
            let start = r.search_closest_block_start_to_key(&key).unwrap().unwrap();
            r.seek_to_position(start);
            let found = r.read_record().unwrap().unwrap();
            if key >= 2 {
                assert!(*found.key() <= key, "key {key} found {}", found.key());
            } else {
                assert_eq!(start, 0);
            }
        }
    }

    #[test]
    fn position_equal_on_and_after() {
        let backend = InMemoryBackend::new();
        write(&backend, (1..=50).map(|k| k * 10));
        let mut r = reader(&backend);

        let on = r
            .seek_to_record(&200, KeyMatchingStrategy::EqualToKey, PositionStrategy::OnMatchingKey)
            .unwrap();
        assert_eq!(on, Positioned::Found(Some(record(200))));
        assert_eq!(r.read_record().unwrap().unwrap(), record(210));

        let after = r
            .seek_to_record(&200, KeyMatchingStrategy::EqualToKey, PositionStrategy::AfterMatchingKey)
            .unwrap();
        assert_eq!(after, Positioned::Found(Some(record(210))));
        assert_eq!(r.read_record().unwrap().unwrap(), record(220));

        let missing = r
            .seek_to_record(&205, KeyMatchingStrategy::EqualToKey, PositionStrategy::OnMatchingKey)
            .unwrap();
        assert_eq!(missing, Positioned::NotFound);
    }

    #[test]
    fn greater_match_is_not_skipped_after_missing_key() {
        let backend = InMemoryBackend::new();
        write(&backend, (1..=50).map(|k| k * 10));
        let mut r = reader(&backend);

        let exact = r
            .seek_to_record(
                &200,
                KeyMatchingStrategy::GreaterThanOrEqualToKey,
                PositionStrategy::AfterMatchingKey,
            )
            .unwrap();
        assert_eq!(exact, Positioned::Found(Some(record(210))));

        let greater = r
            .seek_to_record(
                &205,
                KeyMatchingStrategy::GreaterThanOrEqualToKey,
                PositionStrategy::AfterMatchingKey,
            )
            .unwrap();
        assert_eq!(greater, Positioned::Found(Some(record(210))));
        assert_eq!(r.read_record().unwrap().unwrap(), record(220));
    }

    #[test]
    fn position_less_and_greater() {
        let backend = InMemoryBackend::new();
        write(&backend, (1..=50).map(|k| k * 10));
        let mut r = reader(&backend);

        let lte = r
            .seek_to_record(
                &205,
                KeyMatchingStrategy::LessThanOrEqualToKey,
                PositionStrategy::OnMatchingKey,
            )
            .unwrap();
        assert_eq!(lte, Positioned::Found(Some(record(200))));

        let gte = r
            .seek_to_record(
                &205,
                KeyMatchingStrategy::GreaterThanOrEqualToKey,
                PositionStrategy::OnMatchingKey,
            )
            .unwrap();
        assert_eq!(gte, Positioned::Found(Some(record(210))));

        let below_all = r
            .seek_to_record(
                &5,
                KeyMatchingStrategy::LessThanOrEqualToKey,
                PositionStrategy::OnMatchingKey,
            )
            .unwrap();
        assert_eq!(below_all, Positioned::NotFound);

        let above_all = r
            .seek_to_record(
                &9999,
                KeyMatchingStrategy::GreaterThanOrEqualToKey,
                PositionStrategy::OnMatchingKey,
            )
            .unwrap();
        assert_eq!(above_all, Positioned::NotFound);
    }

    #[test]
    fn less_than_or_equal_at_end_of_file_uses_last_record() {
        let backend = InMemoryBackend::new();
        write(&backend, (1..=50).map(|k| k * 10));
        let mut r = reader(&backend);

        let found = r
            .seek_to_record(
                &9999,
                KeyMatchingStrategy::LessThanOrEqualToKey,
                PositionStrategy::OnMatchingKey,
            )
            .unwrap();
        assert_eq!(found, Positioned::Found(Some(record(500))));

        let after_last = r
            .seek_to_record(
                &9999,
                KeyMatchingStrategy::LessThanOrEqualToKey,
                PositionStrategy::AfterMatchingKey,
            )
            .unwrap();
        assert_eq!(after_last, Positioned::Found(None));
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn valid_log_needs_no_truncation() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=40);
        assert_eq!(reader(&backend).check_log_is_valid().unwrap(), None);
        assert_eq!(reader(&InMemoryBackend::new()).check_log_is_valid().unwrap(), None);
    }

    #[test]
    fn torn_tail_is_detected() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=40);
        let valid_size = backend.data().len();
        write(&backend, [41]);

        let data = backend.data();
        for cut in valid_size + 1..data.len() {
            let torn = InMemoryBackend::with_data(data[..cut].to_vec());
            assert_eq!(
                reader(&torn).check_log_is_valid().unwrap(),
                Some(valid_size as u64),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn undecodable_tail_is_detected() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=3);
        let valid_size = backend.data().len() as u64;
        // a complete frame too short to hold a key
        let mut data = backend.data();
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[1, 2]);
        let corrupted = InMemoryBackend::with_data(data);

        assert_eq!(reader(&corrupted).check_log_is_valid().unwrap(), Some(valid_size));
    }

    #[test]
    fn search_reports_undecodable_record_at_block_start() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=3);
        let mut data = backend.data();
        // offset, length prefix and key come before the value of record 1
        assert_eq!(&data[16..22], b"value1");
        data[16] = 0xff;
        let corrupted = InMemoryBackend::with_data(data);

        let err = reader(&corrupted)
            .search_closest_block_start_to_key(&2)
            .unwrap_err();
        assert!(err.is_decoding());
    }

    #[test]
    fn readable_size_hides_the_tail() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=3);
        let valid_size = backend.data().len() as u64;
        let mut data = backend.data();
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[1, 2]);
        let corrupted = InMemoryBackend::with_data(data);

        let mut r = reader(&corrupted).with_readable_size(valid_size);
        assert_eq!(r.check_log_is_valid().unwrap(), None);
        assert_eq!(r.newest_record().unwrap().unwrap(), record(3));
        r.seek_to_position(0);
        assert_eq!(keys_of(&mut r), vec![1, 2, 3]);
        assert_eq!(r.file_size().unwrap(), valid_size + 6);
    }

    #[test]
    fn oldest_newest_and_count() {
        let backend = InMemoryBackend::new();
        write(&backend, 1..=75);
        let mut r = reader(&backend);
        assert_eq!(r.oldest_record().unwrap().unwrap(), record(1));
        assert_eq!(r.newest_record().unwrap().unwrap(), record(75));
        assert_eq!(r.number_of_records().unwrap(), 75);

        let empty = InMemoryBackend::new();
        assert!(reader(&empty).newest_record().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_seek_matches_linear_scan(
            keys in proptest::collection::btree_set(0u64..5_000, 1..150),
            sought in 0u64..5_100,
        ) {
            let backend = InMemoryBackend::new();
            write(&backend, keys.iter().copied());
            let mut r = reader(&backend);

            let expected_gte = keys.range(sought..).next().copied();
            let expected_lte = keys.range(..=sought).next_back().copied();

            let gte = r.seek_to_record(
                &sought,
                KeyMatchingStrategy::GreaterThanOrEqualToKey,
                PositionStrategy::OnMatchingKey,
            ).unwrap();
            prop_assert_eq!(gte, expected_gte.map_or(Positioned::NotFound, |k| Positioned::Found(Some(record(k)))));

            let lte = r.seek_to_record(
                &sought,
                KeyMatchingStrategy::LessThanOrEqualToKey,
                PositionStrategy::OnMatchingKey,
            ).unwrap();
            prop_assert_eq!(lte, expected_lte.map_or(Positioned::NotFound, |k| Positioned::Found(Some(record(k)))));
        }

        #[test]
        fn prop_newest_is_last_written(count in 1u64..120, pad in 0usize..300) {
            let backend = InMemoryBackend::with_data(Vec::new());
            let mut writer = BlockWriter::new(Box::new(backend.handle()), Arc::new(StringParser)).unwrap();
            for key in 0..count {
                writer.append(&Record::new(key, "p".repeat(pad % (key as usize + 1)))).unwrap();
            }
            let mut r = reader(&backend);
            prop_assert_eq!(r.newest_record().unwrap().map(|rec| *rec.key()), Some(count - 1));
        }
    }
}
