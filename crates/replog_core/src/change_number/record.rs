//! Change number index records and their codec.

use crate::csn::Csn;
use crate::error::{ChangelogError, ChangelogResult};
use crate::parser::RecordParser;
use crate::record::{Keyed, Record};
use bytes::{Buf, BufMut};
use std::fmt;

const DN_TERMINATOR: u8 = 0;

/// Associates a change number with the change it designates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeNumberIndexRecord {
    change_number: u64,
    base_dn: String,
    csn: Csn,
}

impl ChangeNumberIndexRecord {
    /// Creates a record.
    pub fn new(change_number: u64, base_dn: impl Into<String>, csn: Csn) -> Self {
        Self {
            change_number,
            base_dn: base_dn.into(),
            csn,
        }
    }

    /// Returns the change number.
    pub fn change_number(&self) -> u64 {
        self.change_number
    }

    /// Returns the base DN of the domain of the change.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Returns the CSN of the change.
    pub fn csn(&self) -> Csn {
        self.csn
    }
}

impl Keyed for ChangeNumberIndexRecord {
    type Key = u64;

    fn ordering_key(&self) -> &u64 {
        &self.change_number
    }
}

impl fmt::Display for ChangeNumberIndexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cn={} dn={} csn={}", self.change_number, self.base_dn, self.csn)
    }
}

/// Codec of the change number index: the change number, the base DN ended
/// by a zero byte, then the CSN.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeNumberIndexRecordParser;

impl RecordParser<u64, ChangeNumberIndexRecord> for ChangeNumberIndexRecordParser {
    fn encode_record(&self, record: &Record<u64, ChangeNumberIndexRecord>) -> Vec<u8> {
        let value = record.value();
        let mut buf = Vec::with_capacity(8 + value.base_dn.len() + 1 + Csn::BYTE_SIZE);
        buf.put_u64(value.change_number);
        buf.put_slice(value.base_dn.as_bytes());
        buf.put_u8(DN_TERMINATOR);
        value.csn.write_to(&mut buf);
        buf
    }

    fn decode_record(&self, data: &[u8]) -> ChangelogResult<Record<u64, ChangeNumberIndexRecord>> {
        let mut buf = data;
        if buf.remaining() < 8 {
            return Err(ChangelogError::decoding(format!(
                "change number index record too short: {} bytes",
                data.len()
            )));
        }
        let change_number = buf.get_u64();
        let end = buf
            .iter()
            .position(|b| *b == DN_TERMINATOR)
            .ok_or_else(|| ChangelogError::decoding("base DN is not terminated"))?;
        let base_dn = std::str::from_utf8(&buf[..end])
            .map_err(|e| ChangelogError::decoding(format!("base DN is not UTF-8: {e}")))?
            .to_string();
        buf.advance(end + 1);
        let csn = Csn::read_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(ChangelogError::decoding(format!(
                "{} unexpected bytes after change number index record",
                buf.remaining()
            )));
        }
        Ok(Record::new(
            change_number,
            ChangeNumberIndexRecord::new(change_number, base_dn, csn),
        ))
    }

    fn encode_key_to_string(&self, key: &u64) -> String {
        key.to_string()
    }

    fn decode_key_from_string(&self, value: &str) -> ChangelogResult<u64> {
        value
            .parse()
            .map_err(|_| ChangelogError::decoding(format!("invalid change number '{value}'")))
    }

    fn max_key(&self) -> u64 {
        u64::MAX
    }
}
