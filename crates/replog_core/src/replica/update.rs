//! Update messages and their codec.

use crate::csn::Csn;
use crate::error::ChangelogResult;
use crate::parser::RecordParser;
use crate::record::{Keyed, Record};
use bytes::{BufMut, Bytes};

/// A replicated change: its CSN and the opaque encoded operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpdateMsg {
    csn: Csn,
    payload: Bytes,
}

impl UpdateMsg {
    /// Creates an update message.
    pub fn new(csn: Csn, payload: impl Into<Bytes>) -> Self {
        Self {
            csn,
            payload: payload.into(),
        }
    }

    /// Returns the CSN of the change.
    pub fn csn(&self) -> Csn {
        self.csn
    }

    /// Returns the encoded operation.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Keyed for UpdateMsg {
    type Key = Csn;

    fn ordering_key(&self) -> &Csn {
        &self.csn
    }
}

/// Codec of replica logs: the CSN followed by the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateMsgParser;

impl RecordParser<Csn, UpdateMsg> for UpdateMsgParser {
    fn encode_record(&self, record: &Record<Csn, UpdateMsg>) -> Vec<u8> {
        let msg = record.value();
        let mut buf = Vec::with_capacity(Csn::BYTE_SIZE + msg.payload.len());
        msg.csn.write_to(&mut buf);
        buf.put_slice(&msg.payload);
        buf
    }

    fn decode_record(&self, data: &[u8]) -> ChangelogResult<Record<Csn, UpdateMsg>> {
        let mut buf = data;
        let csn = Csn::read_from(&mut buf)?;
        Ok(Record::new(csn, UpdateMsg::new(csn, Bytes::copy_from_slice(buf))))
    }

    fn encode_key_to_string(&self, key: &Csn) -> String {
        key.to_string()
    }

    fn decode_key_from_string(&self, value: &str) -> ChangelogResult<Csn> {
        value.parse()
    }

    fn max_key(&self) -> Csn {
        Csn::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockReader, BlockWriter};
    use proptest::prelude::*;
    use replog_storage::InMemoryBackend;
    use std::sync::Arc;

    #[test]
    fn decode_rejects_short_record() {
        assert!(UpdateMsgParser.decode_record(&[0u8; 5]).unwrap_err().is_decoding());
    }

    #[test]
    fn key_string_has_no_separator() {
        let key = UpdateMsgParser.encode_key_to_string(&Csn::new(1, 2, 3));
        assert!(!key.contains('_'));
        assert_eq!(UpdateMsgParser.decode_key_from_string(&key).unwrap(), Csn::new(1, 2, 3));
    }

    proptest! {
        // payload sizes chosen to end before, on and across block boundaries
        #[test]
        fn prop_framed_round_trip(
            sizes in proptest::collection::vec(0usize..700, 1..20),
            prefix in 0usize..256,
        ) {
            let backend = InMemoryBackend::with_data(vec![0u8; prefix]);
            let parser = Arc::new(UpdateMsgParser);
            let mut writer = BlockWriter::new(Box::new(backend.handle()), parser.clone()).unwrap();

            let msgs: Vec<UpdateMsg> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| UpdateMsg::new(Csn::new(i as u64, 0, 1), vec![i as u8; *size]))
                .collect();
            for msg in &msgs {
                writer.append(&Record::new(msg.csn(), msg.clone())).unwrap();
            }

            let mut reader = BlockReader::new(Box::new(backend.handle()), parser);
            reader.seek_to_position(prefix as u64);
            for msg in &msgs {
                let record = reader.read_record().unwrap().unwrap();
                prop_assert_eq!(record.value(), msg);
            }
            prop_assert!(reader.read_record().unwrap().is_none());
        }
    }
}
