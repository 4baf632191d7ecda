//! Change sequence numbers.
//!
//! A CSN identifies a change made on one replica. It combines the time the
//! change was made, a sequence number disambiguating changes made in the same
//! millisecond, and the id of the replica that made the change.
//!
//! # Encodings
//!
//! - bytes: timestamp (8) | server id (2) | sequence number (4), big-endian
//! - string: the same fields as lower-case hexadecimal, 28 characters

use crate::error::{ChangelogError, ChangelogResult};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A change sequence number.
///
/// CSNs are ordered by timestamp, then sequence number, then server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Csn {
    timestamp: u64,
    seqnum: u32,
    server_id: u16,
}

impl Csn {
    /// Number of bytes of the binary form.
    pub const BYTE_SIZE: usize = 14;

    /// Number of characters of the string form.
    pub const STRING_SIZE: usize = 28;

    /// A CSN greater than any other.
    pub const MAX: Self = Self::new(u64::MAX, u32::MAX, u16::MAX);

    /// Creates a CSN.
    #[must_use]
    pub const fn new(timestamp: u64, seqnum: u32, server_id: u16) -> Self {
        Self {
            timestamp,
            seqnum,
            server_id,
        }
    }

    /// Returns the time of the change in milliseconds since the epoch.
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns the sequence number.
    pub const fn seqnum(&self) -> u32 {
        self.seqnum
    }

    /// Returns the id of the replica that made the change.
    pub const fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Appends the binary form to `buf`.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.timestamp);
        buf.put_u16(self.server_id);
        buf.put_u32(self.seqnum);
    }

    /// Returns the binary form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::BYTE_SIZE] {
        let mut bytes = [0u8; Self::BYTE_SIZE];
        self.write_to(&mut &mut bytes[..]);
        bytes
    }

    /// Reads the binary form from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns a decoding error if fewer than [`Self::BYTE_SIZE`] bytes are
    /// left.
    pub fn read_from(buf: &mut impl Buf) -> ChangelogResult<Self> {
        if buf.remaining() < Self::BYTE_SIZE {
            return Err(ChangelogError::decoding(format!(
                "CSN needs {} bytes, {} left",
                Self::BYTE_SIZE,
                buf.remaining()
            )));
        }
        let timestamp = buf.get_u64();
        let server_id = buf.get_u16();
        let seqnum = buf.get_u32();
        Ok(Self::new(timestamp, seqnum, server_id))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.timestamp, self.server_id, self.seqnum
        )
    }
}

impl FromStr for Csn {
    type Err = ChangelogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChangelogError::decoding(format!("invalid CSN '{s}'"));
        if s.len() != Self::STRING_SIZE || !s.is_ascii() {
            return Err(invalid());
        }
        let timestamp = u64::from_str_radix(&s[..16], 16).map_err(|_| invalid())?;
        let server_id = u16::from_str_radix(&s[16..20], 16).map_err(|_| invalid())?;
        let seqnum = u32::from_str_radix(&s[20..], 16).map_err(|_| invalid())?;
        Ok(Self::new(timestamp, seqnum, server_id))
    }
}

/// The most recent CSN seen from each replica of a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerState {
    csns: BTreeMap<u16, Csn>,
}

impl ServerState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` if it is newer than the one known for its replica.
    /// Returns true if the state changed.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.server_id()) {
            Some(known) if *known >= csn => false,
            _ => {
                self.csns.insert(csn.server_id(), csn);
                true
            }
        }
    }

    /// Returns the CSN known for `server_id`.
    pub fn csn(&self, server_id: u16) -> Option<&Csn> {
        self.csns.get(&server_id)
    }

    /// Iterates over the replicas and their CSN.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Csn)> {
        self.csns.iter().map(|(id, csn)| (*id, csn))
    }

    /// Returns true if no replica is known.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<T: IntoIterator<Item = Csn>>(iter: T) -> Self {
        let mut state = Self::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}
