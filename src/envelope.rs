//! The wire envelope: authenticated, timestamped, typed framing for
//! every message exchanged between servers and clients (C1).
//!
//! Wire layout (spec §6), all multi-byte integers big-endian:
//!
//! ```text
//! offset  field                 size
//!   0     magic                 4 bytes, fixed
//!   4     version               1 byte
//!   5     type                  1 byte
//!   6     broadcast_group       4 bytes
//!  10     timestamp_utc         8 bytes (100ns ticks)
//!  18     source_address_len    1 byte (4 or 16)
//!  19     source_address        4 or 16 bytes
//!   .     payload_len           4 bytes
//!   .     payload               payload_len bytes
//!   .     mac_or_seal           32 bytes (HMAC-SHA256)
//! ```

use std::{
    net::IpAddr,
    time::Duration,
};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::clock::Timestamp;

pub const MAGIC: [u8; 4] = *b"BCR1";
pub const VERSION: u8 = 1;
pub const MAC_LEN: usize = 32;

/// Header bytes before the variable-length source address:
/// magic(4) + version(1) + type(1) + group(4) + timestamp(8) + addr_len(1).
const HEADER_PREFIX_LEN: usize = 4 + 1 + 1 + 4 + 8 + 1;

pub const fn overhead(address_len: usize) -> usize {
    HEADER_PREFIX_LEN + address_len + 4 /* payload_len */ + MAC_LEN
}

pub const OVERHEAD_IPV4: usize = overhead(4);
pub const OVERHEAD_IPV6: usize = overhead(16);

pub type HmacSha256 = Hmac<Sha256>;

/// The cluster-wide symmetric secret. Identical across every server
/// and client in one cluster; distributed out-of-band (spec §6).
#[derive(Clone)]
pub struct SharedKey(Vec<u8>);

impl SharedKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    ServerRegister,
    ServerUnregister,
    ClientRegister,
    ClientUnregister,
    Broadcast,
}

impl EnvelopeType {
    fn to_byte(self) -> u8 {
        match self {
            Self::ServerRegister => 0,
            Self::ServerUnregister => 1,
            Self::ClientRegister => 2,
            Self::ClientUnregister => 3,
            Self::Broadcast => 4,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::ServerRegister),
            1 => Some(Self::ServerUnregister),
            2 => Some(Self::ClientRegister),
            3 => Some(Self::ClientUnregister),
            4 => Some(Self::Broadcast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub envelope_type: EnvelopeType,
    pub timestamp_utc: Timestamp,
    pub broadcast_group: u32,
    pub source_address: IpAddr,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("datagram too short")]
    TooShort,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("unknown envelope type")]
    UnknownType,
    #[error("invalid source address length")]
    BadAddressLen,
    #[error("datagram truncated")]
    Truncated,
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("timestamp outside replay window")]
    Stale,
}

/// Serializes `envelope` and appends a fresh HMAC tag keyed by
/// `shared_key` over every preceding byte (spec §4.1: the authenticator
/// MUST cover type, timestamp, group, source address, and payload).
pub fn serialize(envelope: &Envelope, shared_key: &SharedKey) -> Vec<u8> {
    let address_bytes = address_octets(envelope.source_address);
    let mut buf = Vec::with_capacity(overhead(address_bytes.len()) + envelope.payload.len());

    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.push(envelope.envelope_type.to_byte());
    buf.extend_from_slice(&envelope.broadcast_group.to_be_bytes());
    buf.extend_from_slice(&envelope.timestamp_utc.to_be_bytes());
    buf.push(address_bytes.len() as u8);
    buf.extend_from_slice(&address_bytes);
    buf.extend_from_slice(&(envelope.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&envelope.payload);

    let mut mac = shared_key.mac();
    mac.update(&buf);
    let tag = mac.finalize().into_bytes();
    buf.extend_from_slice(&tag);
    buf
}

/// Parses and authenticates a datagram body. Rejects on MAC failure,
/// truncation, unknown type, or a `timestamp_utc` outside
/// `[now - message_ttl, now + message_ttl]` (spec §4.1 invariant).
///
/// Verification is fail-closed: any single-bit change to the preceding
/// bytes, or the wrong key, makes the HMAC comparison fail.
pub fn parse(
    bytes: &[u8],
    shared_key: &SharedKey,
    now: Timestamp,
    message_ttl: Duration,
) -> Result<Envelope, EnvelopeError> {
    if bytes.len() < HEADER_PREFIX_LEN + MAC_LEN {
        return Err(EnvelopeError::TooShort);
    }
    let (body, tag) = bytes.split_at(bytes.len() - MAC_LEN);

    let mut mac = shared_key.mac();
    mac.update(body);
    mac.verify_slice(tag).map_err(|_| EnvelopeError::MacMismatch)?;

    if body[0..4] != MAGIC {
        return Err(EnvelopeError::BadMagic);
    }
    if body[4] != VERSION {
        return Err(EnvelopeError::BadVersion);
    }
    let envelope_type = EnvelopeType::from_byte(body[5]).ok_or(EnvelopeError::UnknownType)?;
    let broadcast_group = u32::from_be_bytes(body[6..10].try_into().unwrap());
    let timestamp_utc = Timestamp::from_be_bytes(body[10..18].try_into().unwrap());

    let address_len = body[18] as usize;
    if address_len != 4 && address_len != 16 {
        return Err(EnvelopeError::BadAddressLen);
    }
    let address_start = 19;
    let address_end = address_start + address_len;
    if body.len() < address_end + 4 {
        return Err(EnvelopeError::Truncated);
    }
    let source_address = octets_to_address(&body[address_start..address_end]);

    let payload_len_start = address_end;
    let payload_start = payload_len_start + 4;
    let payload_len =
        u32::from_be_bytes(body[payload_len_start..payload_start].try_into().unwrap()) as usize;
    if body.len() != payload_start + payload_len {
        return Err(EnvelopeError::Truncated);
    }
    let payload = body[payload_start..payload_start + payload_len].to_vec();

    if crate::clock::abs_diff(now, timestamp_utc) > message_ttl {
        return Err(EnvelopeError::Stale);
    }

    Ok(Envelope {
        envelope_type,
        timestamp_utc,
        broadcast_group,
        source_address,
        payload,
    })
}

fn address_octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn octets_to_address(bytes: &[u8]) -> IpAddr {
    match bytes.len() {
        4 => IpAddr::from(<[u8; 4]>::try_from(bytes).unwrap()),
        16 => IpAddr::from(<[u8; 16]>::try_from(bytes).unwrap()),
        _ => unreachable!("validated by caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> SharedKey {
        SharedKey::new(*b"cluster-shared-secret")
    }

    fn sample(payload: &[u8]) -> Envelope {
        Envelope {
            envelope_type: EnvelopeType::Broadcast,
            timestamp_utc: crate::clock::now(),
            broadcast_group: 7,
            source_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn round_trips() {
        let k = key();
        let e = sample(b"hello");
        let bytes = serialize(&e, &k);
        let parsed = parse(&bytes, &k, e.timestamp_utc, Duration::from_secs(5)).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn empty_payload_round_trips() {
        let k = key();
        let e = sample(b"");
        let bytes = serialize(&e, &k);
        let parsed = parse(&bytes, &k, e.timestamp_utc, Duration::from_secs(5)).unwrap();
        assert_eq!(parsed.payload, Vec::<u8>::new());
    }

    #[test]
    fn rejects_wrong_key() {
        let e = sample(b"hello");
        let bytes = serialize(&e, &key());
        let wrong = SharedKey::new(*b"not-the-shared-secret");
        let err = parse(&bytes, &wrong, e.timestamp_utc, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, EnvelopeError::MacMismatch);
    }

    #[test]
    fn rejects_single_bit_flip() {
        let k = key();
        let e = sample(b"hello");
        let mut bytes = serialize(&e, &k);
        let last = bytes.len() - MAC_LEN - 1;
        bytes[last] ^= 0x01;
        let err = parse(&bytes, &k, e.timestamp_utc, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, EnvelopeError::MacMismatch);
    }

    #[test]
    fn accepts_timestamp_exactly_at_ttl_boundary() {
        let k = key();
        let e = sample(b"x");
        let bytes = serialize(&e, &k);
        let ttl = Duration::from_secs(5);
        let now = e.timestamp_utc + (ttl.as_nanos() / 100) as i64;
        assert!(parse(&bytes, &k, now, ttl).is_ok());
    }

    #[test]
    fn rejects_timestamp_beyond_ttl_boundary() {
        let k = key();
        let e = sample(b"x");
        let bytes = serialize(&e, &k);
        let ttl = Duration::from_secs(5);
        let now = e.timestamp_utc + (ttl.as_nanos() / 100) as i64 + crate::clock::TICKS_PER_SECOND;
        let err = parse(&bytes, &k, now, ttl).unwrap_err();
        assert_eq!(err, EnvelopeError::Stale);
    }

    #[test]
    fn rejects_truncated_datagram() {
        let k = key();
        let e = sample(b"hello world");
        let mut bytes = serialize(&e, &k);
        bytes.truncate(bytes.len() - 5);
        assert!(parse(&bytes, &k, e.timestamp_utc, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let k = key();
        let e = sample(b"hello");
        let mut bytes = serialize(&e, &k);
        bytes[0] ^= 0xff;
        let err = parse(&bytes, &k, e.timestamp_utc, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, EnvelopeError::MacMismatch);
    }

    #[test]
    fn ipv6_round_trips() {
        use std::net::Ipv6Addr;
        let k = key();
        let mut e = sample(b"v6");
        e.source_address = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let bytes = serialize(&e, &k);
        let parsed = parse(&bytes, &k, e.timestamp_utc, Duration::from_secs(5)).unwrap();
        assert_eq!(parsed, e);
    }
}
