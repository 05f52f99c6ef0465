//! Binary wire format.
//!
//! All integers are little-endian, strings are u32-length-prefixed UTF-8,
//! tagged unions carry a one-byte tag, and recursive child counts use LEB128
//! varints. Decoding is fully checked: truncated or malformed input yields an
//! error, never a panic.

use crate::{
    command::Command,
    data::{Data, Port, Protocol, Subnet},
    message::{CommandMessage, DataMessage, NodeContent, NodeMessage, PeerMessage, SubscriptionUpdate},
    topic::{Filter, Topic},
    types::{PeerId, Timespan},
    Error, Result,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

/// Byte length of the frame header (payload length, u32 LE).
pub const FRAME_HEADER_LEN: usize = 4;

/// Types that serialize themselves into a byte buffer.
pub trait Encode {
    /// Append the wire representation of `self` to `buf`.
    fn encode<B: BufMut>(&self, buf: &mut B);
}

/// Types that deserialize themselves from a byte buffer.
pub trait Decode: Sized {
    /// Consume the wire representation of `Self` from `buf`.
    ///
    /// # Errors
    /// Returns a wire error on truncated or malformed input.
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
}

/// Encode a value into a fresh byte buffer.
pub fn to_bytes<T: Encode>(value: &T) -> Bytes {
    let mut buf = BytesMut::new();
    value.encode(&mut buf);
    buf.freeze()
}

/// Frame a peer message for the TCP link: u32-LE payload length + payload.
///
/// # Errors
/// Returns [`Error::FrameTooLarge`] if the payload exceeds `max_frame_size`.
pub fn frame(msg: &PeerMessage, max_frame_size: usize) -> Result<Bytes> {
    let payload = to_bytes(msg);
    if payload.len() > max_frame_size {
        return Err(Error::FrameTooLarge { actual: payload.len(), max: max_frame_size });
    }
    let mut framed = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    framed.put_u32_le(payload.len() as u32);
    framed.put_slice(&payload);
    Ok(framed.freeze())
}

/// Decode one peer message from a complete frame payload.
///
/// # Errors
/// Returns a wire error on malformed input or trailing garbage.
pub fn decode_payload(payload: &[u8]) -> Result<PeerMessage> {
    let mut buf = payload;
    let msg = PeerMessage::decode(&mut buf)?;
    if buf.has_remaining() {
        return Err(Error::wire(format!("{} trailing bytes after message", buf.remaining())));
    }
    Ok(msg)
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::wire(format!(
            "truncated input: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Append a LEB128-encoded unsigned integer.
pub fn put_varint<B: BufMut>(buf: &mut B, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Consume a LEB128-encoded unsigned integer.
///
/// # Errors
/// Returns a wire error on truncation or overflow.
pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        ensure(buf, 1)?;
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::wire("varint exceeds 64 bits"));
        }
    }
}

fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str<B: Buf>(buf: &mut B) -> Result<String> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| Error::wire(format!("invalid UTF-8 string: {e}")))
}

/// Read an element count, guarding against counts larger than the remaining
/// input could possibly encode (each element takes at least one byte).
fn get_count<B: Buf>(buf: &mut B) -> Result<usize> {
    ensure(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    if count > buf.remaining() {
        return Err(Error::wire(format!("element count {count} exceeds remaining input")));
    }
    Ok(count)
}

impl Encode for PeerId {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_str(buf, self.as_str());
    }
}

impl Decode for PeerId {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self::from(get_str(buf)?))
    }
}

impl Encode for Topic {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_str(buf, self.as_str());
    }
}

impl Decode for Topic {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        Self::new(get_str(buf)?)
    }
}

impl Encode for Filter {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.len() as u32);
        for topic in self.iter() {
            topic.encode(buf);
        }
    }
}

impl Decode for Filter {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = get_count(buf)?;
        let mut filter = Self::new();
        for _ in 0..count {
            filter.insert(Topic::decode(buf)?);
        }
        Ok(filter)
    }
}

fn put_vec<B: BufMut, T: Encode>(buf: &mut B, items: &[T]) {
    buf.put_u32_le(items.len() as u32);
    for item in items {
        item.encode(buf);
    }
}

fn get_vec<B: Buf, T: Decode>(buf: &mut B) -> Result<Vec<T>> {
    let count = get_count(buf)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(T::decode(buf)?);
    }
    Ok(items)
}

fn put_address<B: BufMut>(buf: &mut B, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        },
        IpAddr::V6(v6) => {
            buf.put_u8(6);
            buf.put_slice(&v6.octets());
        },
    }
}

fn get_address<B: Buf>(buf: &mut B) -> Result<IpAddr> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        4 => {
            ensure(buf, 4)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::from(octets))
        },
        6 => {
            ensure(buf, 16)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Ok(IpAddr::from(octets))
        },
        family => Err(Error::wire(format!("unknown address family tag {family}"))),
    }
}

fn put_timestamp<B: BufMut>(buf: &mut B, ts: &DateTime<Utc>) {
    // Out-of-range timestamps (beyond the year 2262) saturate.
    buf.put_i64_le(ts.timestamp_nanos_opt().unwrap_or(i64::MAX));
}

fn get_timestamp<B: Buf>(buf: &mut B) -> Result<DateTime<Utc>> {
    ensure(buf, 8)?;
    Ok(DateTime::from_timestamp_nanos(buf.get_i64_le()))
}

impl Encode for Timespan {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.as_nanos());
    }
}

impl Decode for Timespan {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 8)?;
        Ok(Self::from_nanos(buf.get_i64_le()))
    }
}

fn put_expiry<B: BufMut>(buf: &mut B, expiry: Option<Timespan>) {
    match expiry {
        Some(span) => {
            buf.put_u8(1);
            span.encode(buf);
        },
        None => buf.put_u8(0),
    }
}

fn get_expiry<B: Buf>(buf: &mut B) -> Result<Option<Timespan>> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => Ok(Some(Timespan::decode(buf)?)),
        tag => Err(Error::wire(format!("invalid optional tag {tag}"))),
    }
}

impl Encode for Data {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.tag());
        match self {
            Self::Nil => {},
            Self::Bool(x) => buf.put_u8(u8::from(*x)),
            Self::Count(x) => buf.put_u64_le(*x),
            Self::Integer(x) => buf.put_i64_le(*x),
            Self::Real(x) => buf.put_f64_le(*x),
            Self::Str(x) => put_str(buf, x),
            Self::Address(x) => put_address(buf, x),
            Self::Subnet(x) => {
                put_address(buf, &x.address);
                buf.put_u8(x.length);
            },
            Self::Port(x) => {
                buf.put_u16_le(x.number);
                buf.put_u8(x.protocol.tag());
            },
            Self::Timestamp(x) => put_timestamp(buf, x),
            Self::Timespan(x) => x.encode(buf),
            Self::Enum(x) => put_str(buf, x),
            Self::Vector(xs) => put_vec(buf, xs),
            Self::Set(xs) => {
                buf.put_u32_le(xs.len() as u32);
                for x in xs {
                    x.encode(buf);
                }
            },
            Self::Table(xs) => {
                buf.put_u32_le(xs.len() as u32);
                for (k, v) in xs {
                    k.encode(buf);
                    v.encode(buf);
                }
            },
        }
    }
}

impl Decode for Data {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 1)?;
        let tag = buf.get_u8();
        let value = match tag {
            0 => Self::Nil,
            1 => {
                ensure(buf, 1)?;
                Self::Bool(buf.get_u8() != 0)
            },
            2 => {
                ensure(buf, 8)?;
                Self::Count(buf.get_u64_le())
            },
            3 => {
                ensure(buf, 8)?;
                Self::Integer(buf.get_i64_le())
            },
            4 => {
                ensure(buf, 8)?;
                Self::Real(buf.get_f64_le())
            },
            5 => Self::Str(get_str(buf)?),
            6 => Self::Address(get_address(buf)?),
            7 => {
                let address = get_address(buf)?;
                ensure(buf, 1)?;
                Self::Subnet(Subnet { address, length: buf.get_u8() })
            },
            8 => {
                ensure(buf, 3)?;
                let number = buf.get_u16_le();
                let proto = buf.get_u8();
                let protocol = Protocol::from_tag(proto)
                    .ok_or_else(|| Error::wire(format!("unknown protocol tag {proto}")))?;
                Self::Port(Port { number, protocol })
            },
            9 => Self::Timestamp(get_timestamp(buf)?),
            10 => Self::Timespan(Timespan::decode(buf)?),
            11 => Self::Enum(get_str(buf)?),
            12 => Self::Vector(get_vec(buf)?),
            13 => {
                let count = get_count(buf)?;
                let mut set = BTreeSet::new();
                for _ in 0..count {
                    set.insert(Self::decode(buf)?);
                }
                Self::Set(set)
            },
            14 => {
                let count = get_count(buf)?;
                let mut table = BTreeMap::new();
                for _ in 0..count {
                    let key = Self::decode(buf)?;
                    let value = Self::decode(buf)?;
                    table.insert(key, value);
                }
                Self::Table(table)
            },
            _ => return Err(Error::wire(format!("unknown data tag {tag}"))),
        };
        Ok(value)
    }
}

impl Encode for Command {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Put { key, value, expiry } => {
                buf.put_u8(0);
                key.encode(buf);
                value.encode(buf);
                put_expiry(buf, *expiry);
            },
            Self::PutUnique { key, value, expiry, who, req } => {
                buf.put_u8(1);
                key.encode(buf);
                value.encode(buf);
                put_expiry(buf, *expiry);
                who.encode(buf);
                buf.put_u64_le(*req);
            },
            Self::PutUniqueResult { req, inserted } => {
                buf.put_u8(2);
                buf.put_u64_le(*req);
                buf.put_u8(u8::from(*inserted));
            },
            Self::Erase { key } => {
                buf.put_u8(3);
                key.encode(buf);
            },
            Self::Add { key, delta } => {
                buf.put_u8(4);
                key.encode(buf);
                delta.encode(buf);
            },
            Self::Subtract { key, delta } => {
                buf.put_u8(5);
                key.encode(buf);
                delta.encode(buf);
            },
            Self::Set { entries } => {
                buf.put_u8(6);
                buf.put_u32_le(entries.len() as u32);
                for (k, v) in entries {
                    k.encode(buf);
                    v.encode(buf);
                }
            },
            Self::Clear => buf.put_u8(7),
            Self::Snapshot { requester } => {
                buf.put_u8(8);
                requester.encode(buf);
            },
        }
    }
}

impl Decode for Command {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 1)?;
        let tag = buf.get_u8();
        let command = match tag {
            0 => Self::Put {
                key: Data::decode(buf)?,
                value: Data::decode(buf)?,
                expiry: get_expiry(buf)?,
            },
            1 => {
                let key = Data::decode(buf)?;
                let value = Data::decode(buf)?;
                let expiry = get_expiry(buf)?;
                let who = PeerId::decode(buf)?;
                ensure(buf, 8)?;
                Self::PutUnique { key, value, expiry, who, req: buf.get_u64_le() }
            },
            2 => {
                ensure(buf, 9)?;
                let req = buf.get_u64_le();
                Self::PutUniqueResult { req, inserted: buf.get_u8() != 0 }
            },
            3 => Self::Erase { key: Data::decode(buf)? },
            4 => Self::Add { key: Data::decode(buf)?, delta: Data::decode(buf)? },
            5 => Self::Subtract { key: Data::decode(buf)?, delta: Data::decode(buf)? },
            6 => {
                let count = get_count(buf)?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = Data::decode(buf)?;
                    let value = Data::decode(buf)?;
                    entries.insert(key, value);
                }
                Self::Set { entries }
            },
            7 => Self::Clear,
            8 => Self::Snapshot { requester: PeerId::decode(buf)? },
            _ => return Err(Error::wire(format!("unknown command tag {tag}"))),
        };
        Ok(command)
    }
}

impl Encode for NodeContent {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Data(m) => {
                buf.put_u8(0);
                m.topic.encode(buf);
                m.data.encode(buf);
            },
            Self::Command(m) => {
                buf.put_u8(1);
                m.topic.encode(buf);
                m.command.encode(buf);
            },
        }
    }
}

impl Decode for NodeContent {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            0 => {
                let topic = Topic::decode(buf)?;
                let data = Data::decode(buf)?;
                Ok(Self::Data(DataMessage { topic, data }))
            },
            1 => {
                let topic = Topic::decode(buf)?;
                let command = Command::decode(buf)?;
                Ok(Self::Command(CommandMessage { topic, command }))
            },
            tag => Err(Error::wire(format!("unknown content tag {tag}"))),
        }
    }
}

impl Encode for NodeMessage {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.content.encode(buf);
        buf.put_u16_le(self.ttl);
        put_vec(buf, &self.receivers);
    }
}

impl Decode for NodeMessage {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let content = NodeContent::decode(buf)?;
        ensure(buf, 2)?;
        let ttl = buf.get_u16_le();
        let receivers = get_vec(buf)?;
        Ok(Self { content, ttl, receivers })
    }
}

impl Encode for SubscriptionUpdate {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        put_vec(buf, &self.path);
        self.filter.encode(buf);
        buf.put_u64_le(self.ts);
    }
}

impl Decode for SubscriptionUpdate {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let path = get_vec(buf)?;
        let filter = Filter::decode(buf)?;
        ensure(buf, 8)?;
        let ts = buf.get_u64_le();
        Ok(Self { path, filter, ts })
    }
}

impl Encode for PeerMessage {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Hello(id) => {
                buf.put_u8(0);
                id.encode(buf);
            },
            Self::Subscription(update) => {
                buf.put_u8(1);
                update.encode(buf);
            },
            Self::Publication(msg) => {
                buf.put_u8(2);
                msg.encode(buf);
            },
        }
    }
}

impl Decode for PeerMessage {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            0 => Ok(Self::Hello(PeerId::decode(buf)?)),
            1 => Ok(Self::Subscription(SubscriptionUpdate::decode(buf)?)),
            2 => Ok(Self::Publication(NodeMessage::decode(buf)?)),
            tag => Err(Error::wire(format!("unknown peer message tag {tag}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: &T) {
        let bytes = to_bytes(value);
        let mut buf = bytes.as_ref();
        let decoded = T::decode(&mut buf).expect("decode");
        assert_eq!(&decoded, value);
        assert!(!buf.has_remaining(), "decoder left trailing bytes");
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            let mut cursor = buf.as_ref();
            assert_eq!(get_varint(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn test_varint_rejects_overlong_input() {
        let overlong = [0xffu8; 11];
        let mut cursor = overlong.as_ref();
        assert!(get_varint(&mut cursor).is_err());
    }

    #[test]
    fn test_data_roundtrips() {
        let table = Data::Table(
            [(Data::from("k"), Data::Vector(vec![Data::Count(1), Data::Nil]))].into(),
        );
        let values = [
            Data::Nil,
            Data::Bool(true),
            Data::Count(42),
            Data::Integer(-7),
            Data::Real(3.25),
            Data::from("hello"),
            Data::Address("192.168.1.1".parse().unwrap()),
            Data::Address("::1".parse().unwrap()),
            Data::Subnet(Subnet { address: "10.0.0.0".parse().unwrap(), length: 8 }),
            Data::Port(Port { number: 443, protocol: Protocol::Tcp }),
            Data::Timestamp(DateTime::from_timestamp_nanos(1_700_000_000_000_000_000)),
            Data::Timespan(Timespan::from_secs(5)),
            Data::Enum("state::active".to_string()),
            Data::Set([Data::from("a"), Data::from("b")].into()),
            table,
        ];
        for value in &values {
            roundtrip(value);
        }
    }

    #[test]
    fn test_command_roundtrips() {
        let commands = [
            Command::Put { key: Data::from("k"), value: Data::Count(1), expiry: None },
            Command::PutUnique {
                key: Data::from("k"),
                value: Data::Count(1),
                expiry: Some(Timespan::from_secs(30)),
                who: PeerId::from("ep"),
                req: 9,
            },
            Command::PutUniqueResult { req: 9, inserted: true },
            Command::Erase { key: Data::from("k") },
            Command::Add { key: Data::from("n"), delta: Data::Count(2) },
            Command::Subtract { key: Data::from("n"), delta: Data::Count(1) },
            Command::Set { entries: [(Data::from("a"), Data::Nil)].into() },
            Command::Clear,
            Command::Snapshot { requester: PeerId::from("ep") },
        ];
        for command in &commands {
            roundtrip(command);
        }
    }

    #[test]
    fn test_peer_message_roundtrips() {
        let sub = PeerMessage::Subscription(SubscriptionUpdate {
            path: vec![PeerId::from("a"), PeerId::from("b")],
            filter: Filter::from_topics([Topic::new("t/1").unwrap()]),
            ts: 3,
        });
        roundtrip(&sub);

        let publication = PeerMessage::Publication(NodeMessage::new(
            NodeContent::Data(DataMessage::new(Topic::new("t/1").unwrap(), "ping")),
            16,
            vec![PeerId::from("b")],
        ));
        roundtrip(&publication);
        roundtrip(&PeerMessage::Hello(PeerId::from("a")));
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let bytes = to_bytes(&Data::from("hello world"));
        for cut in 0..bytes.len() {
            let mut buf = &bytes[..cut];
            assert!(Data::decode(&mut buf).is_err(), "cut at {cut} should fail");
        }
    }

    #[test]
    fn test_unknown_tags_are_rejected() {
        let mut buf: &[u8] = &[0xee];
        assert!(Data::decode(&mut buf).is_err());
        let mut buf: &[u8] = &[0xee];
        assert!(PeerMessage::decode(&mut buf).is_err());
    }

    #[test]
    fn test_absurd_count_is_rejected() {
        // Claims u32::MAX strings but carries no bytes for them.
        let mut raw = BytesMut::new();
        raw.put_u8(12); // vector tag
        raw.put_u32_le(u32::MAX);
        let mut buf = raw.as_ref();
        assert!(Data::decode(&mut buf).is_err());
    }

    #[test]
    fn test_frame_respects_size_limit() {
        let msg = PeerMessage::Hello(PeerId::from("some-endpoint"));
        let framed = frame(&msg, 1024).unwrap();
        assert_eq!(
            framed.len(),
            FRAME_HEADER_LEN + u32::from_le_bytes(framed[..4].try_into().unwrap()) as usize
        );
        assert_eq!(decode_payload(&framed[FRAME_HEADER_LEN..]).unwrap(), msg);
        assert!(matches!(frame(&msg, 4), Err(Error::FrameTooLarge { .. })));
    }
}
