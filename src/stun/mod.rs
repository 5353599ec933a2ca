// src/stun/mod.rs
//! STUN message codec for the relay engine.
//!
//! Parses and serializes the binary envelope (RFC 5389) and the TURN
//! attributes (RFC 5766) the engine speaks. Decoding a datagram that is
//! not STUN yields a [`StunError`]; the engine drops such datagrams
//! silently. Integrity protection lives in [`integrity`].

pub mod integrity;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::StunError;

/// STUN magic cookie (RFC 5389 Section 6)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Fixed STUN header size
pub const HEADER_SIZE: usize = 20;

/// XOR constant applied to the FINGERPRINT CRC
const FINGERPRINT_XOR: u32 = 0x5354554E;

/// Methods supported by the engine.
///
/// The set is closed on purpose: dispatch over it is exhaustive, so a
/// new method cannot be added without handling it everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
}

impl Method {
    /// 12-bit method code
    pub fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
        }
    }

    /// Method for a 12-bit code, if supported
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x001 => Some(Method::Binding),
            0x003 => Some(Method::Allocate),
            0x004 => Some(Method::Refresh),
            0x006 => Some(Method::Send),
            0x007 => Some(Method::Data),
            0x008 => Some(Method::CreatePermission),
            0x009 => Some(Method::ChannelBind),
            _ => None,
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::SuccessResponse => 0x0100,
            MessageClass::ErrorResponse => 0x0110,
        }
    }

    pub(crate) fn from_bits(bits: u16) -> Self {
        match bits & 0x0110 {
            0x0000 => MessageClass::Request,
            0x0010 => MessageClass::Indication,
            0x0100 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }
}

/// 96-bit transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a random transaction ID from the OS RNG
    pub fn random() -> Self {
        let mut id = [0u8; 12];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Typed STUN attribute.
///
/// Comprehension-optional attributes the codec does not model are
/// skipped on decode; comprehension-required ones are collected and
/// reported as [`StunError::UnknownComprehensionRequired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    XorMappedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(String),
    MessageIntegrity([u8; 20]),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    Lifetime(u32),
    RequestedTransport(u8),
    ChannelNumber(u16),
    Data(Bytes),
    DontFragment,
    Software(String),
    Fingerprint(u32),
}

impl Attribute {
    /// Wire type code
    pub fn type_code(&self) -> u16 {
        match self {
            Attribute::XorMappedAddress(_) => 0x0020,
            Attribute::XorPeerAddress(_) => 0x0012,
            Attribute::XorRelayedAddress(_) => 0x0016,
            Attribute::Username(_) => 0x0006,
            Attribute::Realm(_) => 0x0014,
            Attribute::Nonce(_) => 0x0015,
            Attribute::MessageIntegrity(_) => 0x0008,
            Attribute::ErrorCode { .. } => 0x0009,
            Attribute::UnknownAttributes(_) => 0x000A,
            Attribute::Lifetime(_) => 0x000D,
            Attribute::RequestedTransport(_) => 0x0019,
            Attribute::ChannelNumber(_) => 0x000C,
            Attribute::Data(_) => 0x0013,
            Attribute::DontFragment => 0x001A,
            Attribute::Software(_) => 0x8022,
            Attribute::Fingerprint(_) => 0x8028,
        }
    }

    fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) {
        let start = buf.len();
        buf.put_u16(self.type_code());
        buf.put_u16(0); // length, patched below

        match self {
            Attribute::XorMappedAddress(addr)
            | Attribute::XorPeerAddress(addr)
            | Attribute::XorRelayedAddress(addr) => encode_xor_address(buf, addr, tid),
            Attribute::Username(s) | Attribute::Realm(s) | Attribute::Nonce(s)
            | Attribute::Software(s) => buf.put_slice(s.as_bytes()),
            Attribute::MessageIntegrity(digest) => buf.put_slice(digest),
            Attribute::ErrorCode { code, reason } => {
                buf.put_u16(0);
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            Attribute::UnknownAttributes(types) => {
                for t in types {
                    buf.put_u16(*t);
                }
            }
            Attribute::Lifetime(secs) => buf.put_u32(*secs),
            Attribute::RequestedTransport(proto) => {
                buf.put_u8(*proto);
                buf.put_slice(&[0u8; 3]);
            }
            Attribute::ChannelNumber(number) => {
                buf.put_u16(*number);
                buf.put_u16(0);
            }
            Attribute::Data(payload) => buf.put_slice(payload),
            Attribute::DontFragment => {}
            Attribute::Fingerprint(crc) => buf.put_u32(*crc),
        }

        let value_len = buf.len() - start - 4;
        buf[start + 2..start + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        // Pad to 4-byte alignment
        let padding = (4 - (value_len % 4)) % 4;
        buf.put_bytes(0, padding);
    }

    /// Decode one attribute value. Returns `Ok(None)` for types the
    /// codec does not model.
    fn decode(
        type_raw: u16,
        value: &[u8],
        tid: &TransactionId,
    ) -> Result<Option<Self>, StunError> {
        let parse_err = |reason: &str| StunError::AttributeParse {
            attr_type: type_raw,
            reason: reason.to_string(),
        };
        let utf8 = |value: &[u8]| {
            String::from_utf8(value.to_vec()).map_err(|_| parse_err("invalid UTF-8"))
        };

        let attr = match type_raw {
            0x0020 => Attribute::XorMappedAddress(decode_xor_address(value, tid)?),
            0x0012 => Attribute::XorPeerAddress(decode_xor_address(value, tid)?),
            0x0016 => Attribute::XorRelayedAddress(decode_xor_address(value, tid)?),
            0x0006 => Attribute::Username(utf8(value)?),
            0x0014 => Attribute::Realm(utf8(value)?),
            0x0015 => Attribute::Nonce(utf8(value)?),
            0x8022 => Attribute::Software(utf8(value)?),
            0x0008 => {
                let digest: [u8; 20] = value
                    .try_into()
                    .map_err(|_| parse_err("MESSAGE-INTEGRITY must be 20 bytes"))?;
                Attribute::MessageIntegrity(digest)
            }
            0x0009 => {
                if value.len() < 4 {
                    return Err(parse_err("ERROR-CODE too short"));
                }
                let code = (value[2] as u16) * 100 + value[3] as u16;
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Attribute::ErrorCode { code, reason }
            }
            0x000A => {
                let types = value.chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Attribute::UnknownAttributes(types)
            }
            0x000D => {
                let secs: [u8; 4] = value
                    .try_into()
                    .map_err(|_| parse_err("LIFETIME must be 4 bytes"))?;
                Attribute::Lifetime(u32::from_be_bytes(secs))
            }
            0x0019 => {
                if value.len() != 4 {
                    return Err(parse_err("REQUESTED-TRANSPORT must be 4 bytes"));
                }
                Attribute::RequestedTransport(value[0])
            }
            0x000C => {
                if value.len() != 4 {
                    return Err(parse_err("CHANNEL-NUMBER must be 4 bytes"));
                }
                Attribute::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            0x0013 => Attribute::Data(Bytes::copy_from_slice(value)),
            0x001A => Attribute::DontFragment,
            0x8028 => {
                let crc: [u8; 4] = value
                    .try_into()
                    .map_err(|_| parse_err("FINGERPRINT must be 4 bytes"))?;
                Attribute::Fingerprint(u32::from_be_bytes(crc))
            }
            _ => return Ok(None),
        };
        Ok(Some(attr))
    }
}

/// A decoded protocol unit: method, class, transaction ID and an
/// ordered attribute list.
#[derive(Debug, Clone)]
pub struct Message {
    pub method: Method,
    pub class: MessageClass,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// New message with an explicit transaction ID
    pub fn new(method: Method, class: MessageClass, transaction_id: TransactionId) -> Self {
        Self { method, class, transaction_id, attributes: Vec::new() }
    }

    /// New request with a random transaction ID
    pub fn request(method: Method) -> Self {
        Self::new(method, MessageClass::Request, TransactionId::random())
    }

    /// New indication with a random transaction ID
    pub fn indication(method: Method) -> Self {
        Self::new(method, MessageClass::Indication, TransactionId::random())
    }

    /// Success response echoing a request's transaction ID
    pub fn success_for(request: &Message) -> Self {
        Self::new(request.method, MessageClass::SuccessResponse, request.transaction_id)
    }

    /// Error response echoing a request's transaction ID
    pub fn error_for(request: &Message, code: u16, reason: &str) -> Self {
        let mut msg = Self::new(request.method, MessageClass::ErrorResponse, request.transaction_id);
        msg.add(Attribute::ErrorCode { code, reason: reason.to_string() });
        msg
    }

    /// Append an attribute
    pub fn add(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// First USERNAME attribute
    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(u) => Some(u.as_str()),
            _ => None,
        })
    }

    /// First REALM attribute
    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(r) => Some(r.as_str()),
            _ => None,
        })
    }

    /// First NONCE attribute
    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// Whether a MESSAGE-INTEGRITY attribute is present
    pub fn has_integrity(&self) -> bool {
        self.attributes.iter().any(|a| matches!(a, Attribute::MessageIntegrity(_)))
    }

    /// First LIFETIME attribute, as a number of seconds
    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    /// First REQUESTED-TRANSPORT attribute
    pub fn requested_transport(&self) -> Option<u8> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::RequestedTransport(p) => Some(*p),
            _ => None,
        })
    }

    /// First CHANNEL-NUMBER attribute
    pub fn channel_number(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ChannelNumber(n) => Some(*n),
            _ => None,
        })
    }

    /// All XOR-PEER-ADDRESS attributes, in order
    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes.iter().filter_map(|a| match a {
            Attribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        }).collect()
    }

    /// First XOR-RELAYED-ADDRESS attribute
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// First XOR-MAPPED-ADDRESS attribute
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// First DATA attribute
    pub fn data(&self) -> Option<&Bytes> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(payload) => Some(payload),
            _ => None,
        })
    }

    /// ERROR-CODE attribute, if present
    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }

    /// Encode to wire format.
    ///
    /// When `integrity_key` is given, a MESSAGE-INTEGRITY attribute
    /// (HMAC-SHA1 over everything before it, with the length field
    /// pre-adjusted) is appended; any MESSAGE-INTEGRITY or FINGERPRINT
    /// attribute already in the list is skipped so the digest is always
    /// freshly computed.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);

        let type_raw = method_class_to_raw(self.method, self.class);
        buf.put_u16(type_raw);
        buf.put_u16(0); // length, patched below
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            if matches!(attr, Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_)) {
                continue;
            }
            attr.encode(&mut buf, &self.transaction_id);
        }

        if let Some(key) = integrity_key {
            // Length must cover the integrity attribute itself
            let msg_len = buf.len() - HEADER_SIZE + 24;
            buf[2..4].copy_from_slice(&(msg_len as u16).to_be_bytes());

            let digest = integrity::compute(key, &buf);
            buf.put_u16(0x0008);
            buf.put_u16(20);
            buf.put_slice(&digest);
        }

        if fingerprint {
            let msg_len = buf.len() - HEADER_SIZE + 8;
            buf[2..4].copy_from_slice(&(msg_len as u16).to_be_bytes());

            let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
            let checksum = crc.checksum(&buf) ^ FINGERPRINT_XOR;
            buf.put_u16(0x8028);
            buf.put_u16(4);
            buf.put_u32(checksum);
        }

        let msg_len = buf.len() - HEADER_SIZE;
        buf[2..4].copy_from_slice(&(msg_len as u16).to_be_bytes());

        buf.freeze()
    }

    /// Decode from wire format
    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < HEADER_SIZE {
            return Err(StunError::TooShort(data.len()));
        }

        let mut buf = data;
        let type_raw = buf.get_u16();
        if type_raw & 0xC000 != 0 {
            return Err(StunError::InvalidTypeBits(type_raw));
        }
        let declared = buf.get_u16() as usize;
        let magic = buf.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic));
        }

        let mut tid_bytes = [0u8; 12];
        buf.copy_to_slice(&mut tid_bytes);
        let transaction_id = TransactionId::from_bytes(tid_bytes);

        if buf.remaining() != declared {
            return Err(StunError::LengthMismatch { declared, actual: buf.remaining() });
        }

        let (method_code, class) = split_type(type_raw);
        let method = Method::from_code(method_code)
            .ok_or(StunError::UnknownMethod(method_code))?;

        let mut attributes = Vec::new();
        let mut unknown_required = Vec::new();

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(StunError::AttributeParse {
                    attr_type: 0,
                    reason: "incomplete attribute header".to_string(),
                });
            }
            let attr_type = buf.get_u16();
            let attr_len = buf.get_u16() as usize;
            if buf.remaining() < attr_len {
                return Err(StunError::AttributeParse {
                    attr_type,
                    reason: "incomplete attribute value".to_string(),
                });
            }
            let value = &buf[..attr_len];
            match Attribute::decode(attr_type, value, &transaction_id)? {
                Some(attr) => attributes.push(attr),
                None if attr_type < 0x8000 => unknown_required.push(attr_type),
                None => {}
            }
            buf.advance(attr_len);

            let padding = (4 - (attr_len % 4)) % 4;
            if buf.remaining() < padding {
                return Err(StunError::AttributeParse {
                    attr_type,
                    reason: "truncated attribute padding".to_string(),
                });
            }
            buf.advance(padding);
        }

        if !unknown_required.is_empty() {
            return Err(StunError::UnknownComprehensionRequired(unknown_required));
        }

        Ok(Self { method, class, transaction_id, attributes })
    }
}

/// Split a raw message type into its 12-bit method code and class
pub(crate) fn split_type(type_raw: u16) -> (u16, MessageClass) {
    let method = (type_raw & 0x000F) | ((type_raw & 0x00E0) >> 1) | ((type_raw & 0x3E00) >> 2);
    (method, MessageClass::from_bits(type_raw))
}

fn method_class_to_raw(method: Method, class: MessageClass) -> u16 {
    let m = method.code();
    let m0 = m & 0x000F;
    let m1 = (m & 0x0070) << 1;
    let m2 = (m & 0x0F80) << 2;
    m0 | m1 | m2 | class.bits()
}

/// Encode an address XOR-ed with the magic cookie (and transaction ID
/// for the IPv6 tail), per RFC 5389 Section 15.2.
fn encode_xor_address(buf: &mut BytesMut, addr: &SocketAddr, tid: &TransactionId) {
    buf.put_u8(0);
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(xport);
            let octets = ip.octets();
            let magic = MAGIC_COOKIE.to_be_bytes();
            for i in 0..4 {
                buf.put_u8(octets[i] ^ magic[i]);
            }
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(xport);
            let octets = ip.octets();
            let magic = MAGIC_COOKIE.to_be_bytes();
            let tid_bytes = tid.as_bytes();
            for i in 0..4 {
                buf.put_u8(octets[i] ^ magic[i]);
            }
            for i in 0..12 {
                buf.put_u8(octets[i + 4] ^ tid_bytes[i]);
            }
        }
    }
}

fn decode_xor_address(value: &[u8], tid: &TransactionId) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::AttributeParse {
            attr_type: 0x0020,
            reason: "address attribute too short".to_string(),
        });
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let magic = MAGIC_COOKIE.to_be_bytes();

    match family {
        0x01 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            for i in 0..4 {
                octets[i] ^= magic[i];
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if value.len() < 20 {
                return Err(StunError::InvalidAddressFamily(family));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            let tid_bytes = tid.as_bytes();
            for i in 0..4 {
                octets[i] ^= magic[i];
            }
            for i in 0..12 {
                octets[i + 4] ^= tid_bytes[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(StunError::InvalidAddressFamily(family)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_allocate_request() {
        let mut msg = Message::request(Method::Allocate);
        msg.add(Attribute::RequestedTransport(17));
        msg.add(Attribute::Lifetime(600));
        msg.add(Attribute::Username("1700000000:alice".into()));
        msg.add(Attribute::Realm("turn-relay".into()));
        msg.add(Attribute::Software("test".into()));

        let encoded = msg.encode(None, false);
        let decoded = Message::decode(&encoded).unwrap();

        assert_eq!(decoded.method, Method::Allocate);
        assert_eq!(decoded.class, MessageClass::Request);
        assert_eq!(decoded.transaction_id, msg.transaction_id);
        assert_eq!(decoded.requested_transport(), Some(17));
        assert_eq!(decoded.lifetime(), Some(600));
        assert_eq!(decoded.username(), Some("1700000000:alice"));
        assert_eq!(decoded.realm(), Some("turn-relay"));
    }

    #[test]
    fn round_trip_xor_addresses() {
        for addr in ["192.0.2.15:3739", "[2001:db8::1]:61000"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut msg = Message::indication(Method::Data);
            msg.add(Attribute::XorPeerAddress(addr));
            let decoded = Message::decode(&msg.encode(None, false)).unwrap();
            assert_eq!(decoded.peer_addresses(), vec![addr]);
        }
    }

    #[test]
    fn error_response_echoes_transaction_id() {
        let req = Message::request(Method::Refresh);
        let resp = Message::error_for(&req, 437, "Allocation Mismatch");
        let decoded = Message::decode(&resp.encode(None, false)).unwrap();
        assert_eq!(decoded.transaction_id, req.transaction_id);
        assert_eq!(decoded.class, MessageClass::ErrorResponse);
        assert_eq!(decoded.error_code(), Some(437));
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(matches!(Message::decode(&[0u8; 10]), Err(StunError::TooShort(10))));
    }

    #[test]
    fn rejects_bad_magic_cookie() {
        let msg = Message::request(Method::Binding);
        let mut bytes = msg.encode(None, false).to_vec();
        bytes[4] ^= 0xFF;
        assert!(matches!(
            Message::decode(&bytes),
            Err(StunError::InvalidMagicCookie(_))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let msg = Message::request(Method::Binding);
        let mut bytes = msg.encode(None, false).to_vec();
        bytes[3] = bytes[3].wrapping_add(8);
        assert!(matches!(
            Message::decode(&bytes),
            Err(StunError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_unknown_comprehension_required() {
        let msg = Message::request(Method::Allocate);
        let mut bytes = BytesMut::from(&msg.encode(None, false)[..]);
        // Append a fabricated comprehension-required attribute (0x7FFF)
        bytes.put_u16(0x7FFF);
        bytes.put_u16(0);
        let len = bytes.len() - HEADER_SIZE;
        bytes[2..4].copy_from_slice(&(len as u16).to_be_bytes());

        match Message::decode(&bytes) {
            Err(StunError::UnknownComprehensionRequired(types)) => {
                assert_eq!(types, vec![0x7FFF]);
            }
            other => panic!("expected unknown-attribute rejection, got {:?}", other),
        }
    }

    #[test]
    fn skips_unknown_comprehension_optional() {
        let msg = Message::request(Method::Binding);
        let mut bytes = BytesMut::from(&msg.encode(None, false)[..]);
        bytes.put_u16(0xFF10);
        bytes.put_u16(2);
        bytes.put_u16(0xABCD);
        bytes.put_u16(0); // padding
        let len = bytes.len() - HEADER_SIZE;
        bytes[2..4].copy_from_slice(&(len as u16).to_be_bytes());

        let decoded = Message::decode(&bytes).unwrap();
        assert!(decoded.attributes.is_empty());
    }

    #[test]
    fn fingerprint_is_appended_last() {
        let mut msg = Message::request(Method::Binding);
        msg.add(Attribute::Software("fp".into()));
        let bytes = msg.encode(None, true);
        let decoded = Message::decode(&bytes).unwrap();
        assert!(matches!(decoded.attributes.last(), Some(Attribute::Fingerprint(_))));
    }
}
