use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Top-level error type for the relay engine
#[derive(Debug, Error)]
pub enum RelayError {
    /// STUN framing errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Authentication failures
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Allocation state errors
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Framing errors raised by the message codec.
///
/// A datagram that fails to decode is dropped without a response; these
/// errors never reach the wire.
#[derive(Debug, Error)]
pub enum StunError {
    /// Buffer shorter than the fixed header
    #[error("message too short: {0} bytes")]
    TooShort(usize),

    /// Magic cookie mismatch
    #[error("invalid magic cookie: expected 0x2112A442, got 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Leading two bits of the message type must be zero
    #[error("invalid message type bits: 0x{0:04X}")]
    InvalidTypeBits(u16),

    /// Header length field disagrees with the buffer
    #[error("length mismatch: header says {declared}, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Method outside the supported set
    #[error("unknown method: 0x{0:03X}")]
    UnknownMethod(u16),

    /// Attribute value failed to parse
    #[error("failed to parse attribute 0x{attr_type:04X}: {reason}")]
    AttributeParse { attr_type: u16, reason: String },

    /// A required attribute was absent from a request
    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// Comprehension-required attributes the codec does not know
    #[error("unknown comprehension-required attributes: {0:04X?}")]
    UnknownComprehensionRequired(Vec<u16>),

    /// Request carried a method that is only valid as an indication
    #[error("method 0x{0:03X} is not a request method")]
    UnexpectedRequestMethod(u16),

    /// Address attribute with an unsupported family byte
    #[error("invalid address family: 0x{0:02X}")]
    InvalidAddressFamily(u8),

    /// Malformed ChannelData frame
    #[error("invalid ChannelData frame: {0}")]
    InvalidChannelData(&'static str),
}

/// Authentication failures under the long-term credential mechanism
#[derive(Debug, Error)]
pub enum AuthError {
    /// Request carried no credentials at all; answered with a challenge
    #[error("no credentials present")]
    MissingCredentials,

    /// Username does not follow the expiry:identity form
    #[error("malformed username")]
    MalformedUsername,

    /// Credential was valid once but its embedded expiry has passed
    #[error("credential expired")]
    Expired,

    /// Password recomputation does not match
    #[error("credential digest mismatch")]
    Forged,

    /// Realm in the request does not match the server realm
    #[error("realm mismatch")]
    RealmMismatch,

    /// MESSAGE-INTEGRITY digest did not verify
    #[error("MESSAGE-INTEGRITY check failed")]
    BadIntegrity,

    /// Nonce was issued by this server but has aged out
    #[error("stale nonce")]
    StaleNonce,

    /// Nonce was not issued by this server
    #[error("invalid nonce")]
    InvalidNonce,
}

/// Errors from the allocation table and the permission/channel registry
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Client identity already owns a live allocation
    #[error("client already has a live allocation")]
    AlreadyAllocated,

    /// No allocation exists for the client identity
    #[error("no allocation for client")]
    NotFound,

    /// Relay port pool is empty
    #[error("relay port pool exhausted")]
    PortsExhausted,

    /// REQUESTED-TRANSPORT other than UDP
    #[error("unsupported transport protocol: {0}")]
    UnsupportedTransport(u8),

    /// Channel number outside 0x4000..=0x7FFF
    #[error("channel number 0x{0:04X} out of range")]
    InvalidChannelNumber(u16),

    /// Channel number already bound to a different peer
    #[error("channel 0x{0:04X} already bound to another peer")]
    ChannelInUse(u16),

    /// Peer already bound to a different channel number
    #[error("peer {0} already bound to another channel")]
    PeerAlreadyBound(SocketAddr),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
