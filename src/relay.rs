// src/relay.rs
//! Relay data path: moves datagrams between a client and its permitted
//! peers through the allocation's dedicated relay endpoint.
//!
//! Unauthorized traffic is dropped silently in both directions — never
//! queued and never answered with an error, so the relay cannot be used
//! as an amplification vector or a liveness oracle.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::allocation::Allocation;
use crate::error::StunError;
use crate::registry::{MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};
use crate::stun::{Attribute, Message, Method};

/// ChannelData header: channel number + payload length
pub const CHANNEL_DATA_HEADER: usize = 4;

/// Send `payload` from the allocation's relay endpoint to `peer`.
///
/// Silently dropped when the peer is not authorized. An authorized
/// outbound send refreshes the peer's permission.
pub async fn send(allocation: &Allocation, peer: SocketAddr, payload: &[u8]) {
    if !allocation.registry.is_authorized(peer) {
        trace!("dropping send to unauthorized peer {} ({})", peer, allocation.client);
        return;
    }
    allocation.registry.refresh_permission(peer.ip());
    if let Err(e) = allocation.relay_socket().send_to(payload, peer).await {
        warn!("relay send to {} failed: {}", peer, e);
    }
}

/// Spawn the allocation's relay receive loop.
///
/// Reads the dedicated relay socket for as long as the allocation
/// lives; each datagram from an authorized sender is re-wrapped toward
/// the owning client — as ChannelData when the sender has a bound
/// channel, as a Data indication otherwise — and sent on the server
/// socket. Datagrams from unauthorized senders are dropped.
pub fn spawn_receive_loop(
    allocation: Arc<Allocation>,
    server_socket: Arc<UdpSocket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, sender) = match allocation.relay_socket().recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("relay socket error for {}: {}", allocation.client, e);
                    return;
                }
            };
            let payload = &buf[..len];

            if !allocation.registry.is_authorized(sender) {
                trace!("dropping inbound data from unauthorized {}", sender);
                continue;
            }

            let framed = match allocation.registry.channel_for_peer(sender) {
                Some(number) => encode_channel_data(number, payload),
                None => {
                    let mut indication = Message::indication(Method::Data);
                    indication.add(Attribute::XorPeerAddress(sender));
                    indication.add(Attribute::Data(Bytes::copy_from_slice(payload)));
                    indication.encode(None, false)
                }
            };

            if let Err(e) = server_socket.send_to(&framed, allocation.client.addr).await {
                warn!("forward to client {} failed: {}", allocation.client, e);
            }
        }
    })
}

/// Whether a datagram is ChannelData rather than a STUN message
pub fn is_channel_data(data: &[u8]) -> bool {
    !data.is_empty() && (0x40..=0x7F).contains(&data[0])
}

/// Frame a payload with the 4-byte ChannelData header
pub fn encode_channel_data(number: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHANNEL_DATA_HEADER + payload.len());
    buf.put_u16(number);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a ChannelData frame into channel number and payload.
///
/// Trailing padding beyond the declared length is tolerated (TCP
/// framings pad to 4 bytes; UDP senders do not have to).
pub fn decode_channel_data(data: &[u8]) -> Result<(u16, &[u8]), StunError> {
    if data.len() < CHANNEL_DATA_HEADER {
        return Err(StunError::InvalidChannelData("frame shorter than header"));
    }
    let mut header = &data[..CHANNEL_DATA_HEADER];
    let number = header.get_u16();
    let length = header.get_u16() as usize;
    if !(MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&number) {
        return Err(StunError::InvalidChannelData("channel number out of range"));
    }
    let body = &data[CHANNEL_DATA_HEADER..];
    if body.len() < length {
        return Err(StunError::InvalidChannelData("truncated payload"));
    }
    Ok((number, &body[..length]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_data_round_trip() {
        let framed = encode_channel_data(0x4001, b"hello");
        assert!(is_channel_data(&framed));
        let (number, payload) = decode_channel_data(&framed).unwrap();
        assert_eq!(number, 0x4001);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn channel_data_tolerates_trailing_padding() {
        let mut framed = encode_channel_data(0x7FFF, b"abc").to_vec();
        framed.push(0);
        let (_, payload) = decode_channel_data(&framed).unwrap();
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn channel_data_rejects_garbage() {
        assert!(decode_channel_data(&[0x40]).is_err());
        // Declared length longer than the buffer
        assert!(decode_channel_data(&[0x40, 0x00, 0x00, 0x09, 0x01]).is_err());
        // Number outside the channel range
        assert!(decode_channel_data(&[0x20, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn stun_header_is_not_channel_data() {
        // STUN message types start with the two top bits clear (0x00..0x3F)
        assert!(!is_channel_data(&[0x00, 0x01]));
        assert!(!is_channel_data(&[0x01, 0x13]));
        assert!(!is_channel_data(&[]));
    }
}
