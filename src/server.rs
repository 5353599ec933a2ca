// src/server.rs
//! Protocol engine: the top-level dispatcher.
//!
//! Receives inbound datagrams on one connectionless port, classifies
//! them (ChannelData, STUN request, indication), authenticates requests
//! under the long-term credential mechanism, and drives the allocation
//! table, registries and relay data path. The engine itself holds no
//! per-exchange state between datagrams; client state is implicit in
//! allocation existence.
//!
//! Each datagram is handled in its own task; all shared tables are
//! concurrent and no lock is held across socket I/O. Per-datagram
//! failures are answered or dropped, never fatal — only failing to bind
//! the configured port aborts startup.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::allocation::{AllocationTable, ClientId};
use crate::auth::{self, Credential, NonceManager};
use crate::config::RelayConfig;
use crate::error::{AllocationError, AuthError, RelayError, RelayResult, StunError};
use crate::relay;
use crate::stun::{
    integrity, split_type, Attribute, Message, MessageClass, Method, TransactionId, HEADER_SIZE,
};

/// Transport code for UDP in REQUESTED-TRANSPORT
const TRANSPORT_UDP: u8 = 17;

/// A request that passed the long-term credential gate
struct AuthedRequest {
    username: String,
    key: [u8; 16],
}

/// The relay engine bound to its listening socket
pub struct RelayServer {
    config: Arc<RelayConfig>,
    socket: Arc<UdpSocket>,
    table: Arc<AllocationTable>,
    nonces: NonceManager,
}

impl RelayServer {
    /// Bind the configured port. This is the only fatal failure path;
    /// everything after startup is handled per-datagram.
    pub async fn new(config: RelayConfig) -> RelayResult<Self> {
        let bind_ip: IpAddr = match config.public_ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, config.port)).await?;
        let nonces = NonceManager::new(config.nonce_lifetime);
        let config = Arc::new(config);
        Ok(Self {
            table: Arc::new(AllocationTable::new(config.clone())),
            socket: Arc::new(socket),
            nonces,
            config,
        })
    }

    /// Actual bound address (useful when the configured port is 0)
    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The allocation table (diagnostics and embedding)
    pub fn allocations(&self) -> &Arc<AllocationTable> {
        &self.table
    }

    /// Issue a time-limited credential pair for `identity`.
    ///
    /// This is the inbound entry point for the signaling collaborator;
    /// no protocol envelope is involved and nothing is stored.
    pub fn issue_credential(&self, identity: &str, ttl: Duration) -> Credential {
        auth::issue(identity, &self.config.shared_secret, ttl, SystemTime::now())
    }

    /// Receive loop. Runs until the socket fails.
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        info!(
            "TURN relay listening on {} (realm {})",
            self.socket.local_addr()?,
            self.config.realm
        );
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            let data = Bytes::copy_from_slice(&buf[..len]);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_datagram(&data, src).await;
            });
        }
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        if relay::is_channel_data(data) {
            self.handle_channel_data(data, src).await;
            return;
        }

        let msg = match Message::decode(data) {
            Ok(msg) => msg,
            Err(StunError::UnknownComprehensionRequired(types)) => {
                self.reject_unknown_attributes(data, types, src).await;
                return;
            }
            Err(e) => {
                // Garbage gets silence, not an error response
                trace!("dropping undecodable datagram from {}: {}", src, e);
                return;
            }
        };

        match (msg.class, msg.method) {
            (MessageClass::Request, Method::Binding) => self.handle_binding(&msg, src).await,
            (MessageClass::Indication, Method::Send) => {
                self.handle_send_indication(&msg, src).await
            }
            (MessageClass::Request, _) => self.handle_request(msg, data, src).await,
            (class, method) => {
                trace!("ignoring {:?} {:?} from {}", class, method, src);
            }
        }
    }

    /// STUN Binding needs no authentication; the original server
    /// answers it alongside TURN so clients can discover their
    /// server-reflexive address on the same port.
    async fn handle_binding(&self, msg: &Message, src: SocketAddr) {
        let mut resp = Message::success_for(msg);
        resp.add(Attribute::XorMappedAddress(src));
        self.send_message(resp, None, src).await;
    }

    async fn handle_request(&self, msg: Message, raw: &[u8], src: SocketAddr) {
        let auth = match self.authenticate(&msg, raw, src) {
            Ok(auth) => auth,
            Err(err) => {
                let (code, reason) = match err {
                    AuthError::StaleNonce => (438, "Stale Nonce"),
                    _ => (401, "Unauthorized"),
                };
                debug!("{} from {} rejected: {}", reason, src, err);
                let mut resp = Message::error_for(&msg, code, reason);
                resp.add(Attribute::Realm(self.config.realm.clone()));
                resp.add(Attribute::Nonce(self.nonces.generate(src.ip())));
                self.send_message(resp, None, src).await;
                return;
            }
        };

        let result = match msg.method {
            Method::Allocate => self.handle_allocate(&msg, src, &auth).await,
            Method::Refresh => self.handle_refresh(&msg, src),
            Method::CreatePermission => self.handle_create_permission(&msg, src),
            Method::ChannelBind => self.handle_channel_bind(&msg, src),
            // Send/Data are indications; as requests they are malformed
            method => Err(StunError::UnexpectedRequestMethod(method.code()).into()),
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                let (code, reason) = error_code(&err);
                warn!("{:?} from {} failed: {} ({})", msg.method, src, err, code);
                Message::error_for(&msg, code, reason)
            }
        };
        self.send_message(resp, Some(auth.key.as_slice()), src).await;
    }

    /// Long-term credential gate: integrity-protected request carrying
    /// username, realm and a nonce this server issued for this client.
    fn authenticate(
        &self,
        msg: &Message,
        raw: &[u8],
        src: SocketAddr,
    ) -> Result<AuthedRequest, AuthError> {
        if !msg.has_integrity() {
            return Err(AuthError::MissingCredentials);
        }
        let username = msg.username().ok_or(AuthError::MissingCredentials)?.to_string();
        let realm = msg.realm().ok_or(AuthError::MissingCredentials)?;
        let nonce = msg.nonce().ok_or(AuthError::MissingCredentials)?;

        if realm != self.config.realm {
            return Err(AuthError::RealmMismatch);
        }
        self.nonces.validate(nonce, src.ip())?;

        // The password is derivable from the shared secret, so the key
        // can be recomputed without a user database.
        let password = auth::password_for(&username, &self.config.shared_secret);
        let key = integrity::long_term_key(&username, realm, &password);
        integrity::verify(raw, &key)?;
        auth::check_expiry(&username, SystemTime::now())?;

        Ok(AuthedRequest { username, key })
    }

    async fn handle_allocate(
        &self,
        msg: &Message,
        src: SocketAddr,
        auth: &AuthedRequest,
    ) -> RelayResult<Message> {
        match msg.requested_transport() {
            Some(TRANSPORT_UDP) => {}
            Some(other) => return Err(AllocationError::UnsupportedTransport(other).into()),
            None => return Err(StunError::MissingAttribute("REQUESTED-TRANSPORT").into()),
        }

        let client = ClientId::udp(src);
        let requested = msg.lifetime().map(|secs| Duration::from_secs(secs.into()));
        let (allocation, lifetime) = self
            .table
            .allocate(client, auth.username.clone(), requested)
            .await?;
        allocation.attach_task(relay::spawn_receive_loop(
            allocation.clone(),
            self.socket.clone(),
        ));

        let mut resp = Message::success_for(msg);
        resp.add(Attribute::XorRelayedAddress(allocation.relay_addr));
        resp.add(Attribute::Lifetime(lifetime.as_secs() as u32));
        resp.add(Attribute::XorMappedAddress(src));
        Ok(resp)
    }

    fn handle_refresh(&self, msg: &Message, src: SocketAddr) -> RelayResult<Message> {
        let requested = msg.lifetime().map(|secs| Duration::from_secs(secs.into()));
        let granted = self.table.refresh(ClientId::udp(src), requested)?;

        let mut resp = Message::success_for(msg);
        resp.add(Attribute::Lifetime(granted.as_secs() as u32));
        Ok(resp)
    }

    fn handle_create_permission(&self, msg: &Message, src: SocketAddr) -> RelayResult<Message> {
        let allocation = self
            .table
            .lookup_by_client(&ClientId::udp(src))
            .ok_or(AllocationError::NotFound)?;

        let peers = msg.peer_addresses();
        if peers.is_empty() {
            return Err(StunError::MissingAttribute("XOR-PEER-ADDRESS").into());
        }
        for peer in peers {
            allocation.registry.authorize(peer.ip());
            debug!("permission for {} on {}", peer.ip(), allocation.relay_addr);
        }
        Ok(Message::success_for(msg))
    }

    fn handle_channel_bind(&self, msg: &Message, src: SocketAddr) -> RelayResult<Message> {
        let allocation = self
            .table
            .lookup_by_client(&ClientId::udp(src))
            .ok_or(AllocationError::NotFound)?;

        let number = msg
            .channel_number()
            .ok_or(StunError::MissingAttribute("CHANNEL-NUMBER"))?;
        let peer = msg
            .peer_addresses()
            .first()
            .copied()
            .ok_or(StunError::MissingAttribute("XOR-PEER-ADDRESS"))?;

        allocation.registry.bind_channel(number, peer)?;
        Ok(Message::success_for(msg))
    }

    /// Send indications carry no authentication; permissions, which
    /// were installed under authentication, gate the actual forward.
    async fn handle_send_indication(&self, msg: &Message, src: SocketAddr) {
        let Some(allocation) = self.table.lookup_by_client(&ClientId::udp(src)) else {
            trace!("send indication from {} without allocation", src);
            return;
        };
        let Some(peer) = msg.peer_addresses().first().copied() else {
            return;
        };
        let Some(data) = msg.data() else {
            return;
        };
        relay::send(&allocation, peer, data).await;
    }

    /// ChannelData is forwarded without authentication; the binding
    /// itself was established under authentication.
    async fn handle_channel_data(&self, data: &[u8], src: SocketAddr) {
        let Some(allocation) = self.table.lookup_by_client(&ClientId::udp(src)) else {
            trace!("ChannelData from {} without allocation", src);
            return;
        };
        let (number, payload) = match relay::decode_channel_data(data) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("dropping malformed ChannelData from {}: {}", src, e);
                return;
            }
        };
        let Some(peer) = allocation.registry.peer_for_channel(number) else {
            trace!("ChannelData on unbound channel 0x{:04X} from {}", number, src);
            return;
        };
        relay::send(&allocation, peer, payload).await;
    }

    /// A request with attributes we must understand but do not gets a
    /// 420 naming them, so the client can retry without the attribute.
    async fn reject_unknown_attributes(&self, raw: &[u8], types: Vec<u16>, src: SocketAddr) {
        if raw.len() < HEADER_SIZE {
            return;
        }
        let type_raw = u16::from_be_bytes([raw[0], raw[1]]);
        let (method_code, class) = split_type(type_raw);
        if class != MessageClass::Request {
            return;
        }
        let Some(method) = Method::from_code(method_code) else {
            return;
        };
        let mut tid = [0u8; 12];
        tid.copy_from_slice(&raw[8..HEADER_SIZE]);
        let req = Message::new(method, class, TransactionId::from_bytes(tid));

        let mut resp = Message::error_for(&req, 420, "Unknown Attribute");
        resp.add(Attribute::UnknownAttributes(types));
        self.send_message(resp, None, src).await;
    }

    async fn send_message(&self, mut msg: Message, key: Option<&[u8]>, dst: SocketAddr) {
        if let Some(software) = &self.config.software {
            msg.add(Attribute::Software(software.clone()));
        }
        let bytes = msg.encode(key, false);
        if let Err(e) = self.socket.send_to(&bytes, dst).await {
            warn!("send to {} failed: {}", dst, e);
        }
    }
}

/// Map module errors to protocol error codes. Nothing here is silently
/// swallowed: every dispatch failure becomes an error response.
fn error_code(err: &RelayError) -> (u16, &'static str) {
    match err {
        RelayError::Allocation(AllocationError::AlreadyAllocated)
        | RelayError::Allocation(AllocationError::NotFound) => (437, "Allocation Mismatch"),
        RelayError::Allocation(AllocationError::PortsExhausted) => (508, "Insufficient Capacity"),
        RelayError::Allocation(AllocationError::UnsupportedTransport(_)) => {
            (442, "Unsupported Transport Protocol")
        }
        RelayError::Allocation(AllocationError::InvalidChannelNumber(_))
        | RelayError::Allocation(AllocationError::ChannelInUse(_))
        | RelayError::Allocation(AllocationError::PeerAlreadyBound(_)) => (400, "Bad Request"),
        RelayError::Stun(StunError::MissingAttribute(_))
        | RelayError::Stun(StunError::UnexpectedRequestMethod(_)) => (400, "Bad Request"),
        RelayError::Stun(StunError::UnknownComprehensionRequired(_)) => (420, "Unknown Attribute"),
        RelayError::Auth(_) => (401, "Unauthorized"),
        _ => (500, "Server Error"),
    }
}
