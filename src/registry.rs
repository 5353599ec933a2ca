// src/registry.rs
//! Per-allocation permission and channel-binding registry.
//!
//! Permissions authorize one peer IP (port-independent) for data
//! exchange; channel bindings add a compact numeric alias for one peer
//! address. Both carry their own deadline and expire independently.
//! Deadlines are checked at use, so an expired entry denies traffic
//! even before the periodic sweep removes it.
//!
//! Refresh-on-data applies to outbound traffic only: a client send
//! refreshes the peer's permission, inbound peer traffic never does —
//! a silent peer cannot keep itself authorized.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::AllocationError;

/// Inclusive channel number range (RFC 5766 Section 11)
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

#[derive(Debug)]
struct ChannelBinding {
    peer: SocketAddr,
    deadline: Instant,
}

/// Authorization state scoped to one allocation
#[derive(Debug)]
pub struct PeerRegistry {
    /// Peer IP -> permission deadline
    permissions: DashMap<IpAddr, Instant>,
    /// Channel number -> binding
    channels: DashMap<u16, ChannelBinding>,
    /// Peer address -> channel number, kept consistent with `channels`
    peer_channels: DashMap<SocketAddr, u16>,
    /// Serializes multi-map channel updates
    bind_lock: Mutex<()>,
    permission_lifetime: Duration,
    channel_lifetime: Duration,
}

impl PeerRegistry {
    pub fn new(permission_lifetime: Duration, channel_lifetime: Duration) -> Self {
        Self {
            permissions: DashMap::new(),
            channels: DashMap::new(),
            peer_channels: DashMap::new(),
            bind_lock: Mutex::new(()),
            permission_lifetime,
            channel_lifetime,
        }
    }

    /// Install or refresh a permission for a peer IP. Idempotent.
    pub fn authorize(&self, peer_ip: IpAddr) {
        self.permissions.insert(peer_ip, Instant::now() + self.permission_lifetime);
    }

    /// Extend an existing permission without installing a new one.
    ///
    /// Called on outbound sends; a send to a peer with no permission
    /// must not create one.
    pub fn refresh_permission(&self, peer_ip: IpAddr) {
        if let Some(mut deadline) = self.permissions.get_mut(&peer_ip) {
            *deadline = Instant::now() + self.permission_lifetime;
        }
    }

    /// Whether data may be exchanged with `peer` right now.
    ///
    /// True if the peer's IP holds a live permission, or the peer
    /// address has a live channel binding (a binding implies permission
    /// for its peer as long as it lives).
    pub fn is_authorized(&self, peer: SocketAddr) -> bool {
        let now = Instant::now();
        if let Some(deadline) = self.permissions.get(&peer.ip()) {
            if *deadline > now {
                return true;
            }
        }
        if let Some(number) = self.peer_channels.get(&peer) {
            if let Some(binding) = self.channels.get(&*number) {
                return binding.deadline > now;
            }
        }
        false
    }

    /// Bind `number` to `peer`, or refresh an identical existing
    /// binding. Implicitly installs a permission for the peer's IP.
    pub fn bind_channel(&self, number: u16, peer: SocketAddr) -> Result<(), AllocationError> {
        if !(MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&number) {
            return Err(AllocationError::InvalidChannelNumber(number));
        }

        let _guard = self.bind_lock.lock();

        if let Some(existing) = self.channels.get(&number) {
            if existing.peer != peer {
                return Err(AllocationError::ChannelInUse(number));
            }
        }
        if let Some(bound) = self.peer_channels.get(&peer) {
            if *bound != number {
                return Err(AllocationError::PeerAlreadyBound(peer));
            }
        }

        let deadline = Instant::now() + self.channel_lifetime;
        self.channels.insert(number, ChannelBinding { peer, deadline });
        self.peer_channels.insert(peer, number);
        drop(_guard);

        self.authorize(peer.ip());
        debug!("bound channel 0x{:04X} to {}", number, peer);
        Ok(())
    }

    /// Live channel number bound to `peer`, if any
    pub fn channel_for_peer(&self, peer: SocketAddr) -> Option<u16> {
        let number = *self.peer_channels.get(&peer)?;
        let binding = self.channels.get(&number)?;
        (binding.deadline > Instant::now()).then_some(number)
    }

    /// Peer bound to a live channel `number`, if any
    pub fn peer_for_channel(&self, number: u16) -> Option<SocketAddr> {
        let binding = self.channels.get(&number)?;
        (binding.deadline > Instant::now()).then_some(binding.peer)
    }

    /// Number of live permissions (diagnostics)
    pub fn permission_count(&self) -> usize {
        let now = Instant::now();
        self.permissions.iter().filter(|e| *e.value() > now).count()
    }

    /// Drop expired permissions and channel bindings
    pub fn sweep(&self) {
        let now = Instant::now();
        self.permissions.retain(|_, deadline| *deadline > now);

        let _guard = self.bind_lock.lock();
        let mut dead_peers = Vec::new();
        self.channels.retain(|_, binding| {
            let live = binding.deadline > now;
            if !live {
                dead_peers.push(binding.peer);
            }
            live
        });
        for peer in dead_peers {
            self.peer_channels.remove(&peer);
        }
    }
}
