// src/allocation.rs
//! Allocation table: the authoritative map from a client's transport
//! identity to its relay state.
//!
//! Each allocation exclusively owns one relay UDP socket drawn from a
//! configured port pool, its permission/channel registry, and a single
//! authoritative deadline. Expiry runs as a per-allocation task that
//! sleeps until the deadline and re-checks it at fire time, so an
//! accepted refresh always wins over a stale timer; when expiry does
//! commit, the allocation is removed atomically (`remove_if` under the
//! map's shard lock). The relay port returns to the pool only when the
//! last reference to the allocation drops and its socket closes, so a
//! pooled port is never handed out while the previous socket still
//! holds it.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{AllocationError, RelayError, RelayResult};
use crate::registry::PeerRegistry;

/// How often each allocation sweeps its expired permissions/bindings
const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Transport protocol of a client identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Client transport identity: protocol plus source address/port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub transport: Transport,
    pub addr: SocketAddr,
}

impl ClientId {
    /// UDP client identity
    pub fn udp(addr: SocketAddr) -> Self {
        Self { transport: Transport::Udp, addr }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.transport, self.addr)
    }
}

/// The live relay session for one authenticated client
pub struct Allocation {
    /// Owning client identity
    pub client: ClientId,
    /// Advertised relay transport address
    pub relay_addr: SocketAddr,
    /// Username the allocation was authenticated under
    pub username: String,
    /// Creation time
    pub created_at: Instant,
    /// Per-allocation permissions and channel bindings
    pub registry: PeerRegistry,
    relay_socket: Arc<UdpSocket>,
    ports: Arc<PortPool>,
    deadline: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Allocation {
    /// The relay endpoint owned by this allocation
    pub fn relay_socket(&self) -> &Arc<UdpSocket> {
        &self.relay_socket
    }

    /// Authoritative expiry deadline
    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = deadline;
    }

    /// Attach a background task to be aborted at teardown
    pub fn attach_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// The port goes back to the pool with the socket. Aborted background
/// tasks keep their `Arc<Allocation>` until the runtime drops their
/// futures, so releasing any earlier would hand out a port whose
/// socket is still bound.
impl Drop for Allocation {
    fn drop(&mut self) {
        self.ports.release(self.relay_addr.port());
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("client", &self.client)
            .field("relay_addr", &self.relay_addr)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Finite pool of relay ports. FIFO, so a released port sits at the
/// back of the queue and is not immediately rebound.
struct PortPool {
    free: Mutex<VecDeque<u16>>,
}

impl PortPool {
    fn new(range: (u16, u16)) -> Self {
        Self { free: Mutex::new((range.0..=range.1).collect()) }
    }

    fn acquire(&self) -> Option<u16> {
        self.free.lock().pop_front()
    }

    fn release(&self, port: u16) {
        self.free.lock().push_back(port);
    }

    fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// Authoritative owner of all allocations
pub struct AllocationTable {
    allocations: DashMap<ClientId, Arc<Allocation>>,
    /// Relay address -> client, maintained transactionally with
    /// `allocations`; inbound data may arrive addressed to either side
    relay_lookup: DashMap<SocketAddr, ClientId>,
    ports: Arc<PortPool>,
    config: Arc<RelayConfig>,
}

impl AllocationTable {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            allocations: DashMap::new(),
            relay_lookup: DashMap::new(),
            ports: Arc::new(PortPool::new(config.relay_ports)),
            config,
        }
    }

    /// Reserve a relay endpoint and create an allocation for `client`.
    ///
    /// `requested_lifetime` of `None` grants the configured default;
    /// anything else is capped at the configured maximum. The expiry
    /// timer starts immediately.
    pub async fn allocate(
        self: &Arc<Self>,
        client: ClientId,
        username: String,
        requested_lifetime: Option<Duration>,
    ) -> RelayResult<(Arc<Allocation>, Duration)> {
        if self.allocations.contains_key(&client) {
            return Err(AllocationError::AlreadyAllocated.into());
        }

        let (relay_socket, port) = self.bind_relay_socket().await?;
        let relay_addr = SocketAddr::new(self.config.public_ip, port);

        let lifetime = self.clamp_lifetime(requested_lifetime);
        let allocation = Arc::new(Allocation {
            client,
            relay_addr,
            username,
            created_at: Instant::now(),
            registry: PeerRegistry::new(
                self.config.permission_lifetime,
                self.config.channel_lifetime,
            ),
            relay_socket: Arc::new(relay_socket),
            ports: self.ports.clone(),
            deadline: Mutex::new(Instant::now() + lifetime),
            tasks: Mutex::new(Vec::new()),
        });

        match self.allocations.entry(client) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost a race with a concurrent allocate for the same
                // identity; dropping the allocation closes the socket
                // and returns the port.
                return Err(AllocationError::AlreadyAllocated.into());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(allocation.clone());
            }
        }
        self.relay_lookup.insert(relay_addr, client);

        allocation.attach_task(Self::spawn_expiry(self.clone(), client));
        allocation.attach_task(Self::spawn_registry_sweep(Arc::downgrade(&allocation)));

        info!(
            "allocated {} for {} (user {}, lifetime {:?})",
            relay_addr, client, allocation.username, lifetime
        );
        Ok((allocation, lifetime))
    }

    /// Extend an allocation's lifetime, or tear it down when the
    /// requested lifetime is zero. Returns the granted lifetime.
    pub fn refresh(
        &self,
        client: ClientId,
        requested_lifetime: Option<Duration>,
    ) -> RelayResult<Duration> {
        if requested_lifetime == Some(Duration::ZERO) {
            let allocation = self
                .remove(&client)
                .ok_or(AllocationError::NotFound)?;
            info!("deallocated {} for {} (client request)", allocation.relay_addr, client);
            return Ok(Duration::ZERO);
        }

        let allocation = self
            .allocations
            .get(&client)
            .ok_or(AllocationError::NotFound)?;
        let lifetime = self.clamp_lifetime(requested_lifetime);
        allocation.set_deadline(Instant::now() + lifetime);
        debug!("refreshed {} to {:?}", client, lifetime);
        Ok(lifetime)
    }

    /// O(1) lookup by client transport identity
    pub fn lookup_by_client(&self, client: &ClientId) -> Option<Arc<Allocation>> {
        self.allocations.get(client).map(|entry| entry.value().clone())
    }

    /// O(1) lookup by relay transport address
    pub fn lookup_by_relay(&self, relay_addr: &SocketAddr) -> Option<Arc<Allocation>> {
        let client = *self.relay_lookup.get(relay_addr)?;
        self.lookup_by_client(&client)
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Relay ports currently available
    pub fn available_ports(&self) -> usize {
        self.ports.available()
    }

    fn clamp_lifetime(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.config.default_lifetime,
            Some(d) => d.min(self.config.max_lifetime),
        }
    }

    /// Bind a relay socket on a pooled port.
    ///
    /// A port that is still in use (a closing socket, or taken by
    /// another process) is re-queued at the back of the pool; any other
    /// bind failure marks the port unusable and drops it. Each pooled
    /// port is tried at most once per call.
    async fn bind_relay_socket(&self) -> RelayResult<(UdpSocket, u16)> {
        let bind_ip: IpAddr = match self.config.public_ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let mut attempts = self.ports.available();
        while attempts > 0 {
            attempts -= 1;
            let port = self
                .ports
                .acquire()
                .ok_or::<RelayError>(AllocationError::PortsExhausted.into())?;
            match UdpSocket::bind(SocketAddr::new(bind_ip, port)).await {
                Ok(socket) => return Ok((socket, port)),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!("relay port {} busy, re-queueing", port);
                    self.ports.release(port);
                }
                Err(e) => {
                    warn!("relay port {} unusable, dropping from pool: {}", port, e);
                }
            }
        }
        Err(AllocationError::PortsExhausted.into())
    }

    /// Remove an allocation and release its resources. Used by both
    /// client-driven deallocation and committed expiry.
    fn remove(&self, client: &ClientId) -> Option<Arc<Allocation>> {
        let (_, allocation) = self.allocations.remove(client)?;
        self.finish_teardown(&allocation);
        Some(allocation)
    }

    /// Port release is not done here: it happens in [`Allocation`]'s
    /// `Drop`, once every holder of the allocation is gone.
    fn finish_teardown(&self, allocation: &Arc<Allocation>) {
        self.relay_lookup.remove(&allocation.relay_addr);
        allocation.shutdown();
    }

    /// Per-allocation expiry task: sleeps until the deadline, then
    /// re-checks it under the map's shard lock before deleting. A
    /// refresh that landed in between moves the deadline forward and
    /// the loop re-arms.
    fn spawn_expiry(table: Arc<Self>, client: ClientId) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let deadline = match table.allocations.get(&client) {
                    Some(allocation) => allocation.deadline(),
                    None => return,
                };
                sleep_until(deadline).await;

                let removed = table
                    .allocations
                    .remove_if(&client, |_, allocation| allocation.deadline() <= Instant::now());
                if let Some((_, allocation)) = removed {
                    info!("allocation {} expired ({})", allocation.relay_addr, client);
                    table.finish_teardown(&allocation);
                    return;
                }
                // Refreshed concurrently; loop picks up the new deadline
            }
        })
    }

    /// Holds only a weak reference so teardown drops the allocation
    /// (and closes its relay socket) without waiting for the sweeper.
    fn spawn_registry_sweep(allocation: Weak<Allocation>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(REGISTRY_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                match allocation.upgrade() {
                    Some(allocation) => allocation.registry.sweep(),
                    None => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn table_with_ports(relay_ports: (u16, u16)) -> Arc<AllocationTable> {
        let config = RelayConfig {
            relay_ports,
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            ..RelayConfig::default()
        };
        Arc::new(AllocationTable::new(Arc::new(config)))
    }

    fn client(port: u16) -> ClientId {
        ClientId::udp(SocketAddr::from(([192, 0, 2, 1], port)))
    }

    #[tokio::test]
    async fn allocate_then_lookup_both_directions() {
        let table = table_with_ports((51010, 51013));
        let id = client(4000);
        let (allocation, lifetime) = table
            .allocate(id, "user".into(), Some(Duration::from_secs(600)))
            .await
            .unwrap();

        assert_eq!(lifetime, Duration::from_secs(600));
        assert_eq!(table.lookup_by_client(&id).unwrap().relay_addr, allocation.relay_addr);
        let by_relay = table.lookup_by_relay(&allocation.relay_addr).unwrap();
        assert_eq!(by_relay.client, id);
    }

    #[tokio::test]
    async fn second_allocation_for_same_identity_fails() {
        let table = table_with_ports((51020, 51023));
        let id = client(4000);
        table.allocate(id, "user".into(), None).await.unwrap();

        let err = table.allocate(id, "user".into(), None).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Allocation(AllocationError::AlreadyAllocated)
        ));

        // Teardown frees the identity and the relay port
        table.refresh(id, Some(Duration::ZERO)).unwrap();
        assert!(table.lookup_by_client(&id).is_none());
        table.allocate(id, "user".into(), None).await.unwrap();
    }

    #[tokio::test]
    async fn pool_exhaustion_is_reported() {
        let table = table_with_ports((51030, 51031));
        table.allocate(client(1), "a".into(), None).await.unwrap();
        table.allocate(client(2), "b".into(), None).await.unwrap();

        let err = table.allocate(client(3), "c".into(), None).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Allocation(AllocationError::PortsExhausted)
        ));

        // Releasing one allocation makes room again
        table.refresh(client(1), Some(Duration::ZERO)).unwrap();
        table.allocate(client(3), "c".into(), None).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_missing_allocation_fails() {
        let table = table_with_ports((51040, 51041));
        assert!(matches!(
            table.refresh(client(9), None).unwrap_err(),
            RelayError::Allocation(AllocationError::NotFound)
        ));
        assert!(matches!(
            table.refresh(client(9), Some(Duration::ZERO)).unwrap_err(),
            RelayError::Allocation(AllocationError::NotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unrefreshed_allocation_expires_and_port_returns() {
        let table = table_with_ports((51050, 51050));
        let id = client(4000);
        table
            .allocate(id, "user".into(), Some(Duration::from_secs(600)))
            .await
            .unwrap();
        assert_eq!(table.available_ports(), 0);

        advance(Duration::from_secs(601)).await;
        // Let the expiry task run
        tokio::task::yield_now().await;

        assert!(table.lookup_by_client(&id).is_none());
        assert_eq!(table.available_ports(), 1);

        // The freed endpoint is available for a new allocation
        table.allocate(id, "user".into(), None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_before_deadline_wins_over_timer() {
        let table = table_with_ports((51060, 51060));
        let id = client(4000);
        table
            .allocate(id, "user".into(), Some(Duration::from_secs(600)))
            .await
            .unwrap();

        advance(Duration::from_secs(599)).await;
        table.refresh(id, Some(Duration::from_secs(600))).unwrap();

        advance(Duration::from_secs(300)).await;
        tokio::task::yield_now().await;
        assert!(table.lookup_by_client(&id).is_some());

        advance(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;
        assert!(table.lookup_by_client(&id).is_none());
    }

    #[tokio::test]
    async fn lifetime_is_capped_at_maximum() {
        let table = table_with_ports((51070, 51070));
        let (_, granted) = table
            .allocate(client(1), "user".into(), Some(Duration::from_secs(86_400)))
            .await
            .unwrap();
        assert_eq!(granted, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn concurrent_clients_leave_consistent_table() {
        let table = table_with_ports((51080, 51099));
        let mut handles = Vec::new();
        for i in 0..20u16 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let id = client(5000 + i);
                table.allocate(id, format!("user{i}"), None).await.unwrap();
                table.refresh(id, Some(Duration::from_secs(1200))).unwrap();
                if i % 2 == 0 {
                    table.refresh(id, Some(Duration::ZERO)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Odd identities stay, even ones were deallocated
        assert_eq!(table.len(), 10);
        for i in 0..20u16 {
            let present = table.lookup_by_client(&client(5000 + i)).is_some();
            assert_eq!(present, i % 2 == 1);
        }
        assert_eq!(table.available_ports(), 10);
    }

    #[tokio::test]
    async fn port_returns_once_socket_holder_is_gone() {
        let table = table_with_ports((51100, 51100));
        let id = client(4000);
        let (allocation, _) = table.allocate(id, "user".into(), None).await.unwrap();

        // A task parked on the relay socket keeps the allocation alive
        // past teardown, the way an aborted receive loop does.
        let holder = tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let _ = allocation.relay_socket().recv_from(&mut buf).await;
        });
        tokio::task::yield_now().await;

        table.refresh(id, Some(Duration::ZERO)).unwrap();
        // Socket still open, so the port must not be back yet
        assert_eq!(table.available_ports(), 0);

        holder.abort();
        let _ = holder.await;

        // Last holder dropped: socket closed, port restored, and the
        // identical request succeeds
        assert_eq!(table.available_ports(), 1);
        table.allocate(id, "user".into(), None).await.unwrap();
    }

    #[tokio::test]
    async fn busy_port_is_requeued_not_burned() {
        let table = table_with_ports((51110, 51110));
        let blocker = UdpSocket::bind("0.0.0.0:51110").await.unwrap();

        let err = table.allocate(client(1), "a".into(), None).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Allocation(AllocationError::PortsExhausted)
        ));
        // The busy port went back into the pool instead of being lost
        assert_eq!(table.available_ports(), 1);

        drop(blocker);
        table.allocate(client(1), "a".into(), None).await.unwrap();
    }
}
