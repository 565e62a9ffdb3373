// Stream discovery over UDP
//
// Every transport owns one discovery socket. Local outlets are re-advertised at a
// fixed interval to the multicast group and to any known unicast peers, so entries
// of crashed producers simply stop being refreshed and expire from remote indexes.
// A resolve sends queries while it waits; peers answer with unicast advertisements
// of their matching outlets.

use crate::config::TransportConfig;
use crate::error::{LslError, LslResult};
use crate::predicate::Predicate;
use crate::types::StreamDescriptor;
use crate::wire::{Datagram, MAX_DATAGRAM_LEN};
use parking_lot::RwLock;
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A descriptor together with the endpoint its outlet accepts connections on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedStream {
    pub descriptor: StreamDescriptor,
    pub endpoint: SocketAddr,
}

/// How long a resolve may wait for matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveTimeout {
    After(Duration),
    /// Wait until enough streams appear. This can hang indefinitely when no
    /// matching producer ever shows up; only a cancellation token ends it.
    Forever,
}

impl ResolveTimeout {
    /// Seconds as a timeout; non-finite or negative values mean `Forever`
    ///
    /// Values too large for a `Duration` also mean `Forever`.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs < 0.0 {
            return ResolveTimeout::Forever;
        }
        Duration::try_from_secs_f64(secs).map_or(ResolveTimeout::Forever, ResolveTimeout::After)
    }

    /// `None` when there is no deadline, including timeouts past the clock's range
    fn deadline(self, start: Instant) -> Option<Instant> {
        match self {
            ResolveTimeout::After(timeout) => start.checked_add(timeout),
            ResolveTimeout::Forever => None,
        }
    }
}

impl From<Duration> for ResolveTimeout {
    fn from(timeout: Duration) -> Self {
        ResolveTimeout::After(timeout)
    }
}

struct IndexEntry {
    stream: ResolvedStream,
    last_seen: Instant,
    local: bool,
}

/// Known streams, keyed by descriptor uid
///
/// Remote entries expire when not refreshed within the liveness window; entries
/// of outlets owned by this transport stay until they are withdrawn.
#[derive(Clone)]
pub struct DiscoveryIndex {
    entries: Arc<RwLock<HashMap<String, IndexEntry>>>,
    updated: Arc<Notify>,
    liveness: Duration,
}

impl DiscoveryIndex {
    pub fn new(liveness: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            updated: Arc::new(Notify::new()),
            liveness,
        }
    }

    /// Insert or refresh an entry. Returns true if the uid was not known yet.
    pub fn upsert(&self, stream: ResolvedStream, local: bool) -> bool {
        let uid = stream.descriptor.uid().to_string();
        let inserted = {
            let mut entries = self.entries.write();
            let inserted = !entries.contains_key(&uid);
            entries.insert(
                uid,
                IndexEntry {
                    stream,
                    last_seen: Instant::now(),
                    local,
                },
            );
            inserted
        };

        self.updated.notify_waiters();
        inserted
    }

    pub fn remove(&self, uid: &str) -> Option<ResolvedStream> {
        self.entries.write().remove(uid).map(|entry| entry.stream)
    }

    /// Every known stream matching the predicate, ordered by name then uid
    pub fn matching(&self, predicate: &Predicate) -> Vec<ResolvedStream> {
        let mut found: Vec<ResolvedStream> = self
            .entries
            .read()
            .values()
            .filter(|entry| predicate.matches(&entry.stream.descriptor))
            .map(|entry| entry.stream.clone())
            .collect();
        found.sort_by(|a, b| {
            a.descriptor
                .name()
                .cmp(b.descriptor.name())
                .then_with(|| a.descriptor.uid().cmp(b.descriptor.uid()))
        });
        found
    }

    pub fn all(&self) -> Vec<ResolvedStream> {
        self.matching(&Predicate::any())
    }

    /// Drop remote entries not refreshed within the liveness window
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|uid, entry| {
            let alive = entry.local || now.duration_since(entry.last_seen) < self.liveness;
            if !alive {
                debug!("Discovery entry {} ({}) expired", entry.stream.descriptor.name(), uid);
            }
            alive
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

struct Shared {
    socket: UdpSocket,
    index: DiscoveryIndex,
    /// Outlets of this transport, as advertised on the network
    local: RwLock<HashMap<String, ResolvedStream>>,
    targets: Vec<SocketAddr>,
    config: Arc<TransportConfig>,
}

impl Shared {
    async fn send_to_all(&self, datagram: &Datagram) {
        if self.targets.is_empty() {
            return;
        }
        let bytes = match datagram.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode discovery datagram: {}", e);
                return;
            }
        };
        for target in &self.targets {
            if let Err(e) = self.socket.send_to(&bytes, target).await {
                warn!("Failed to send discovery datagram to {}: {}", target, e);
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let datagram = match Datagram::decode(datagram) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", from, e);
                return;
            }
        };

        match datagram {
            Datagram::Advertise {
                mut endpoint,
                descriptor,
            } => {
                if self.local.read().contains_key(descriptor.uid()) {
                    return;
                }
                if endpoint.ip().is_unspecified() {
                    endpoint.set_ip(from.ip());
                }
                let name = descriptor.name().to_string();
                if self.index.upsert(ResolvedStream { descriptor, endpoint }, false) {
                    info!("Discovered stream '{}' at {}", name, endpoint);
                }
            }
            Datagram::Query { predicate } => {
                let predicate = match Predicate::parse(&predicate) {
                    Ok(predicate) => predicate,
                    Err(e) => {
                        debug!("Ignoring query from {}: {}", from, e);
                        return;
                    }
                };
                let replies: Vec<Datagram> = self
                    .local
                    .read()
                    .values()
                    .filter(|stream| predicate.matches(&stream.descriptor))
                    .map(|stream| Datagram::Advertise {
                        endpoint: stream.endpoint,
                        descriptor: stream.descriptor.clone(),
                    })
                    .collect();

                let destinations = reply_targets(from, &self.config);
                for reply in replies {
                    let bytes = match reply.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("Failed to encode advertisement: {}", e);
                            continue;
                        }
                    };
                    for target in &destinations {
                        if let Err(e) = self.socket.send_to(&bytes, target).await {
                            debug!("Failed to answer query from {} via {}: {}", from, target, e);
                        }
                    }
                }
            }
        }
    }
}

/// Destinations for the answers to a query sent from `from`
///
/// Every socket sharing the discovery port joins the group, but a unicast
/// datagram is delivered to only one of them. Answers go to both.
fn reply_targets(from: SocketAddr, config: &TransportConfig) -> Vec<SocketAddr> {
    let mut targets = vec![from];
    if let Some(group) = config.multicast_target() {
        if group != from {
            targets.push(group);
        }
    }
    targets
}

/// Discovery service of one transport
pub struct DiscoveryService {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl DiscoveryService {
    /// Bind the discovery socket and start the listener, re-advertiser and expiry tasks
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(config: Arc<TransportConfig>) -> LslResult<Arc<Self>> {
        let std_socket = bind_socket(&config)?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| LslError::resource("register discovery socket", e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| LslError::resource("discovery socket address", e))?;

        let shared = Arc::new(Shared {
            socket,
            index: DiscoveryIndex::new(config.liveness_window),
            local: RwLock::new(HashMap::new()),
            targets: config.discovery_targets(),
            config,
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(listen(shared.clone(), shutdown.clone()));
        tokio::spawn(readvertise(shared.clone(), shutdown.clone()));
        tokio::spawn(expire(shared.clone(), shutdown.clone()));

        info!(
            "Discovery listening on {} (targets: {:?})",
            local_addr, shared.targets
        );

        Ok(Arc::new(Self {
            shared,
            local_addr,
            shutdown,
        }))
    }

    /// Announce a local outlet now and on every re-advertisement tick
    pub async fn advertise(&self, stream: ResolvedStream) {
        let uid = stream.descriptor.uid().to_string();
        self.shared.local.write().insert(uid, stream.clone());

        let mut reachable = stream.clone();
        if reachable.endpoint.ip().is_unspecified() {
            reachable.endpoint.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        self.shared.index.upsert(reachable, true);

        self.shared
            .send_to_all(&Datagram::Advertise {
                endpoint: stream.endpoint,
                descriptor: stream.descriptor,
            })
            .await;
    }

    /// Stop advertising a local outlet. Remote indexes forget it after the liveness window.
    pub fn withdraw(&self, uid: &str) {
        self.shared.local.write().remove(uid);
        self.shared.index.remove(uid);
    }

    /// Wait until at least `min_count` streams match `predicate` or the timeout elapses
    ///
    /// Returns whatever matched by then, so an empty list means nothing was found.
    /// Cancelling `cancel` ends the wait with `LslError::Cancelled`.
    pub async fn resolve(
        &self,
        predicate: &Predicate,
        min_count: usize,
        timeout: ResolveTimeout,
        cancel: &CancellationToken,
    ) -> LslResult<Vec<ResolvedStream>> {
        if timeout == ResolveTimeout::Forever {
            warn!(
                "Waiting without timeout for streams matching \"{}\"; this blocks until one appears or the wait is cancelled",
                predicate
            );
        }

        let start = Instant::now();
        let deadline = timeout.deadline(start);
        let query = Datagram::Query {
            predicate: predicate.as_str().to_string(),
        };
        let mut next_query = start;

        loop {
            let updated = self.shared.index.updated.notified();
            tokio::pin!(updated);
            updated.as_mut().enable();

            let found = self.shared.index.matching(predicate);
            if found.len() >= min_count {
                debug!("Resolved {} stream(s) for \"{}\"", found.len(), predicate);
                return Ok(found);
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                debug!(
                    "Resolve for \"{}\" timed out with {} of {} stream(s)",
                    predicate,
                    found.len(),
                    min_count
                );
                return Ok(found);
            }
            if now >= next_query {
                self.shared.send_to_all(&query).await;
                next_query = now + self.shared.config.query_interval;
            }

            let until_deadline = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(LslError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(LslError::Closed),
                _ = &mut updated => {}
                _ = tokio::time::sleep_until(next_query) => {}
                _ = until_deadline => {}
            }
        }
    }

    /// Address of the discovery socket (what peers list in `known_peers`)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn index(&self) -> &DiscoveryIndex {
        &self.shared.index
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Stop all background tasks. Pending resolves end with `LslError::Closed`.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Discovery on {} shutting down", self.local_addr);
            self.shutdown.cancel();
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn resource(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> LslError {
    let context = context.into();
    move |e| LslError::resource(context, e)
}

fn bind_socket(config: &TransportConfig) -> LslResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(resource("create discovery socket"))?;
    socket
        .set_reuse_address(true)
        .map_err(resource("set SO_REUSEADDR"))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(resource("set SO_REUSEPORT"))?;
    socket
        .set_nonblocking(true)
        .map_err(resource("set non-blocking"))?;

    let bind_addr = SocketAddr::from((config.bind_addr, config.discovery_port));
    socket
        .bind(&bind_addr.into())
        .map_err(resource(format!("bind discovery socket to {}", bind_addr)))?;

    if config.multicast_enabled {
        socket
            .set_multicast_ttl_v4(config.multicast_ttl)
            .map_err(resource("set multicast TTL"))?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(resource("enable multicast loopback"))?;
        join_multicast(&socket, config.multicast_group);
    }

    Ok(socket.into())
}

/// Join the group on every IPv4 interface; failures are logged, not fatal
fn join_multicast(socket: &Socket, group: Ipv4Addr) {
    let interfaces: Vec<Ipv4Addr> = if_addrs::get_if_addrs()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|iface| match iface.addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();

    let mut joined = 0;
    for interface in &interfaces {
        match socket.join_multicast_v4(&group, interface) {
            Ok(()) => joined += 1,
            Err(e) => warn!("Failed to join {} on {}: {}", group, interface, e),
        }
    }

    if joined == 0 {
        if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            warn!("Failed to join multicast group {}: {}", group, e);
        }
    }
}

async fn listen(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => shared.handle_datagram(&buf[..len], from).await,
                Err(e) => {
                    // ICMP port-unreachable from a vanished peer surfaces here on some platforms
                    debug!("Discovery receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
    debug!("Discovery listener stopped");
}

async fn readvertise(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.advertise_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let advertisements: Vec<Datagram> = shared
                    .local
                    .read()
                    .values()
                    .map(|stream| Datagram::Advertise {
                        endpoint: stream.endpoint,
                        descriptor: stream.descriptor.clone(),
                    })
                    .collect();
                for advertisement in &advertisements {
                    shared.send_to_all(advertisement).await;
                }
            }
        }
    }
}

async fn expire(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.liveness_window / 2);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = shared.index.expire();
                if expired > 0 {
                    info!("Expired {} stale stream(s)", expired);
                }
            }
        }
    }
}
