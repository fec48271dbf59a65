// libp2p swarm setup: the running overlay node
//
// QUIC over UDP, so the single forwarded UDP port serves all overlay traffic.
// The swarm lives in its own task; `OverlayHandle` talks to it through a
// command channel.

use super::behaviour::{OverlayBehaviour, OverlayBehaviourEvent};
use super::{Overlay, OverlayError};
use crate::peer::{PeerAddress, PeerList};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::core::ConnectedPoint;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identify, identity::Keypair, kad, Multiaddr, PeerId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a single seed gets to complete the QUIC handshake
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands that can be sent to the swarm task
#[derive(Debug)]
pub enum OverlayCommand {
    /// Start listening on an address
    Listen {
        port: u16,
        addr: Multiaddr,
        reply: mpsc::Sender<Result<(), OverlayError>>,
    },
    /// Dial a seed whose peer id we do not know yet
    Dial {
        addr: Multiaddr,
        reply: mpsc::Sender<Result<(), OverlayError>>,
    },
    /// Snapshot the routing table
    KnownPeers { reply: mpsc::Sender<PeerList> },
    /// Shutdown the swarm
    Shutdown,
}

/// Handle to communicate with the running swarm task
#[derive(Clone)]
pub struct OverlayHandle {
    command_tx: mpsc::Sender<OverlayCommand>,
    listening: Arc<AtomicBool>,
    dial_timeout: Duration,
}

impl OverlayHandle {
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(mpsc::Sender<T>) -> OverlayCommand,
    ) -> Result<T, OverlayError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| OverlayError::Stopped)?;

        reply_rx.recv().await.ok_or(OverlayError::Stopped)
    }

    async fn dial(&self, seed: &PeerAddress) -> Result<(), OverlayError> {
        let addr = peer_to_multiaddr(seed);
        let attempt = self.request(|reply| OverlayCommand::Dial { addr, reply });

        match tokio::time::timeout(self.dial_timeout, attempt).await {
            Ok(result) => result?,
            Err(_) => Err(OverlayError::DialFailed {
                addr: seed.to_string(),
                reason: "timed out".to_string(),
            }),
        }
    }

    /// Shut down the swarm
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(OverlayCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }
}

#[async_trait]
impl Overlay for OverlayHandle {
    async fn listen(&self, port: u16) -> Result<(), OverlayError> {
        let addr: Multiaddr = Multiaddr::empty()
            .with(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Udp(port))
            .with(Protocol::QuicV1);
        self.request(|reply| OverlayCommand::Listen { port, addr, reply })
            .await?
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    async fn bootstrap(&self, seeds: &[PeerAddress]) -> Result<(), OverlayError> {
        let mut reached = 0usize;
        for seed in seeds {
            match self.dial(seed).await {
                Ok(()) => {
                    tracing::info!("Reached overlay seed {}", seed);
                    reached += 1;
                }
                Err(e) => tracing::debug!("Seed {} unreachable: {}", seed, e),
            }
        }

        if reached == 0 {
            return Err(OverlayError::NoReachableSeed);
        }
        Ok(())
    }

    async fn known_peers(&self) -> Result<PeerList, OverlayError> {
        if !self.is_listening() {
            return Err(OverlayError::NotListening);
        }
        self.request(|reply| OverlayCommand::KnownPeers { reply }).await
    }
}

// ============================================================================
// ADDRESS CONVERSION
// ============================================================================

/// `host:port` to `/ip4|ip6|dns/<host>/udp/<port>/quic-v1`
pub fn peer_to_multiaddr(peer: &PeerAddress) -> Multiaddr {
    let host = match peer.ip() {
        Some(IpAddr::V4(ip)) => Protocol::Ip4(ip),
        Some(IpAddr::V6(ip)) => Protocol::Ip6(ip),
        None => Protocol::Dns(peer.host.clone().into()),
    };
    Multiaddr::empty()
        .with(host)
        .with(Protocol::Udp(peer.port))
        .with(Protocol::QuicV1)
}

/// Host and UDP port of a multiaddr, if it has both
pub fn multiaddr_to_peer(addr: &Multiaddr) -> Option<PeerAddress> {
    let mut host = None;
    let mut port = None;
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(ip.to_string()),
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string())
            }
            Protocol::Udp(p) => port = Some(p),
            _ => {}
        }
    }
    Some(PeerAddress::new(host?, port?))
}

/// False for loopback, unspecified, private, link-local and multicast ranges
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast())
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

/// A UDP address a stranger could dial. DNS names always qualify.
pub fn is_advertisable(addr: &Multiaddr) -> bool {
    match multiaddr_to_peer(addr) {
        Some(peer) => peer.ip().map_or(true, is_public_ip),
        None => false,
    }
}

/// Addresses to record for an identified peer, best first.
///
/// `observed` is the source IP of an inbound connection; paired with the
/// peer's own UDP listen port it goes ahead of whatever the peer reports
/// about itself. Non-public entries are dropped.
pub fn advertised_addresses(observed: Option<IpAddr>, listen_addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    let mut addrs = Vec::new();

    if let Some(ip) = observed.filter(|ip| is_public_ip(*ip)) {
        let port = listen_addrs
            .iter()
            .find_map(multiaddr_to_peer)
            .map(|peer| peer.port);
        if let Some(port) = port {
            addrs.push(peer_to_multiaddr(&PeerAddress::new(ip.to_string(), port)));
        }
    }

    for addr in listen_addrs {
        if is_advertisable(addr) && !addrs.contains(addr) {
            addrs.push(addr.clone());
        }
    }
    addrs
}

fn remote_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

// ============================================================================
// SWARM TASK
// ============================================================================

/// Build and start the libp2p swarm, returning a handle for communication.
///
/// The swarm does not listen until [`Overlay::listen`] is called; dialing
/// seeds works before that from an ephemeral UDP port.
pub async fn start_overlay(keypair: Keypair) -> Result<OverlayHandle> {
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_dns()?
        .with_behaviour(|key| OverlayBehaviour::new(key))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(300)))
        .build();

    // Server mode so other nodes put us in their routing tables
    swarm
        .behaviour_mut()
        .kademlia
        .set_mode(Some(kad::Mode::Server));

    let (command_tx, mut command_rx) = mpsc::channel::<OverlayCommand>(64);
    let listening = Arc::new(AtomicBool::new(false));
    let handle = OverlayHandle {
        command_tx,
        listening: Arc::clone(&listening),
        dial_timeout: DEFAULT_DIAL_TIMEOUT,
    };

    let mut pending_listens: HashMap<ListenerId, (u16, mpsc::Sender<Result<(), OverlayError>>)> =
        HashMap::new();
    let mut pending_dials: HashMap<ConnectionId, (Multiaddr, mpsc::Sender<Result<(), OverlayError>>)> =
        HashMap::new();
    // Source IP of peers that dialed us
    let mut observed: HashMap<PeerId, IpAddr> = HashMap::new();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::NewListenAddr { listener_id, address } => {
                            tracing::info!("Overlay listening on {}", address);
                            if let Some((_, reply)) = pending_listens.remove(&listener_id) {
                                listening.store(true, Ordering::Release);
                                let _ = reply.send(Ok(())).await;
                            }
                        }

                        SwarmEvent::ListenerError { listener_id, error } => {
                            tracing::warn!("Overlay listener error: {}", error);
                            if let Some((port, reply)) = pending_listens.remove(&listener_id) {
                                let _ = reply.send(Err(OverlayError::ListenFailed {
                                    port,
                                    reason: error.to_string(),
                                })).await;
                            }
                        }

                        SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                            if let Some((port, reply)) = pending_listens.remove(&listener_id) {
                                let reason = match reason {
                                    Ok(()) => "listener closed".to_string(),
                                    Err(e) => e.to_string(),
                                };
                                let _ = reply.send(Err(OverlayError::ListenFailed { port, reason })).await;
                            }
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, connection_id, endpoint, .. } => {
                            tracing::debug!("Connected to {} via {}", peer_id, endpoint.get_remote_address());
                            if let ConnectedPoint::Listener { send_back_addr, .. } = &endpoint {
                                if let Some(ip) = remote_ip(send_back_addr) {
                                    observed.insert(peer_id, ip);
                                }
                            }
                            if let Some((addr, reply)) = pending_dials.remove(&connection_id) {
                                let kademlia = &mut swarm.behaviour_mut().kademlia;
                                kademlia.add_address(&peer_id, addr);
                                if let Err(e) = kademlia.bootstrap() {
                                    tracing::debug!("Kademlia bootstrap not started: {:?}", e);
                                }
                                let _ = reply.send(Ok(())).await;
                            }
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established: 0, .. } => {
                            observed.remove(&peer_id);
                        }

                        SwarmEvent::OutgoingConnectionError { connection_id, error, .. } => {
                            if let Some((addr, reply)) = pending_dials.remove(&connection_id) {
                                let _ = reply.send(Err(OverlayError::DialFailed {
                                    addr: addr.to_string(),
                                    reason: error.to_string(),
                                })).await;
                            }
                        }

                        SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. }
                        )) => {
                            tracing::debug!("Identified peer {} with {} addresses", peer_id, info.listen_addrs.len());
                            let seen = observed.get(&peer_id).copied();
                            for addr in advertised_addresses(seen, &info.listen_addrs) {
                                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                            }
                        }

                        SwarmEvent::Behaviour(OverlayBehaviourEvent::Kademlia(
                            kad::Event::RoutingUpdated { peer, .. }
                        )) => {
                            tracing::debug!("Routing table updated with {}", peer);
                        }

                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        OverlayCommand::Listen { port, addr, reply } => {
                            match swarm.listen_on(addr) {
                                Ok(listener_id) => {
                                    pending_listens.insert(listener_id, (port, reply));
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(OverlayError::ListenFailed {
                                        port,
                                        reason: e.to_string(),
                                    })).await;
                                }
                            }
                        }

                        OverlayCommand::Dial { addr, reply } => {
                            let opts = DialOpts::unknown_peer_id().address(addr.clone()).build();
                            let connection_id = opts.connection_id();
                            match swarm.dial(opts) {
                                Ok(()) => {
                                    pending_dials.insert(connection_id, (addr, reply));
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(OverlayError::DialFailed {
                                        addr: addr.to_string(),
                                        reason: e.to_string(),
                                    })).await;
                                }
                            }
                        }

                        OverlayCommand::KnownPeers { reply } => {
                            let mut peers = PeerList::new();
                            for bucket in swarm.behaviour_mut().kademlia.kbuckets() {
                                for entry in bucket.iter() {
                                    let usable = entry.node.value.iter().filter(|a| is_advertisable(a));
                                    if let Some(peer) = usable.filter_map(multiaddr_to_peer).next() {
                                        peers.push(peer);
                                    }
                                }
                            }
                            let _ = reply.send(peers).await;
                        }

                        OverlayCommand::Shutdown => {
                            tracing::info!("Overlay shutting down");
                            break;
                        }
                    }
                }
            }
        }
        listening.store(false, Ordering::Release);
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_to_multiaddr_ipv4() {
        let addr = peer_to_multiaddr(&PeerAddress::new("203.0.113.9", 51010));
        assert_eq!(addr.to_string(), "/ip4/203.0.113.9/udp/51010/quic-v1");
    }

    #[test]
    fn test_peer_to_multiaddr_dns_and_ipv6() {
        let dns = peer_to_multiaddr(&PeerAddress::new("seed.example.net", 50000));
        assert_eq!(dns.to_string(), "/dns/seed.example.net/udp/50000/quic-v1");

        let v6 = peer_to_multiaddr(&PeerAddress::new("2001:db8::1", 50000));
        assert_eq!(v6.to_string(), "/ip6/2001:db8::1/udp/50000/quic-v1");
    }

    #[test]
    fn test_multiaddr_to_peer() {
        let addr: Multiaddr = "/ip4/198.51.100.7/udp/51000/quic-v1".parse().unwrap();
        assert_eq!(
            multiaddr_to_peer(&addr),
            Some(PeerAddress::new("198.51.100.7", 51000))
        );

        let tcp: Multiaddr = "/ip4/198.51.100.7/tcp/51000".parse().unwrap();
        assert_eq!(multiaddr_to_peer(&tcp), None);
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_public_ip_ranges() {
        for ip in ["203.0.113.9", "8.8.8.8", "2001:db8::1"] {
            assert!(is_public_ip(ip.parse().unwrap()), "{}", ip);
        }
        for ip in [
            "127.0.0.1",
            "0.0.0.0",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.20",
            "169.254.0.5",
            "224.0.0.1",
            "::1",
            "::",
            "fd12:3456::1",
            "fe80::1",
        ] {
            assert!(!is_public_ip(ip.parse().unwrap()), "{}", ip);
        }
    }

    #[test]
    fn test_is_advertisable() {
        assert!(is_advertisable(&addr("/ip4/198.51.100.7/udp/51000/quic-v1")));
        assert!(is_advertisable(&addr("/dns/seed.example.net/udp/50000/quic-v1")));
        assert!(!is_advertisable(&addr("/ip4/127.0.0.1/udp/51000/quic-v1")));
        assert!(!is_advertisable(&addr("/ip4/192.168.1.4/udp/51000/quic-v1")));
        assert!(!is_advertisable(&addr("/ip4/198.51.100.7/tcp/51000")));
    }

    #[test]
    fn test_observed_ip_goes_first_with_listen_port() {
        let listen = vec![
            addr("/ip4/127.0.0.1/udp/51010/quic-v1"),
            addr("/ip4/192.168.1.20/udp/51010/quic-v1"),
        ];
        let addrs = advertised_addresses(Some("203.0.113.9".parse().unwrap()), &listen);
        assert_eq!(addrs, vec![addr("/ip4/203.0.113.9/udp/51010/quic-v1")]);
    }

    #[test]
    fn test_private_observed_ip_is_ignored() {
        let listen = vec![
            addr("/ip4/127.0.0.1/udp/51010/quic-v1"),
            addr("/ip4/198.51.100.7/udp/51010/quic-v1"),
        ];
        let addrs = advertised_addresses(Some("10.0.0.8".parse().unwrap()), &listen);
        assert_eq!(addrs, vec![addr("/ip4/198.51.100.7/udp/51010/quic-v1")]);

        assert!(advertised_addresses(None, &listen[..1]).is_empty());
    }

    #[test]
    fn test_observed_ip_not_duplicated() {
        let listen = vec![addr("/ip4/203.0.113.9/udp/51010/quic-v1")];
        let addrs = advertised_addresses(Some("203.0.113.9".parse().unwrap()), &listen);
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn test_known_peers_requires_listener() {
        let handle = start_overlay(Keypair::generate_ed25519()).await.unwrap();
        assert!(!handle.is_listening());
        assert!(matches!(
            handle.known_peers().await,
            Err(OverlayError::NotListening)
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_then_empty_snapshot() {
        let handle = start_overlay(Keypair::generate_ed25519()).await.unwrap();
        handle.listen(0).await.unwrap();
        assert!(handle.is_listening());
        assert!(handle.known_peers().await.unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }
}
