// Combined NetworkBehaviour for the overlay node
//
// - kademlia: the DHT routing table we bootstrap and snapshot
// - identify: learn peers' listen addresses so kademlia can store them

use libp2p::{identify, kad, swarm::NetworkBehaviour, StreamProtocol};
use std::time::Duration;

/// Kademlia protocol name; nodes only talk to nodes with the same name
pub const KAD_PROTOCOL: &str = "/ashdht/kad/1.0.0";

const IDENTIFY_PROTOCOL: &str = "/ashdht/id/1.0.0";

#[derive(NetworkBehaviour)]
pub struct OverlayBehaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
}

impl OverlayBehaviour {
    pub fn new(keypair: &libp2p::identity::Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let mut kad_config = kad::Config::default();
        kad_config.set_protocol_names(vec![StreamProtocol::new(KAD_PROTOCOL)]);
        kad_config.set_query_timeout(Duration::from_secs(60));
        let kademlia = kad::Behaviour::with_config(
            peer_id,
            kad::store::MemoryStore::new(peer_id),
            kad_config,
        );

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_push_listen_addr_updates(true)
                .with_interval(Duration::from_secs(300)),
        );

        Self { kademlia, identify }
    }
}
