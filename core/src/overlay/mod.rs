// Overlay module: the DHT as seen by the bootstrap logic
//
// Routing and storage belong to the overlay; we only need to listen, join
// through seed addresses, and read back the addresses it currently knows.

pub mod behaviour;
pub mod memory;
pub mod swarm;

use crate::peer::{PeerAddress, PeerList};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryOverlay;
pub use swarm::{start_overlay, OverlayHandle};

#[derive(Debug, Clone, Error)]
pub enum OverlayError {
    #[error("Overlay listener not initialized")]
    NotListening,
    #[error("Failed to listen on UDP port {port}: {reason}")]
    ListenFailed { port: u16, reason: String },
    #[error("No seed address was reachable")]
    NoReachableSeed,
    #[error("Failed to dial {addr}: {reason}")]
    DialFailed { addr: String, reason: String },
    #[error("Overlay task not running")]
    Stopped,
}

#[async_trait]
pub trait Overlay: Send + Sync {
    /// Start listening for overlay traffic on a UDP port
    async fn listen(&self, port: u16) -> Result<(), OverlayError>;

    /// Whether `listen` has completed and the node can serve peers
    fn is_listening(&self) -> bool;

    /// Join the overlay through `seeds`. Succeeds if at least one seed
    /// answered.
    async fn bootstrap(&self, seeds: &[PeerAddress]) -> Result<(), OverlayError>;

    /// Addresses of all peers currently in the routing table
    async fn known_peers(&self) -> Result<PeerList, OverlayError>;
}
