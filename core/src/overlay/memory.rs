//! In-memory overlay for exercising bootstrap logic without sockets

use super::{Overlay, OverlayError};
use crate::peer::{PeerAddress, PeerList};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct MemoryOverlayState {
    reachable: HashSet<PeerAddress>,
    known: PeerList,
    bootstrap_calls: Vec<PeerList>,
    listen_port: Option<u16>,
    fail_listen: bool,
}

/// Overlay stand-in. A seed "answers" if it was marked reachable; a
/// successful bootstrap adds the seed to the known peers.
#[derive(Clone, Default)]
pub struct MemoryOverlay {
    state: Arc<RwLock<MemoryOverlayState>>,
    listening: Arc<AtomicBool>,
}

impl MemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_peers(self, peers: PeerList) -> Self {
        self.state.write().known = peers;
        self
    }

    pub fn with_reachable(self, peers: impl IntoIterator<Item = PeerAddress>) -> Self {
        self.state.write().reachable.extend(peers);
        self
    }

    /// Make the next `listen` fail as if the port could not be bound
    pub fn failing_listen(self) -> Self {
        self.state.write().fail_listen = true;
        self
    }

    /// Mark listening without going through `listen`
    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Release);
    }

    pub fn set_known_peers(&self, peers: PeerList) {
        self.state.write().known = peers;
    }

    pub fn mark_reachable(&self, peer: PeerAddress) {
        self.state.write().reachable.insert(peer);
    }

    /// Seed lists passed to `bootstrap`, in call order
    pub fn bootstrap_calls(&self) -> Vec<PeerList> {
        self.state.read().bootstrap_calls.clone()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.state.read().listen_port
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    async fn listen(&self, port: u16) -> Result<(), OverlayError> {
        let mut state = self.state.write();
        if state.fail_listen {
            return Err(OverlayError::ListenFailed {
                port,
                reason: "address in use".to_string(),
            });
        }
        state.listen_port = Some(port);
        self.listening.store(true, Ordering::Release);
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    async fn bootstrap(&self, seeds: &[PeerAddress]) -> Result<(), OverlayError> {
        let mut state = self.state.write();
        state.bootstrap_calls.push(seeds.to_vec());

        let answered: Vec<PeerAddress> = seeds
            .iter()
            .filter(|seed| state.reachable.contains(*seed))
            .cloned()
            .collect();
        if answered.is_empty() {
            return Err(OverlayError::NoReachableSeed);
        }
        for seed in answered {
            if !state.known.contains(&seed) {
                state.known.push(seed);
            }
        }
        Ok(())
    }

    async fn known_peers(&self) -> Result<PeerList, OverlayError> {
        if !self.is_listening() {
            return Err(OverlayError::NotListening);
        }
        Ok(self.state.read().known.clone())
    }
}
