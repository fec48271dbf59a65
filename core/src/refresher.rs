//! Periodic snapshot of the overlay's routing table into the node list

use crate::overlay::{Overlay, OverlayError};
use crate::store::PeerListStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The node list was overwritten with this many peers
    Written(usize),
    /// The overlay knows no peers; the previous list is kept
    SkippedEmpty,
    /// The overlay listener is not up yet
    NotReady,
    /// Enumeration or the write failed; logged
    Failed,
}

pub struct PeerListRefresher {
    overlay: Arc<dyn Overlay>,
    store: PeerListStore,
    interval: Duration,
}

impl PeerListRefresher {
    pub fn new(overlay: Arc<dyn Overlay>, store: PeerListStore) -> Self {
        Self {
            overlay,
            store,
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn refresh_once(&self) -> RefreshOutcome {
        if !self.overlay.is_listening() {
            return RefreshOutcome::NotReady;
        }

        let peers = match self.overlay.known_peers().await {
            Ok(peers) => peers,
            Err(OverlayError::NotListening) => return RefreshOutcome::NotReady,
            Err(e) => {
                warn!("Could not enumerate overlay peers: {}", e);
                return RefreshOutcome::Failed;
            }
        };
        if peers.is_empty() {
            return RefreshOutcome::SkippedEmpty;
        }

        match self.store.save(&peers) {
            Ok(()) => {
                info!("Saved {} peers to {}", peers.len(), self.store.path().display());
                RefreshOutcome::Written(peers.len())
            }
            Err(e) => {
                warn!("Failed to save node list: {}", e);
                RefreshOutcome::Failed
            }
        }
    }

    /// Snapshot, sleep, repeat. Never returns.
    pub async fn run(self) {
        loop {
            let outcome = self.refresh_once().await;
            debug!("Node list refresh: {:?}", outcome);
            tokio::time::sleep(self.interval).await;
        }
    }
}
