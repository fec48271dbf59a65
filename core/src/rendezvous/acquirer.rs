// Bootstrap acquirer: how a node with no peers finds its first ones
//
// Cache first: each address from the node list is tried alone as an overlay
// seed. Then a burst of rendezvous attempts on the chat channel, backing off
// between them. When a whole burst fails the node keeps going in rounds
// (sleep, cache, burst) until something works.

use super::backoff::BackoffPolicy;
use super::protocol::{RendezvousReply, DEFAULT_BOOTSTRAP_TOKEN};
use crate::chat::{ChatConnector, ChatSession};
use crate::overlay::Overlay;
use crate::peer::PeerList;
use crate::store::{PeerListError, PeerListStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Quit message once a reply was received
pub const QUIT_BOOTSTRAP_COMPLETE: &str = "DHT bootstrap complete";

const QUIT_NO_REPLY: &str = "No bootstrap reply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    TryingCache,
    RequestingRendezvous,
    WaitingReply,
    BackingOff,
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquiredVia {
    Cache,
    Rendezvous,
}

/// Outcome of a successful acquisition
#[derive(Debug, Clone)]
pub struct Acquired {
    pub peers: PeerList,
    pub via: AcquiredVia,
    /// Rendezvous attempts made before success, across all rounds
    pub rendezvous_attempts: u32,
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("No peers acquired after {0} retry rounds")]
    RoundLimitReached(u32),
}

#[derive(Debug, Clone)]
pub struct AcquirerConfig {
    pub token: String,
    pub reply_timeout: Duration,
    /// Rendezvous attempts per burst
    pub fast_retry_limit: u32,
    pub backoff: BackoffPolicy,
    /// Stop after this many outer rounds. `None` retries forever.
    pub max_rounds: Option<u32>,
}

impl Default for AcquirerConfig {
    fn default() -> Self {
        Self {
            token: DEFAULT_BOOTSTRAP_TOKEN.to_string(),
            reply_timeout: Duration::from_secs(30),
            fast_retry_limit: 5,
            backoff: BackoffPolicy::default(),
            max_rounds: None,
        }
    }
}

pub struct BootstrapAcquirer {
    overlay: Arc<dyn Overlay>,
    connector: Arc<dyn ChatConnector>,
    store: PeerListStore,
    config: AcquirerConfig,
    transitions: Mutex<Vec<AcquisitionState>>,
}

impl BootstrapAcquirer {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        connector: Arc<dyn ChatConnector>,
        store: PeerListStore,
        config: AcquirerConfig,
    ) -> Self {
        Self {
            overlay,
            connector,
            store,
            config,
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Every state entered so far, in order
    pub fn transitions(&self) -> Vec<AcquisitionState> {
        self.transitions.lock().clone()
    }

    fn enter(&self, state: AcquisitionState) {
        debug!("Acquirer -> {:?}", state);
        self.transitions.lock().push(state);
    }

    /// Try each cached address as the sole seed, in file order. The first
    /// one that answers wins.
    pub async fn try_cache(&self) -> Option<PeerList> {
        self.enter(AcquisitionState::TryingCache);

        let cached = match self.store.load() {
            Ok(peers) => peers,
            Err(PeerListError::NotFound(path)) => {
                info!("No cached node list at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Could not read cached node list: {}", e);
                return None;
            }
        };

        info!("Trying {} cached peers", cached.len());
        for candidate in cached {
            match self.overlay.bootstrap(std::slice::from_ref(&candidate)).await {
                Ok(()) => {
                    info!("Bootstrapped from cached peer {}", candidate);
                    return Some(vec![candidate]);
                }
                Err(e) => debug!("Cached peer {} failed: {}", candidate, e),
            }
        }

        warn!("No cached peer answered");
        None
    }

    /// One rendezvous attempt: connect, ask the channel, wait for a reply.
    pub async fn rendezvous_once(&self) -> Option<PeerList> {
        self.enter(AcquisitionState::RequestingRendezvous);

        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not reach chat server: {}", e);
                return None;
            }
        };

        info!("Requesting peers on {} as {}", session.channel(), session.nick());
        if let Err(e) = session.broadcast(&self.config.token).await {
            warn!("Failed to send bootstrap request: {}", e);
            abandon(session, QUIT_NO_REPLY).await;
            return None;
        }

        self.enter(AcquisitionState::WaitingReply);
        let waited = tokio::time::timeout(
            self.config.reply_timeout,
            wait_for_reply(&mut session, &self.config.token),
        )
        .await;

        match waited {
            Ok(Some(reply)) => {
                info!("Received {} peers", reply.peers.len());
                if let Err(e) = self.store.save(&reply.peers) {
                    warn!("Failed to save node list: {}", e);
                }
                abandon(session, QUIT_BOOTSTRAP_COMPLETE).await;
                Some(reply.peers)
            }
            Ok(None) => {
                warn!("Chat connection closed before a reply arrived");
                None
            }
            Err(_) => {
                warn!("No reply within {:?}", self.config.reply_timeout);
                abandon(session, QUIT_NO_REPLY).await;
                None
            }
        }
    }

    /// Up to `fast_retry_limit` rendezvous attempts, backing off between
    /// them. No sleep follows the last one.
    async fn burst(&self, attempts: &mut u32) -> Option<PeerList> {
        let limit = self.config.fast_retry_limit;
        for attempt in 1..=limit {
            *attempts += 1;
            if let Some(peers) = self.rendezvous_once().await {
                return Some(peers);
            }
            if attempt < limit {
                let delay = self.config.backoff.delay(attempt);
                self.enter(AcquisitionState::BackingOff);
                info!("Rendezvous attempt {} failed; retrying in {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
            }
        }
        None
    }

    fn succeed(&self, peers: PeerList, via: AcquiredVia, rendezvous_attempts: u32) -> Acquired {
        self.enter(AcquisitionState::Succeeded);
        info!("Bootstrap acquired {} peers via {:?}", peers.len(), via);
        Acquired {
            peers,
            via,
            rendezvous_attempts,
        }
    }

    /// Run until peers are acquired. Only returns an error when
    /// `max_rounds` is set and exhausted.
    pub async fn run(&self) -> Result<Acquired, AcquireError> {
        let mut attempts = 0u32;

        if let Some(peers) = self.try_cache().await {
            return Ok(self.succeed(peers, AcquiredVia::Cache, attempts));
        }
        if let Some(peers) = self.burst(&mut attempts).await {
            return Ok(self.succeed(peers, AcquiredVia::Rendezvous, attempts));
        }

        let mut round = 0u32;
        loop {
            round += 1;
            if let Some(max) = self.config.max_rounds {
                if round > max {
                    return Err(AcquireError::RoundLimitReached(max));
                }
            }

            let delay = self.config.backoff.delay(round);
            self.enter(AcquisitionState::BackingOff);
            warn!("Bootstrap round {} failed; waiting {:?}", round, delay);
            tokio::time::sleep(delay).await;

            if let Some(peers) = self.try_cache().await {
                return Ok(self.succeed(peers, AcquiredVia::Cache, attempts));
            }
            if let Some(peers) = self.burst(&mut attempts).await {
                return Ok(self.succeed(peers, AcquiredVia::Rendezvous, attempts));
            }
        }
    }
}

/// Next private message carrying `token` and at least one usable address
async fn wait_for_reply(session: &mut ChatSession, token: &str) -> Option<RendezvousReply> {
    loop {
        let message = session.next_message().await?;
        if message.is_channel_message() {
            continue;
        }
        match RendezvousReply::parse(&message.body, token) {
            Some(reply) if !reply.peers.is_empty() => return Some(reply),
            _ => debug!("Ignoring message from {}", message.sender),
        }
    }
}

async fn abandon(session: ChatSession, reason: &str) {
    if let Err(e) = session.quit(reason).await {
        debug!("Quit failed: {}", e);
    }
}
