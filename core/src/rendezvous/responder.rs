//! Rendezvous responder: answers bootstrap requests seen on the channel
//!
//! A request is the bare token, on the channel or privately. The answer goes
//! privately to the requester: up to 19 sampled known peers plus our own
//! public address and overlay port.

use super::backoff::BackoffPolicy;
use super::protocol::{build_reply, is_bootstrap_request, RendezvousReply, DEFAULT_BOOTSTRAP_TOKEN};
use crate::chat::{ChatConnector, ChatError, ChatLink, ChatSession};
use crate::overlay::Overlay;
use crate::peer::{PeerAddress, PeerList};
use crate::public_ip::PublicAddressResolver;
use crate::store::PeerListStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub token: String,
    /// Overlay port advertised next to our public address
    pub listen_port: u16,
    /// How many times to check the overlay listener before giving up
    pub readiness_polls: u32,
    pub readiness_interval: Duration,
}

impl ResponderConfig {
    pub fn new(listen_port: u16) -> Self {
        Self {
            token: DEFAULT_BOOTSTRAP_TOKEN.to_string(),
            listen_port,
            readiness_polls: 5,
            readiness_interval: Duration::from_secs(1),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

pub struct RendezvousResponder {
    overlay: Arc<dyn Overlay>,
    resolver: Arc<dyn PublicAddressResolver>,
    store: PeerListStore,
    config: ResponderConfig,
}

impl RendezvousResponder {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        resolver: Arc<dyn PublicAddressResolver>,
        store: PeerListStore,
        config: ResponderConfig,
    ) -> Self {
        Self {
            overlay,
            resolver,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    async fn wait_until_listening(&self) -> bool {
        for _ in 0..self.config.readiness_polls {
            if self.overlay.is_listening() {
                return true;
            }
            tokio::time::sleep(self.config.readiness_interval).await;
        }
        self.overlay.is_listening()
    }

    async fn known_peers(&self) -> PeerList {
        match self.overlay.known_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Could not enumerate overlay peers: {}", e);
                PeerList::new()
            }
        }
    }

    /// Answer one bootstrap request from `requester`.
    ///
    /// Returns the reply that was sent, or `None` when the overlay never
    /// became ready and nothing was sent.
    pub async fn handle_request(
        &self,
        requester: &str,
        link: &dyn ChatLink,
    ) -> Result<Option<RendezvousReply>, ChatError> {
        if !self.wait_until_listening().await {
            warn!("Overlay listener not initialized; ignoring request from {}", requester);
            return Ok(None);
        }

        let known = self.known_peers().await;
        if !known.is_empty() {
            if let Err(e) = self.store.save(&known) {
                warn!("Failed to save node list: {}", e);
            }
        }

        let ip = self.resolver.resolve_or_unspecified().await;
        let own = PeerAddress::new(ip.to_string(), self.config.listen_port);

        let reply = {
            let mut rng = rand::thread_rng();
            build_reply(&self.config.token, known, own, &mut rng)
        };
        debug!("Replying to {} with {} peers", requester, reply.peers.len());
        link.send_text(requester, &reply.encode()).await?;
        info!("Sent {} peers to {}", reply.peers.len(), requester);
        Ok(Some(reply))
    }

    /// Handle requests from `session` until it ends. Each request runs on
    /// its own task so a slow overlay never stalls the channel reader.
    pub async fn run(self: Arc<Self>, mut session: ChatSession) {
        while let Some(message) = session.next_message().await {
            if !is_bootstrap_request(&message.body, &self.config.token) {
                continue;
            }
            info!("Bootstrap request from {}", message.sender);

            let responder = Arc::clone(&self);
            let link = session.link();
            tokio::spawn(async move {
                if let Err(e) = responder.handle_request(&message.sender, link.as_ref()).await {
                    warn!("Failed to answer {}: {}", message.sender, e);
                }
            });
        }
    }

    /// Stay on the channel forever, reconnecting with backoff whenever the
    /// connection cannot be opened or drops.
    pub async fn serve(self: Arc<Self>, connector: Arc<dyn ChatConnector>, backoff: BackoffPolicy) {
        let mut failures = 0u32;
        loop {
            match connector.connect().await {
                Ok(session) => {
                    info!("Joined {} as {}", session.channel(), session.nick());
                    failures = 0;
                    Arc::clone(&self).run(session).await;
                    warn!("Chat connection lost");
                }
                Err(e) => warn!("Chat connection failed: {}", e),
            }

            failures = failures.saturating_add(1);
            let delay = backoff.delay(failures);
            info!("Reconnecting to chat in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}
