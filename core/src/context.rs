// Node runtime: wires the components together for one role
//
// Built once at startup and passed around explicitly. `run` opens the port
// mapping, runs the role under the mapping's guard, and reports milestones on
// an optional event channel for the CLI to display.

use crate::chat::ChatConnector;
use crate::nat::PortLifecycle;
use crate::overlay::Overlay;
use crate::public_ip::PublicAddressResolver;
use crate::refresher::{PeerListRefresher, DEFAULT_REFRESH_INTERVAL};
use crate::rendezvous::{
    AcquiredVia, AcquirerConfig, BackoffPolicy, BootstrapAcquirer, RendezvousResponder,
    ResponderConfig, DEFAULT_BOOTSTRAP_TOKEN,
};
use crate::store::PeerListStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Stays on the channel and answers bootstrap requests
    #[serde(rename = "bot")]
    Responder,
    /// Joins the overlay through the cache or the channel
    #[serde(rename = "client")]
    Acquirer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Responder => write!(f, "bot"),
            Role::Acquirer => write!(f, "client"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bot" => Ok(Role::Responder),
            "client" => Ok(Role::Acquirer),
            other => Err(format!("unknown mode '{}' (expected bot or client)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub role: Role,
    pub channel: String,
    pub token: String,
    /// UDP port for the overlay; also the port that gets forwarded
    pub port: u16,
    pub refresh_interval: Duration,
    /// Delay between chat reconnects in the responder role
    pub chat_backoff: BackoffPolicy,
    pub acquirer: AcquirerConfig,
}

impl NodeSettings {
    pub fn new(role: Role, channel: impl Into<String>, port: u16) -> Self {
        Self {
            role,
            channel: channel.into(),
            token: DEFAULT_BOOTSTRAP_TOKEN.to_string(),
            port,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            chat_backoff: BackoffPolicy::default(),
            acquirer: AcquirerConfig::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.acquirer.token = token.clone();
        self.token = token;
        self
    }
}

/// Milestones worth showing to the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PortMapping { port: u16, mapped: bool },
    Listening { port: u16 },
    Acquired { via: AcquiredVia, peers: usize },
}

pub struct NodeContext {
    settings: NodeSettings,
    overlay: Arc<dyn Overlay>,
    chat: Arc<dyn ChatConnector>,
    resolver: Arc<dyn PublicAddressResolver>,
    store: PeerListStore,
    port: Arc<PortLifecycle>,
    events: Option<mpsc::Sender<NodeEvent>>,
}

impl NodeContext {
    pub fn new(
        settings: NodeSettings,
        overlay: Arc<dyn Overlay>,
        chat: Arc<dyn ChatConnector>,
        resolver: Arc<dyn PublicAddressResolver>,
        store: PeerListStore,
        port: Arc<PortLifecycle>,
    ) -> Self {
        Self {
            settings,
            overlay,
            chat,
            resolver,
            store,
            port,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<NodeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    async fn emit(&self, event: NodeEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    /// Run the configured role until it fails or `shutdown` resolves. The
    /// port mapping is released on every exit path.
    pub async fn run<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        info!(
            "Starting as {} on UDP {} (channel {})",
            self.settings.role, self.settings.port, self.settings.channel
        );

        let mapped = self.port.open().await;
        self.emit(NodeEvent::PortMapping {
            port: self.settings.port,
            mapped,
        })
        .await;

        let role = async {
            match self.settings.role {
                Role::Responder => self.run_responder().await,
                Role::Acquirer => self.run_acquirer().await,
            }
        };

        self.port.guard(role, shutdown).await.unwrap_or(Ok(()))
    }

    fn refresher(&self) -> PeerListRefresher {
        PeerListRefresher::new(Arc::clone(&self.overlay), self.store.clone())
            .with_interval(self.settings.refresh_interval)
    }

    async fn listen(&self) -> Result<()> {
        let port = self.settings.port;
        self.overlay
            .listen(port)
            .await
            .with_context(|| format!("Overlay failed to listen on UDP {}", port))?;
        self.emit(NodeEvent::Listening { port }).await;
        Ok(())
    }

    async fn run_responder(&self) -> Result<()> {
        self.listen().await?;

        let responder = Arc::new(RendezvousResponder::new(
            Arc::clone(&self.overlay),
            Arc::clone(&self.resolver),
            self.store.clone(),
            ResponderConfig::new(self.settings.port).with_token(self.settings.token.clone()),
        ));

        tokio::join!(
            responder.serve(Arc::clone(&self.chat), self.settings.chat_backoff),
            self.refresher().run(),
        );
        Ok(())
    }

    async fn run_acquirer(&self) -> Result<()> {
        let acquirer = BootstrapAcquirer::new(
            Arc::clone(&self.overlay),
            Arc::clone(&self.chat),
            self.store.clone(),
            self.settings.acquirer.clone(),
        );
        let acquired = acquirer.run().await?;
        self.emit(NodeEvent::Acquired {
            via: acquired.via,
            peers: acquired.peers.len(),
        })
        .await;

        self.listen().await?;

        // A cache hit already joined through its seed
        if acquired.via == AcquiredVia::Rendezvous {
            if let Err(e) = self.overlay.bootstrap(&acquired.peers).await {
                warn!("Could not join overlay through acquired peers: {}", e);
            }
        }

        self.refresher().run().await;
        Ok(())
    }
}
