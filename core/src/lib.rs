// ashdht core: rendezvous bootstrap for a Kademlia overlay
//
// A node with no peers asks a chat channel for some; nodes that already have
// peers answer. Everything outside that exchange (the overlay, the chat
// server, the gateway, the address echo) sits behind a trait with a real
// adapter and an in-memory one.

pub mod chat;
pub mod context;
pub mod nat;
pub mod overlay;
pub mod peer;
pub mod public_ip;
pub mod refresher;
pub mod rendezvous;
pub mod store;

pub use chat::{ChatConnector, ChatError, ChatMessage, ChatSession, IrcConfig, IrcConnector};
pub use context::{NodeContext, NodeEvent, NodeSettings, Role};
pub use nat::{IgdPortMapper, PortLifecycle, PortMapError, PortMapper};
pub use overlay::{start_overlay, Overlay, OverlayError, OverlayHandle};
pub use peer::{PeerAddress, PeerList};
pub use public_ip::{HttpEchoResolver, PublicAddressResolver, ResolveError, StaticResolver};
pub use refresher::{PeerListRefresher, RefreshOutcome};
pub use rendezvous::{
    AcquireError, Acquired, AcquiredVia, AcquirerConfig, BackoffPolicy, BootstrapAcquirer,
    RendezvousResponder, ResponderConfig,
};
pub use store::{PeerListError, PeerListStore};
