// Port forwarding: one UDP mapping requested at startup, released at exit
//
// The mapper is the seam; `PortLifecycle` owns the open/close discipline.

pub mod igd;
pub mod lifecycle;

use async_trait::async_trait;
use thiserror::Error;

pub use igd::IgdPortMapper;
pub use lifecycle::PortLifecycle;

/// Description attached to mappings on the gateway
pub const MAPPING_DESCRIPTION: &str = "ashdht";

#[derive(Debug, Error)]
pub enum PortMapError {
    #[error("No UPnP gateway found: {0}")]
    NoGateway(String),
    #[error("Could not determine LAN address: {0}")]
    LocalAddress(#[from] std::io::Error),
    #[error("Gateway refused mapping for port {port}: {reason}")]
    AddFailed { port: u16, reason: String },
    #[error("Failed to remove mapping for port {port}: {reason}")]
    RemoveFailed { port: u16, reason: String },
    #[error("No mapping was requested for port {0}")]
    NotMapped(u16),
}

/// Something that can forward an external UDP port to this host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Forward external `port` to the same port on this host
    async fn add_mapping(&self, port: u16) -> Result<(), PortMapError>;

    /// Remove a mapping previously requested with `add_mapping`
    async fn remove_mapping(&self, port: u16) -> Result<(), PortMapError>;
}
