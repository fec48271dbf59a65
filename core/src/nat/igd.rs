//! UPnP IGD port mapper

use super::{PortMapError, PortMapper, MAPPING_DESCRIPTION};
use async_trait::async_trait;
use igd_next::aio::tokio::{self as igd_tokio, Tokio};
use igd_next::aio::Gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// How long to wait for SSDP answers while discovering the gateway
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Lease of 0 keeps the mapping until it is removed
const LEASE_FOREVER: u32 = 0;

pub struct IgdPortMapper {
    search_timeout: Duration,
    gateway: Mutex<Option<Gateway<Tokio>>>,
}

impl IgdPortMapper {
    pub fn new() -> Self {
        Self {
            search_timeout: SEARCH_TIMEOUT,
            gateway: Mutex::new(None),
        }
    }

    async fn discover(&self) -> Result<Gateway<Tokio>, PortMapError> {
        let opts = SearchOptions {
            timeout: Some(self.search_timeout),
            ..Default::default()
        };
        let gateway = igd_tokio::search_gateway(opts)
            .await
            .map_err(|e| PortMapError::NoGateway(e.to_string()))?;
        tracing::debug!("Found UPnP gateway at {}", gateway.addr);
        Ok(gateway)
    }
}

impl Default for IgdPortMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// The address this host uses to reach the gateway. Connecting a UDP
/// socket sends nothing; it only makes the kernel pick a route.
async fn lan_address(gateway: SocketAddr) -> Result<IpAddr, PortMapError> {
    let bind: SocketAddr = if gateway.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(gateway).await?;
    Ok(socket.local_addr()?.ip())
}

#[async_trait]
impl PortMapper for IgdPortMapper {
    async fn add_mapping(&self, port: u16) -> Result<(), PortMapError> {
        let gateway = self.discover().await?;
        let local = SocketAddr::new(lan_address(gateway.addr).await?, port);

        gateway
            .add_port(
                PortMappingProtocol::UDP,
                port,
                local,
                LEASE_FOREVER,
                MAPPING_DESCRIPTION,
            )
            .await
            .map_err(|e| PortMapError::AddFailed {
                port,
                reason: e.to_string(),
            })?;

        tracing::debug!("Gateway forwards UDP {} to {}", port, local);
        *self.gateway.lock() = Some(gateway);
        Ok(())
    }

    async fn remove_mapping(&self, port: u16) -> Result<(), PortMapError> {
        let gateway = self
            .gateway
            .lock()
            .take()
            .ok_or(PortMapError::NotMapped(port))?;

        gateway
            .remove_port(PortMappingProtocol::UDP, port)
            .await
            .map_err(|e| PortMapError::RemoveFailed {
                port,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_without_mapping() {
        let mapper = IgdPortMapper::new();
        let err = mapper.remove_mapping(51000).await.unwrap_err();
        assert!(matches!(err, PortMapError::NotMapped(51000)));
    }

    #[tokio::test]
    async fn test_lan_address_for_loopback_gateway() {
        let ip = lan_address("127.0.0.1:1900".parse().unwrap()).await.unwrap();
        assert!(ip.is_loopback());
    }
}
