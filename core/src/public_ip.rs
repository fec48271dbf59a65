//! Public address discovery through a plaintext HTTP echo service

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Echo service that answers `GET /` with the caller's address
pub const DEFAULT_ECHO_URL: &str = "http://api.ipify.org";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Echo service timed out")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP request failed: {0}")]
    Transport(String),
    #[error("Unexpected HTTP status: {0}")]
    Status(u16),
    #[error("Response is not an IP address: {0:?}")]
    InvalidBody(String),
}

impl From<ureq::Error> for ResolveError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, _) => ResolveError::Status(code),
            ureq::Error::Transport(t) => ResolveError::Transport(t.to_string()),
        }
    }
}

#[async_trait]
pub trait PublicAddressResolver: Send + Sync {
    async fn resolve(&self) -> Result<IpAddr, ResolveError>;

    /// `resolve`, with `0.0.0.0` standing in for any failure
    async fn resolve_or_unspecified(&self) -> IpAddr {
        match self.resolve().await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::debug!("Public address lookup failed: {}", e);
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }
        }
    }
}

pub struct HttpEchoResolver {
    url: String,
    timeout: Duration,
}

impl HttpEchoResolver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn fetch_blocking(url: &str, timeout: Duration) -> Result<IpAddr, ResolveError> {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent("ashdht")
            .build();
        let body = agent.get(url).call()?.into_string()?;
        parse_body(&body)
    }
}

impl Default for HttpEchoResolver {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_URL)
    }
}

/// The address is the last non-empty body line
fn parse_body(body: &str) -> Result<IpAddr, ResolveError> {
    let candidate = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default();

    candidate
        .parse()
        .map_err(|_| ResolveError::InvalidBody(candidate.to_string()))
}

#[async_trait]
impl PublicAddressResolver for HttpEchoResolver {
    async fn resolve(&self) -> Result<IpAddr, ResolveError> {
        let url = self.url.clone();
        let timeout = self.timeout;
        let lookup = tokio::task::spawn_blocking(move || HttpEchoResolver::fetch_blocking(&url, timeout));

        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ResolveError::Transport(join.to_string())),
            Err(_) => Err(ResolveError::Timeout),
        }
    }
}

/// Resolver with a fixed answer, for tests and for hosts with a known address
pub struct StaticResolver {
    answer: Mutex<Option<IpAddr>>,
}

impl StaticResolver {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            answer: Mutex::new(Some(ip)),
        }
    }

    /// A resolver whose lookups always fail
    pub fn failing() -> Self {
        Self {
            answer: Mutex::new(None),
        }
    }

    pub fn set(&self, ip: Option<IpAddr>) {
        *self.answer.lock() = ip;
    }
}

#[async_trait]
impl PublicAddressResolver for StaticResolver {
    async fn resolve(&self) -> Result<IpAddr, ResolveError> {
        (*self.answer.lock()).ok_or(ResolveError::Timeout)
    }
}
