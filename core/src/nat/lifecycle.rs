// Port mapping lifecycle
//
// open() is best effort. close() reaches the mapper at most once, and
// guard() makes sure it is reached on every way out of the role future:
// normal return, error return, panic, or operator shutdown.

use super::PortMapper;
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct PortLifecycle {
    mapper: Arc<dyn PortMapper>,
    port: u16,
    mapped: AtomicBool,
    closed: AtomicBool,
}

impl PortLifecycle {
    pub fn new(mapper: Arc<dyn PortMapper>, port: u16) -> Self {
        Self {
            mapper,
            port,
            mapped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the last `open` got a mapping from the gateway
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Request the mapping. Failure is logged and reported as `false`;
    /// the node keeps running without a forwarded port.
    pub async fn open(&self) -> bool {
        match self.mapper.add_mapping(self.port).await {
            Ok(()) => {
                tracing::info!("UDP port {} forwarded", self.port);
                self.mapped.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                tracing::warn!("Port mapping for {} failed: {}", self.port, e);
                false
            }
        }
    }

    /// Release the mapping. Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.mapper.remove_mapping(self.port).await {
            Ok(()) => tracing::info!("Released port mapping for {}", self.port),
            Err(e) => tracing::warn!("Could not release port mapping for {}: {}", self.port, e),
        }
        self.mapped.store(false, Ordering::Release);
    }

    /// Run `work` until it finishes or `shutdown` resolves, then close the
    /// mapping. Returns `None` when shutdown won. A panic inside `work` is
    /// resumed after the mapping is released.
    pub async fn guard<F, S>(&self, work: F, shutdown: S) -> Option<F::Output>
    where
        F: Future,
        S: Future<Output = ()>,
    {
        let outcome = {
            let work = AssertUnwindSafe(work).catch_unwind();
            tokio::pin!(work);
            tokio::pin!(shutdown);

            tokio::select! {
                result = &mut work => Some(result),
                () = &mut shutdown => None,
            }
        };

        self.close().await;

        match outcome {
            Some(Ok(value)) => Some(value),
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => {
                tracing::info!("Shutdown requested");
                None
            }
        }
    }
}
