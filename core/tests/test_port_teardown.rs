//! The forwarded port is released exactly once, whatever way the node stops

use ashdht_core::chat::MemoryChatHub;
use ashdht_core::nat::{PortLifecycle, PortMapError, PortMapper};
use ashdht_core::overlay::MemoryOverlay;
use ashdht_core::{NodeContext, NodeSettings, PeerListStore, Role, StaticResolver};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingMapper {
    added: Mutex<Vec<u16>>,
    removed: Mutex<Vec<u16>>,
}

#[async_trait]
impl PortMapper for RecordingMapper {
    async fn add_mapping(&self, port: u16) -> Result<(), PortMapError> {
        self.added.lock().push(port);
        Ok(())
    }

    async fn remove_mapping(&self, port: u16) -> Result<(), PortMapError> {
        self.removed.lock().push(port);
        Ok(())
    }
}

impl RecordingMapper {
    fn assert_released_once(&self, port: u16) {
        assert_eq!(*self.added.lock(), vec![port]);
        assert_eq!(*self.removed.lock(), vec![port]);
    }
}

fn node(
    dir: &TempDir,
    role: Role,
    overlay: MemoryOverlay,
    mapper: &Arc<RecordingMapper>,
) -> NodeContext {
    let hub = MemoryChatHub::new("#soulfire");
    NodeContext::new(
        NodeSettings::new(role, "#soulfire", 52001),
        Arc::new(overlay),
        Arc::new(hub.connector("node")),
        Arc::new(StaticResolver::failing()),
        PeerListStore::new(dir.path().join("nodelist.txt")),
        Arc::new(PortLifecycle::new(mapper.clone(), 52001)),
    )
}

#[tokio::test]
async fn test_released_on_normal_completion() {
    let mapper = Arc::new(RecordingMapper::default());
    let lifecycle = PortLifecycle::new(mapper.clone(), 52001);

    lifecycle.open().await;
    let out = lifecycle
        .guard(async { "done" }, futures::future::pending())
        .await;
    lifecycle.close().await;

    assert_eq!(out, Some("done"));
    mapper.assert_released_once(52001);
}

#[tokio::test]
async fn test_released_when_listener_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mapper = Arc::new(RecordingMapper::default());
    let ctx = node(&dir, Role::Responder, MemoryOverlay::new().failing_listen(), &mapper);

    assert!(ctx.run(futures::future::pending()).await.is_err());
    mapper.assert_released_once(52001);
}

#[tokio::test(start_paused = true)]
async fn test_released_on_operator_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mapper = Arc::new(RecordingMapper::default());
    let overlay = MemoryOverlay::new();
    let ctx = node(&dir, Role::Responder, overlay, &mapper);

    ctx.run(tokio::time::sleep(Duration::from_secs(30)))
        .await
        .unwrap();
    mapper.assert_released_once(52001);
}

#[tokio::test(start_paused = true)]
async fn test_released_while_acquirer_still_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let mapper = Arc::new(RecordingMapper::default());
    let ctx = node(&dir, Role::Acquirer, MemoryOverlay::new(), &mapper);

    // No responder on the channel; the acquirer would retry forever
    ctx.run(tokio::time::sleep(Duration::from_secs(3600)))
        .await
        .unwrap();
    mapper.assert_released_once(52001);
}

#[tokio::test]
async fn test_released_on_panic() {
    let mapper = Arc::new(RecordingMapper::default());
    let lifecycle = Arc::new(PortLifecycle::new(mapper.clone(), 52001));
    lifecycle.open().await;

    let guarded = Arc::clone(&lifecycle);
    let result = AssertUnwindSafe(async move {
        guarded
            .guard(
                async {
                    tokio::task::yield_now().await;
                    panic!("simulated failure mid-run");
                },
                futures::future::pending(),
            )
            .await
    })
    .catch_unwind()
    .await;

    assert!(result.is_err());
    mapper.assert_released_once(52001);
}
