//! Responder and acquirer talking to each other over the in-memory chat hub
//!
//! Run with: cargo test --test integration_rendezvous

use ashdht_core::chat::MemoryChatHub;
use ashdht_core::nat::{PortLifecycle, PortMapError, PortMapper};
use ashdht_core::overlay::MemoryOverlay;
use ashdht_core::rendezvous::{
    AcquiredVia, AcquirerConfig, AcquisitionState, BackoffPolicy, BootstrapAcquirer,
    RendezvousResponder, ResponderConfig,
};
use ashdht_core::{NodeContext, NodeSettings, PeerAddress, PeerListStore, Role, StaticResolver};
use async_trait::async_trait;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct NoGateway;

#[async_trait]
impl PortMapper for NoGateway {
    async fn add_mapping(&self, _port: u16) -> Result<(), PortMapError> {
        Err(PortMapError::NoGateway("test network".to_string()))
    }

    async fn remove_mapping(&self, port: u16) -> Result<(), PortMapError> {
        Err(PortMapError::NotMapped(port))
    }
}

fn addr(s: &str) -> PeerAddress {
    s.parse().unwrap()
}

/// Responder at 198.51.100.7:51000 that knows one other peer. Returns once
/// it has joined the channel.
async fn spawn_responder(hub: &MemoryChatHub, dir: &std::path::Path) {
    let overlay = MemoryOverlay::new().with_known_peers(vec![addr("203.0.113.9:51010")]);
    overlay.set_listening(true);

    let responder = Arc::new(RendezvousResponder::new(
        Arc::new(overlay),
        Arc::new(StaticResolver::new("198.51.100.7".parse().unwrap())),
        PeerListStore::new(dir.join("responder-nodelist.txt")),
        ResponderConfig::new(51000),
    ));
    tokio::spawn(responder.serve(Arc::new(hub.connector("bot")), BackoffPolicy::default()));

    while !hub.members().iter().any(|nick| nick.starts_with("bot")) {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_stale_cache_replaced_by_rendezvous_reply() {
    let dir = tempdir().unwrap();
    let nodelist = dir.path().join("nodelist.txt");
    fs::write(&nodelist, "10.0.0.5:51000\n").unwrap();

    let hub = MemoryChatHub::new("#soulfire");
    spawn_responder(&hub, dir.path()).await;

    let overlay = MemoryOverlay::new()
        .with_reachable([addr("203.0.113.9:51010"), addr("198.51.100.7:51000")]);
    let settings = NodeSettings::new(Role::Acquirer, "#soulfire", 51234);
    let ctx = NodeContext::new(
        settings,
        Arc::new(overlay.clone()),
        Arc::new(hub.connector("client")),
        Arc::new(StaticResolver::failing()),
        PeerListStore::new(&nodelist),
        Arc::new(PortLifecycle::new(Arc::new(NoGateway), 51234)),
    );

    ctx.run(tokio::time::sleep(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(
        fs::read_to_string(&nodelist).unwrap(),
        "203.0.113.9:51010\n198.51.100.7:51000\n"
    );
    assert_eq!(overlay.listen_port(), Some(51234));
    assert_eq!(
        overlay.bootstrap_calls(),
        vec![
            vec![addr("10.0.0.5:51000")],
            vec![addr("203.0.113.9:51010"), addr("198.51.100.7:51000")],
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_start_uses_cache() {
    let dir = tempdir().unwrap();
    let store = PeerListStore::new(dir.path().join("nodelist.txt"));
    let hub = MemoryChatHub::new("#soulfire");
    spawn_responder(&hub, dir.path()).await;

    let overlay = MemoryOverlay::new().with_reachable([addr("198.51.100.7:51000")]);

    let first = BootstrapAcquirer::new(
        Arc::new(overlay.clone()),
        Arc::new(hub.connector("client")),
        store.clone(),
        AcquirerConfig::default(),
    );
    let acquired = first.run().await.unwrap();
    assert_eq!(acquired.via, AcquiredVia::Rendezvous);
    let requests = hub.channel_messages().len();
    assert_eq!(requests, 1);

    let second = BootstrapAcquirer::new(
        Arc::new(overlay.clone()),
        Arc::new(hub.connector("client")),
        store,
        AcquirerConfig::default(),
    );
    let acquired = second.run().await.unwrap();
    assert_eq!(acquired.via, AcquiredVia::Cache);
    assert_eq!(acquired.peers, vec![addr("198.51.100.7:51000")]);
    assert_eq!(
        second.transitions(),
        vec![AcquisitionState::TryingCache, AcquisitionState::Succeeded]
    );
    assert_eq!(hub.channel_messages().len(), requests);
}

#[tokio::test(start_paused = true)]
async fn test_responder_serves_several_clients() {
    let dir = tempdir().unwrap();
    let hub = MemoryChatHub::new("#soulfire");
    spawn_responder(&hub, dir.path()).await;

    for i in 0..3 {
        let acquirer = BootstrapAcquirer::new(
            Arc::new(MemoryOverlay::new()),
            Arc::new(hub.connector(format!("client{}-", i))),
            PeerListStore::new(dir.path().join(format!("client{}.txt", i))),
            AcquirerConfig::default(),
        );
        let acquired = acquirer.run().await.unwrap();
        assert_eq!(acquired.rendezvous_attempts, 1);
        assert_eq!(
            acquired.peers,
            vec![addr("203.0.113.9:51010"), addr("198.51.100.7:51000")]
        );
    }

    // Responder snapshot of its own overlay
    let snapshot = PeerListStore::new(dir.path().join("responder-nodelist.txt"))
        .load()
        .unwrap();
    assert_eq!(snapshot, vec![addr("203.0.113.9:51010")]);
}

#[tokio::test(start_paused = true)]
async fn test_client_outlasts_missing_responder() {
    let dir = tempdir().unwrap();
    let hub = MemoryChatHub::new("#soulfire");

    let late_hub = hub.clone();
    let late_dir = dir.path().to_path_buf();
    tokio::spawn(async move {
        // Well past the first burst of five attempts
        tokio::time::sleep(Duration::from_secs(900)).await;
        spawn_responder(&late_hub, &late_dir).await;
    });

    let acquirer = BootstrapAcquirer::new(
        Arc::new(MemoryOverlay::new()),
        Arc::new(hub.connector("client")),
        PeerListStore::new(dir.path().join("nodelist.txt")),
        AcquirerConfig::default(),
    );
    let acquired = acquirer.run().await.unwrap();

    assert!(acquired.rendezvous_attempts > 5);
    assert_eq!(acquired.via, AcquiredVia::Rendezvous);
}
