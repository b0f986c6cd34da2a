//! End-to-end tests: real nodes over loopback with provisioned keys.
//!
//! Run with: cargo test --test node_test

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taconet::net::SessionState;
use taconet::node::Node;
use taconet::settings::PeerRecord;
use taconet::transfer::QueuedDownload;
use taconet::types::fresh_id;

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("taconet_e2e_{tag}_{}", fresh_id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn make_node(dir: &PathBuf, port: u16, nickname: &str) -> Arc<Node> {
    let node = Node::new(dir).unwrap();
    let downloads = dir.join("downloads");
    let nickname = nickname.to_string();
    node.save_settings(move |s| {
        s.app_ip = "127.0.0.1".into();
        s.app_port = port;
        s.nickname = nickname;
        s.download_location = downloads;
    });
    Arc::new(node)
}

/// Teach `a` about `b`, enabled, with b's real keys.
fn provision(a: &Node, b: &Node, b_port: u16) {
    let (clientkey, serverkey) = b.public_keys();
    let b_id = b.local_id();
    a.save_settings(move |s| {
        s.peers.insert(
            b_id,
            PeerRecord {
                hostname: "127.0.0.1".into(),
                port: b_port,
                enabled: true,
                dynamic: false,
                localnick: String::new(),
                nickname: String::new(),
                clientkey,
                serverkey,
            },
        );
    });
}

async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    false
}

fn connected_to(node: &Node, peer_id: &str) -> bool {
    node.peer_status()
        .iter()
        .filter(|p| p.peer_id == peer_id)
        .any(|p| {
            p.session
                .as_ref()
                .map(|s| s.state == SessionState::Connected && s.last_reply_age.is_some())
                .unwrap_or(false)
        })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_mesh_chat_browse_and_transfer() {
    let a_dir = scratch_dir("mesh_a");
    let b_dir = scratch_dir("mesh_b");
    let node_a = make_node(&a_dir, 47110, "alice node");
    let node_b = make_node(&b_dir, 47111, "bob node");
    let a_id = node_a.local_id();
    let b_id = node_b.local_id();

    // A 400 KB shared file on A's side: 3 full chunks plus a tail.
    let share_root = a_dir.join("share");
    std::fs::create_dir_all(&share_root).unwrap();
    let content: Vec<u8> = (0..400 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(share_root.join("report.bin"), &content).unwrap();
    node_a.save_shares(vec![taconet::Share("docs".into(), share_root.clone())]);

    provision(&node_a, &node_b, 47111);
    provision(&node_b, &node_a, 47110);

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    // Both directions come up and exchange rollcalls.
    assert!(
        wait_for(Duration::from_secs(15), || {
            connected_to(&node_a, &b_id) && connected_to(&node_b, &a_id)
        })
        .await,
        "nodes never connected to each other"
    );

    // Nicknames are learned from rollcall replies and persisted.
    assert!(
        wait_for(Duration::from_secs(15), || {
            node_a
                .peer_status()
                .iter()
                .any(|p| p.peer_id == b_id && p.nickname == "bob node")
        })
        .await,
        "A never learned B's nickname"
    );

    // Chat fan-out: one send, one version bump on the receiver.
    let b_version = node_b.chat_version();
    node_a.send_chat("hello from a").unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || {
            node_b.chat_version() != b_version
        })
        .await,
        "chat never arrived at B"
    );
    let entries = node_b.get_chat();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sender, a_id);
    assert_eq!(entries[0].text, "hello from a");

    // Remote browse of A's share.
    node_b.browse(&a_id, "/docs").unwrap();
    assert!(
        wait_for(Duration::from_secs(10), || {
            node_b
                .browse_result(&a_id, "/docs")
                .map(|entries| entries.iter().any(|e| e.name == "report.bin"))
                .unwrap_or(false)
        })
        .await,
        "browse result never arrived"
    );

    // Chunked download, finalized byte-identical.
    node_b.download_queue_add(
        &a_id,
        QueuedDownload {
            share_dir: "/docs".into(),
            file_name: "report.bin".into(),
            file_size: content.len() as u64,
            file_mtime: 0,
        },
    );
    assert!(
        wait_for(Duration::from_secs(40), || {
            !node_b.completed_queue_get().is_empty()
        })
        .await,
        "download never completed"
    );
    let completed = node_b.completed_queue_get();
    assert_eq!(completed[0].file_name, "report.bin");
    assert_eq!(completed[0].peer_id, a_id);
    let landed = std::fs::read(b_dir.join("downloads").join("report.bin")).unwrap();
    assert_eq!(landed, content, "downloaded bytes differ");
    // No stray partial left behind.
    assert!(!b_dir.join("downloads").join("report.bin.filepart").exists());

    node_a.shutdown().await;
    node_b.shutdown().await;
    std::fs::remove_dir_all(&a_dir).ok();
    std::fs::remove_dir_all(&b_dir).ok();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rollcall_gossip_discovers_third_peer() {
    let a_dir = scratch_dir("disc_a");
    let b_dir = scratch_dir("disc_b");
    let c_dir = scratch_dir("disc_c");
    let node_a = make_node(&a_dir, 47120, "hub node");
    let node_b = make_node(&b_dir, 47121, "spoke b");
    let node_c = make_node(&c_dir, 47122, "spoke c");
    let b_id = node_b.local_id();
    let c_id = node_c.local_id();

    // A knows B and C; B and C only know A.
    provision(&node_a, &node_b, 47121);
    provision(&node_a, &node_c, 47122);
    provision(&node_b, &node_a, 47120);
    provision(&node_c, &node_a, 47120);

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();
    node_c.start().await.unwrap();

    // B learns of C through A's rollcall gossip and a certs follow-up;
    // the discovered record must be disabled until a user approves it.
    let discovered = wait_for(Duration::from_secs(30), || {
        node_b
            .peer_status()
            .iter()
            .any(|p| p.peer_id == c_id && !p.enabled)
    })
    .await;
    assert!(discovered, "B never discovered C");

    let from_gossip = node_b
        .peer_status()
        .into_iter()
        .find(|p| p.peer_id == c_id)
        .unwrap();
    assert!(!from_gossip.enabled);
    assert!(from_gossip.session.is_none(), "disabled peer must not get a session");

    // And symmetrically for C.
    assert!(
        wait_for(Duration::from_secs(30), || {
            node_c.peer_status().iter().any(|p| p.peer_id == b_id)
        })
        .await,
        "C never discovered B"
    );

    node_a.shutdown().await;
    node_b.shutdown().await;
    node_c.shutdown().await;
    for dir in [a_dir, b_dir, c_dir] {
        std::fs::remove_dir_all(&dir).ok();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unprovisioned_client_never_establishes_a_session() {
    let a_dir = scratch_dir("authz_a");
    let b_dir = scratch_dir("authz_b");
    let node_a = make_node(&a_dir, 47130, "private node");
    let node_b = make_node(&b_dir, 47131, "stranger");
    let a_id = node_a.local_id();

    // B knows A, but A has never provisioned B's keys.
    provision(&node_b, &node_a, 47130);

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    let connected = wait_for(Duration::from_secs(8), || connected_to(&node_b, &a_id)).await;
    assert!(!connected, "unauthorized peer managed to establish a session");

    // A saw nothing application-level from the stranger.
    assert!(node_a.get_chat().is_empty());
    assert!(node_a.peer_status().is_empty());

    node_a.shutdown().await;
    node_b.shutdown().await;
    std::fs::remove_dir_all(&a_dir).ok();
    std::fs::remove_dir_all(&b_dir).ok();
}
