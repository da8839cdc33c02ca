//! End-to-end mesh tests against an in-process relay

mod harness;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harness::{wait_for, RelayServer};
use peermesh::{
    NegotiationState, RoomConfig, RoomEngine, RoomEvent, RoomHandle, RoomSnapshot,
    SyntheticCapture,
};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(30);

async fn join(relay: &RelayServer, room: &str, name: Option<&str>) -> RoomHandle {
    let mut config = RoomConfig::new(&relay.base_url(), room);
    if let Some(name) = name {
        config = config.with_display_name(name);
    }
    RoomEngine::join(config, Arc::new(SyntheticCapture))
        .await
        .expect("join room")
}

fn connected_peers(snapshot: &RoomSnapshot) -> usize {
    snapshot
        .peers
        .iter()
        .filter(|p| p.state == NegotiationState::Connected)
        .count()
}

/// Offers between any pair must flow in exactly one direction, from the
/// smaller client id to the larger
fn assert_single_initiator_per_pair(relay: &RelayServer) {
    let mut offers_per_pair: HashMap<(String, String), usize> = HashMap::new();

    for frame in relay.webrtc_log() {
        if frame.action != "offer" {
            continue;
        }
        let to = frame.to.clone().expect("offers are directed");
        assert!(
            frame.sender < to,
            "offer initiated by the larger id: {} -> {}",
            frame.sender,
            to
        );
        *offers_per_pair.entry((frame.sender.clone(), to)).or_default() += 1;
    }

    for ((from, to), count) in offers_per_pair {
        assert_eq!(count, 1, "{} sent {} offers to {}", from, count, to);
    }
}

async fn next_chat(handle: &mut RoomHandle, timeout: Duration) -> Option<(String, String)> {
    tokio::time::timeout(timeout, async {
        while let Some(event) = handle.next_event().await {
            if let RoomEvent::Chat {
                display_name, text, ..
            } = event
            {
                return Some((display_name, text));
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_clients_converge_to_connected() {
    let relay = RelayServer::start().await;
    let a = join(&relay, "duo", None).await;
    let b = join(&relay, "duo", None).await;

    let mut a_snap = a.snapshot();
    let mut b_snap = b.snapshot();

    assert!(
        wait_for(&mut a_snap, CONVERGE_TIMEOUT, |s| connected_peers(s) == 1).await,
        "first client never connected: {:?}",
        a_snap.borrow().peers
    );
    assert!(
        wait_for(&mut b_snap, CONVERGE_TIMEOUT, |s| connected_peers(s) == 1).await,
        "second client never connected: {:?}",
        b_snap.borrow().peers
    );

    assert_eq!(a_snap.borrow().participants.len(), 2);
    assert_eq!(b_snap.borrow().participants.len(), 2);

    // the single link each side holds points at the other client's id
    let a_id = a_snap.borrow().local_id.clone().expect("first client welcomed");
    let b_id = b_snap.borrow().local_id.clone().expect("second client welcomed");
    let a_view = a_snap.borrow().clone();
    let b_view = b_snap.borrow().clone();
    assert_eq!(
        a_view.peer(&b_id).expect("link toward the second client").state,
        NegotiationState::Connected
    );
    assert_eq!(
        b_view.peer(&a_id).expect("link toward the first client").state,
        NegotiationState::Connected
    );

    assert_single_initiator_per_pair(&relay);

    a.leave().await.expect("leave");
    b.leave().await.expect("leave");
}

#[tokio::test]
async fn test_chat_reaches_the_other_client() {
    let relay = RelayServer::start().await;
    let a = join(&relay, "chat", Some("Ada")).await;
    let mut b = join(&relay, "chat", None).await;

    // wait until b sees a in the roster so the relay path is settled
    let mut b_snap = b.snapshot();
    assert!(wait_for(&mut b_snap, CONVERGE_TIMEOUT, |s| s.participants.len() == 2).await);

    a.send_chat("morning").expect("send chat");

    let (display_name, text) = next_chat(&mut b, CONVERGE_TIMEOUT)
        .await
        .expect("chat arrives");
    assert_eq!(display_name, "Ada");
    assert_eq!(text, "morning");

    a.leave().await.expect("leave");
    b.leave().await.expect("leave");
}

#[tokio::test]
async fn test_display_names_propagate_both_ways() {
    let relay = RelayServer::start().await;
    let a = join(&relay, "names", Some("Ada")).await;
    let b = join(&relay, "names", Some("Bea")).await;

    let mut a_snap = a.snapshot();
    let mut b_snap = b.snapshot();

    assert!(
        wait_for(&mut a_snap, CONVERGE_TIMEOUT, |s| {
            s.participants
                .iter()
                .any(|p| !p.is_self && p.display_name == "Bea")
        })
        .await,
        "first client never learned the second's name"
    );
    assert!(
        wait_for(&mut b_snap, CONVERGE_TIMEOUT, |s| {
            s.participants
                .iter()
                .any(|p| !p.is_self && p.display_name == "Ada")
        })
        .await,
        "second client never learned the first's name"
    );

    a.leave().await.expect("leave");
    b.leave().await.expect("leave");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_way_mesh_and_leave() {
    let relay = RelayServer::start().await;
    let a = join(&relay, "trio", None).await;
    let b = join(&relay, "trio", None).await;
    let c = join(&relay, "trio", None).await;

    let mut snaps = [a.snapshot(), b.snapshot(), c.snapshot()];
    for snap in &mut snaps {
        assert!(
            wait_for(snap, Duration::from_secs(60), |s| connected_peers(s) == 2).await,
            "mesh never converged: {:?}",
            snap.borrow().peers
        );
    }

    assert_single_initiator_per_pair(&relay);
    assert_eq!(relay.clients_in("trio").len(), 3);

    // one participant leaves; the survivors prune the link but keep
    // each other
    c.leave().await.expect("leave");

    for snap in &mut snaps[..2] {
        assert!(
            wait_for(snap, CONVERGE_TIMEOUT, |s| {
                s.participants.len() == 2 && s.peers.len() == 1
            })
            .await,
            "survivor kept a stale link: {:?}",
            snap.borrow().peers
        );
    }
    assert_eq!(relay.clients_in("trio").len(), 2);

    a.leave().await.expect("leave");
    b.leave().await.expect("leave");
}
