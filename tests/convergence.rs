//! Multi-broker scenarios over the in-process transport, on paused time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::sleep;

use glued_broker::peer::PeerState;
use glued_broker::protocol::PeerRequest;
use glued_broker::transport::MemoryTransport;
use glued_broker::{Broker, BrokerHandle, ExchangeCoordinator, PeerSpec, ServiceEntry};

const BACKOFF_UNIT: Duration = Duration::from_millis(10);

fn location(name: &str) -> String {
    format!("{}:2773", name)
}

async fn spawn_node(
    net: &MemoryTransport,
    name: &str,
    peers: &[&str],
    health_interval: Duration,
) -> BrokerHandle {
    let local = PeerSpec::new(name, location(name));
    let seed = name.bytes().map(u64::from).sum();
    let mut coordinator = ExchangeCoordinator::with_rng(
        local,
        Arc::new(net.clone()),
        BACKOFF_UNIT,
        StdRng::seed_from_u64(seed),
    );
    for peer in peers {
        coordinator.add_peer(PeerSpec::new(*peer, location(peer)));
    }
    let broker = Broker::new(coordinator, health_interval);
    let handle = broker.handle();
    net.attach(location(name), handle.clone()).await;
    tokio::spawn(broker.run());
    handle
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn peer_state(node: &BrokerHandle, peer: &str) -> Option<PeerState> {
    node.peer_status()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.name == peer)
        .map(|s| s.state)
}

async fn owned(node: &BrokerHandle) -> Vec<ServiceEntry> {
    node.request(PeerRequest::ListManaged)
        .await
        .unwrap()
        .into_entries()
        .unwrap()
}

async fn knows(node: &BrokerHandle, entry: &ServiceEntry) -> bool {
    node.lookup(entry.name.clone()).await.unwrap().as_ref() == Some(entry)
}

#[tokio::test(start_paused = true)]
async fn registration_reaches_peer_and_queue_drains() {
    let net = MemoryTransport::new();
    let a = spawn_node(&net, "a", &["b"], Duration::from_secs(5)).await;
    let b = spawn_node(&net, "b", &["a"], Duration::from_secs(5)).await;

    eventually("a connected to b", || async {
        peer_state(&a, "b").await == Some(PeerState::Steady)
    })
    .await;

    let svc1 = ServiceEntry::new("svc1", "host:1");
    a.register(svc1.clone()).await.unwrap();
    eventually("b learns svc1", || knows(&b, &svc1)).await;

    eventually("a's queue to b drains", || async {
        a.peer_status().await.unwrap()[0].pending == 0
    })
    .await;
    assert!(owned(&b).await.is_empty(), "b must not own learned entries");

    a.deregister(svc1.clone()).await.unwrap();
    eventually("b forgets svc1", || async {
        b.lookup("svc1").await.unwrap().is_none()
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn unconfigured_side_learns_peer_through_add_peer() {
    let net = MemoryTransport::new();
    let b = spawn_node(&net, "b", &[], Duration::from_secs(5)).await;
    let svc2 = ServiceEntry::new("svc2", "host:2");
    b.register(svc2.clone()).await.unwrap();

    let a = spawn_node(&net, "a", &["b"], Duration::from_secs(5)).await;
    eventually("a learns svc2 during handshake", || knows(&a, &svc2)).await;
    eventually("b adds a as a peer", || async {
        peer_state(&b, "a").await == Some(PeerState::Steady)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn partition_heals_with_queued_ops_in_order() {
    let net = MemoryTransport::new();
    let a = spawn_node(&net, "a", &["b"], Duration::from_secs(3600)).await;
    let b = spawn_node(&net, "b", &["a"], Duration::from_secs(3600)).await;
    eventually("a connected to b", || async {
        peer_state(&a, "b").await == Some(PeerState::Steady)
    })
    .await;

    net.take_down(&location("b")).await;
    let svc1 = ServiceEntry::new("svc1", "host:1");
    let svc2 = ServiceEntry::new("svc2", "host:2");
    a.register(svc1.clone()).await.unwrap();
    a.register(svc2.clone()).await.unwrap();
    a.deregister(svc1.clone()).await.unwrap();

    eventually("a notices b is down", || async {
        peer_state(&a, "b").await == Some(PeerState::Disconnected)
    })
    .await;
    assert!(!knows(&b, &svc1).await);

    net.bring_up(&location("b")).await;
    eventually("b converges on a's owned entries", || async {
        knows(&b, &svc2).await && b.lookup("svc1").await.unwrap().is_none()
    })
    .await;
    eventually("a drains its queue", || async {
        let status = a.peer_status().await.unwrap();
        status[0].state == PeerState::Steady && status[0].pending == 0
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn rejected_add_is_evicted_and_not_retried() {
    let net = MemoryTransport::new();
    let b = spawn_node(&net, "b", &[], Duration::from_secs(3600)).await;
    let theirs = ServiceEntry::new("svc1", "b-host:1");
    b.register(theirs.clone()).await.unwrap();

    let a = spawn_node(&net, "a", &["b"], Duration::from_secs(3600)).await;
    eventually("a learns b's svc1", || knows(&a, &theirs)).await;
    eventually("b finished its handshake with a", || async {
        let status = b.peer_status().await.unwrap();
        status.len() == 1 && status[0].state == PeerState::Steady && status[0].pending == 0
    })
    .await;

    let mine = ServiceEntry::new("svc1", "host:1");
    a.register(mine.clone()).await.unwrap();
    eventually("a evicts its svc1", || async { owned(&a).await.is_empty() }).await;

    let status = a.peer_status().await.unwrap();
    assert_eq!(status[0].state, PeerState::Steady);
    assert_eq!(status[0].pending, 0);
    assert_eq!(owned(&b).await, vec![theirs.clone()]);
    assert!(a.lookup("svc1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_backs_off_until_it_appears() {
    let net = MemoryTransport::new();
    let a = spawn_node(&net, "a", &["ghost"], Duration::from_secs(5)).await;

    eventually("several failed attempts", || async {
        let status = a.peer_status().await.unwrap();
        status[0].fail_count >= 3
    })
    .await;
    assert_eq!(peer_state(&a, "ghost").await, Some(PeerState::Disconnected));

    let _ghost = spawn_node(&net, "ghost", &[], Duration::from_secs(5)).await;
    eventually("a connects to ghost", || async {
        peer_state(&a, "ghost").await == Some(PeerState::Steady)
    })
    .await;
    let status = a.peer_status().await.unwrap();
    assert_eq!(status[0].fail_count, 0);
}

#[tokio::test(start_paused = true)]
async fn removed_peer_stops_retrying() {
    let net = MemoryTransport::new();
    let a = spawn_node(&net, "a", &["ghost"], Duration::from_secs(5)).await;
    a.remove_peer("ghost").await.unwrap();
    eventually("ghost removed", || async {
        a.peer_status().await.unwrap().is_empty()
    })
    .await;
    a.shutdown().await.unwrap();
}
