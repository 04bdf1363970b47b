//! Two brokers talking over real loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::sleep;

use glued_broker::protocol::{PeerRequest, RpcError};
use glued_broker::transport::{serve, TcpTransport, Transport, DEFAULT_MAX_FRAME};
use glued_broker::{Broker, BrokerHandle, ExchangeCoordinator, PeerSpec, ServiceEntry};

const SECRET: &str = "test-secret";

async fn start(name: &str, peers: Vec<PeerSpec>) -> (BrokerHandle, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let location = listener.local_addr().unwrap().to_string();
    let mut coordinator = ExchangeCoordinator::new(
        PeerSpec::new(name, location.clone()),
        Arc::new(TcpTransport::new(SECRET)),
        Duration::from_millis(20),
    );
    for peer in peers {
        coordinator.add_peer(peer);
    }
    let broker = Broker::new(coordinator, Duration::from_secs(1));
    let handle = broker.handle();
    tokio::spawn(broker.run());
    tokio::spawn(serve(
        listener,
        handle.clone(),
        SECRET.to_string(),
        DEFAULT_MAX_FRAME,
    ));
    (handle, location)
}

#[tokio::test]
async fn registration_propagates_over_tcp() {
    let (b, b_location) = start("b", vec![]).await;
    let (a, _) = start("a", vec![PeerSpec::new("b", b_location)]).await;

    let svc1 = ServiceEntry::new("svc1", "host:1");
    a.register(svc1.clone()).await.unwrap();

    for _ in 0..200 {
        if b.lookup("svc1").await.unwrap() == Some(svc1.clone()) {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("svc1 never reached b");
}

#[tokio::test]
async fn foreign_cluster_is_rejected() {
    let (_b, b_location) = start("b", vec![]).await;
    let target = TcpTransport::new("some-other-secret").target(&b_location);
    let err = target.invoke(PeerRequest::Ping).await.unwrap_err();
    assert!(matches!(err, RpcError::Rejected(_)));
}

#[tokio::test]
async fn local_registration_surface_over_tcp() {
    let (b, b_location) = start("b", vec![]).await;
    let target = TcpTransport::new(SECRET).target(&b_location);
    target
        .invoke(PeerRequest::Register {
            name: "svc9".into(),
            location: "host:9".into(),
        })
        .await
        .unwrap();
    let owned = target
        .invoke(PeerRequest::ListManaged)
        .await
        .unwrap()
        .into_entries()
        .unwrap();
    assert_eq!(owned, vec![ServiceEntry::new("svc9", "host:9")]);
    assert!(b.lookup("svc9").await.unwrap().is_some());
}
