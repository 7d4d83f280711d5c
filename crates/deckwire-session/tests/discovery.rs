use std::net::SocketAddr;
use std::time::Duration;

use deckwire_session::{discover, DiscoveryConfig, DiscoverySession, Endpoint};
use tokio::net::UdpSocket;

fn local_config(timeout: Duration) -> DiscoveryConfig {
    DiscoveryConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        timeout,
    }
}

async fn announce(target: SocketAddr, datagrams: &[&[u8]]) {
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for datagram in datagrams {
        sender.send_to(datagram, target).await.unwrap();
    }
}

#[tokio::test]
async fn each_device_is_reported_once_per_session() {
    let mut session = DiscoverySession::new(local_config(Duration::from_secs(1)));
    let local = session.start().await.unwrap();
    assert!(session.is_running());

    announce(
        local,
        &[
            br#"{"id":"LDD-A","port":8080}"#,
            b"garbage",
            br#"{"id":"LDD-A","port":8080}"#,
            br#"{"id":"LDD-B","version":"2","address":"127.0.0.1:9000"}"#,
        ],
    )
    .await;

    let mut found = session.collect(Duration::from_millis(500)).await;
    found.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].device_id, "LDD-A");
    assert_eq!(found[0].address, "127.0.0.1:8080".parse().unwrap());
    assert_eq!(found[1].protocol_version, "2");
    assert_eq!(
        found[1].to_endpoint(),
        Endpoint::Network {
            url: "ws://127.0.0.1:9000".to_string()
        }
    );

    session.stop();
    assert!(!session.is_running());
    assert!(session.next().await.is_none());
}

#[tokio::test]
async fn restart_reports_devices_again() {
    let mut session = DiscoverySession::new(local_config(Duration::from_secs(1)));

    let local = session.start().await.unwrap();
    announce(local, &[br#"{"id":"LDD-A"}"#]).await;
    assert_eq!(session.collect(Duration::from_millis(300)).await.len(), 1);

    session.stop();
    let local = session.start().await.unwrap();
    announce(local, &[br#"{"id":"LDD-A"}"#]).await;
    let found = session.collect(Duration::from_millis(300)).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].device_id, "LDD-A");
}

#[tokio::test]
async fn discover_with_no_devices_is_empty() {
    let found = discover(&local_config(Duration::from_millis(100))).await;
    assert!(found.is_empty());
}

#[tokio::test]
async fn discover_that_cannot_bind_is_empty() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let config = DiscoveryConfig {
        bind: taken.local_addr().unwrap(),
        timeout: Duration::from_millis(100),
    };
    assert!(discover(&config).await.is_empty());
}
