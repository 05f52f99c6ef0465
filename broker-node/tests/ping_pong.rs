//! End-to-end overlay tests over loopback TCP.

use broker_core::{Config, Filter, Topic};
use broker_node::{Endpoint, Status, StatusCode};
use std::time::Duration;
use tokio::time::{timeout, Instant};

fn topic(name: &str) -> Topic {
    Topic::new(name).unwrap()
}

fn filter(name: &str) -> Filter {
    Filter::from_topics([topic(name)])
}

fn endpoint() -> Endpoint {
    Endpoint::new(Config::default()).unwrap()
}

const OVERALL: Duration = Duration::from_secs(30);
const RETRY: Duration = Duration::from_millis(300);

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_pong_through_a_relay() {
    let ping = endpoint();
    let relay = endpoint();
    let pong = endpoint();

    // Line topology: ping <-> relay <-> pong, no direct ping/pong link.
    let relay_port = relay.listen("127.0.0.1", 0).await.unwrap();
    let pong_port = pong.listen("127.0.0.1", 0).await.unwrap();
    ping.peer("127.0.0.1", relay_port).await.unwrap();
    relay.peer("127.0.0.1", pong_port).await.unwrap();

    let t = topic("rtt/test");
    let mut pong_sub = pong.make_subscriber(filter("rtt/test")).await.unwrap();
    let mut ping_sub = ping.make_subscriber(filter("rtt/test")).await.unwrap();

    let responder_topic = t.clone();
    let responder = tokio::spawn(async move {
        while let Some(msg) = pong_sub.recv().await {
            match msg.data.as_str() {
                Some("ping") => {
                    pong.publish(responder_topic.clone(), "pong").await.unwrap();
                },
                Some("stop") => break,
                _ => {},
            }
        }
        pong
    });

    let started_all = Instant::now();
    let mut rtts = Vec::new();
    for _ in 0..10 {
        let started = Instant::now();
        ping.publish(t.clone(), "ping").await.unwrap();
        loop {
            assert!(started_all.elapsed() < OVERALL, "no pong within {OVERALL:?}");
            match timeout(RETRY, ping_sub.recv()).await {
                Ok(Some(msg)) if msg.data.as_str() == Some("pong") => break,
                Ok(Some(_)) => {},
                Ok(None) => panic!("ping subscriber closed"),
                // The remote subscription may still be propagating.
                Err(_) => ping.publish(t.clone(), "ping").await.unwrap(),
            }
        }
        rtts.push(started.elapsed());
    }
    assert_eq!(rtts.len(), 10);
    assert!(rtts.iter().all(|rtt| *rtt > Duration::ZERO));

    ping.publish(t, "stop").await.unwrap();
    let pong = timeout(OVERALL, responder).await.unwrap().unwrap();

    ping.shutdown().await;
    relay.shutdown().await;
    pong.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_lifecycle_statuses_surface_locally() {
    let a = endpoint();
    let b = endpoint();
    let b_port = b.listen("127.0.0.1", 0).await.unwrap();

    let internal = Filter::from_topics([topic("broker/statuses")]);
    let mut statuses = a.make_subscriber(internal).await.unwrap();

    let b_id = a.peer("127.0.0.1", b_port).await.unwrap();
    assert_eq!(&b_id, b.id());
    assert_eq!(a.peers().await.unwrap(), vec![b_id.clone()]);

    let added = timeout(OVERALL, statuses.recv()).await.unwrap().unwrap();
    let added = Status::from_data(&added.data).unwrap();
    assert_eq!(added.code, StatusCode::PeerAdded);
    assert_eq!(added.peer, b_id);

    // Killing the remote endpoint surfaces as a lost peer.
    b.shutdown().await;
    let lost = loop {
        let msg = timeout(OVERALL, statuses.recv()).await.unwrap().unwrap();
        let status = Status::from_data(&msg.data).unwrap();
        if status.code != StatusCode::PeerAdded {
            break status;
        }
    };
    assert_eq!(lost.code, StatusCode::PeerLost);
    assert_eq!(lost.peer, b_id);
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unpeer_is_a_graceful_removal() {
    let a = endpoint();
    let b = endpoint();
    let b_port = b.listen("127.0.0.1", 0).await.unwrap();

    let internal = Filter::from_topics([topic("broker/statuses")]);
    let mut statuses = a.make_subscriber(internal).await.unwrap();

    a.peer("127.0.0.1", b_port).await.unwrap();
    let added = timeout(OVERALL, statuses.recv()).await.unwrap().unwrap();
    assert_eq!(Status::from_data(&added.data).unwrap().code, StatusCode::PeerAdded);

    a.unpeer("127.0.0.1", b_port).await.unwrap();
    let removed = timeout(OVERALL, statuses.recv()).await.unwrap().unwrap();
    assert_eq!(Status::from_data(&removed.data).unwrap().code, StatusCode::PeerRemoved);

    // A second unpeer has nothing to remove.
    assert!(a.unpeer("127.0.0.1", b_port).await.is_err());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recording_appends_forwarded_messages() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        recording_directory: dir.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    let a = Endpoint::new(config).unwrap();
    let b = endpoint();
    let b_port = b.listen("127.0.0.1", 0).await.unwrap();
    a.peer("127.0.0.1", b_port).await.unwrap();

    let mut sub = b.make_subscriber(filter("rec")).await.unwrap();
    let started = Instant::now();
    loop {
        assert!(started.elapsed() < OVERALL, "publication never arrived");
        a.publish(topic("rec/x"), "payload").await.unwrap();
        if timeout(RETRY, sub.recv()).await.is_ok() {
            break;
        }
    }

    let recorded = std::fs::read(dir.path().join("messages.dat")).unwrap();
    assert!(!recorded.is_empty(), "messages.dat must contain the forwarded message");

    a.shutdown().await;
    b.shutdown().await;
}
