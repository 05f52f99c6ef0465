//! Master/clone replication over loopback TCP.

use broker_core::{Config, Data, Error, Topic};
use broker_node::{CloneIntervals, Endpoint, Store};
use std::{collections::BTreeMap, time::Duration};
use tokio::time::{sleep, Instant};

const OVERALL: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(100);

fn topic(name: &str) -> Topic {
    Topic::new(name).unwrap()
}

fn endpoint() -> Endpoint {
    Endpoint::new(Config::default()).unwrap()
}

fn fast_intervals() -> CloneIntervals {
    CloneIntervals {
        resync: Duration::from_millis(200),
        stale: Duration::from_millis(1500),
        mutation_buffer: Duration::from_secs(5),
    }
}

async fn wait_until<T, P>(what: &str, mut probe: P) -> T
where
    P: AsyncFnMut() -> Option<T>,
{
    let deadline = Instant::now() + OVERALL;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(POLL).await;
    }
}

async fn wait_for_value(store: &Store, key: Data, expected: Option<Data>) {
    wait_until("store value", async || match store.get(key.clone()).await {
        Ok(value) if value == expected => Some(()),
        _ => None,
    })
    .await;
}

async fn contents(store: &Store) -> Option<BTreeMap<Data, Data>> {
    let Ok(Data::Set(keys)) = store.keys().await else { return None };
    let mut snapshot = BTreeMap::new();
    for key in keys {
        match store.get(key.clone()).await {
            Ok(Some(value)) => {
                snapshot.insert(key, value);
            },
            _ => return None,
        }
    }
    Some(snapshot)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clone_resyncs_and_buffered_writes_survive() {
    let a = endpoint();
    let b = endpoint();
    let a_port = a.listen("127.0.0.1", 0).await.unwrap();
    b.peer("127.0.0.1", a_port).await.unwrap();

    let master = a.attach_master(topic("mem")).await.unwrap();
    let clone = b.attach_clone(topic("mem"), fast_intervals()).await.unwrap();

    // Issued right after attaching, so it is very likely buffered until the
    // snapshot lands; either way it must end up in both stores.
    clone.put(Data::Count(1), "x", None).await.unwrap();

    wait_for_value(&clone, Data::Count(1), Some(Data::from("x"))).await;
    wait_for_value(&master, Data::Count(1), Some(Data::from("x"))).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_clone_recovers_after_reconnect() {
    let a = endpoint();
    let b = endpoint();
    let a_port = a.listen("127.0.0.1", 0).await.unwrap();
    b.peer("127.0.0.1", a_port).await.unwrap();

    let master = a.attach_master(topic("mem")).await.unwrap();
    let clone = b.attach_clone(topic("mem"), fast_intervals()).await.unwrap();

    master.put("seed", 1u64, None).await.unwrap();
    wait_for_value(&clone, Data::from("seed"), Some(Data::Count(1))).await;

    // Cut the link; the master keeps mutating meanwhile.
    b.unpeer("127.0.0.1", a_port).await.unwrap();
    master.put("while-apart", 2u64, None).await.unwrap();

    // Reads must turn unavailable rather than serve stale contents.
    wait_until("clone to go stale", async || {
        match clone.get("seed").await {
            Err(Error::Unavailable) => Some(()),
            _ => None,
        }
    })
    .await;

    // Reconnect; the resync brings the clone back with everything it missed.
    b.peer("127.0.0.1", a_port).await.unwrap();
    wait_for_value(&clone, Data::from("while-apart"), Some(Data::Count(2))).await;
    wait_for_value(&clone, Data::from("seed"), Some(Data::Count(1))).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clones_converge_on_the_master_order() {
    let a = endpoint();
    let b = endpoint();
    let c = endpoint();
    let a_port = a.listen("127.0.0.1", 0).await.unwrap();
    b.peer("127.0.0.1", a_port).await.unwrap();
    c.peer("127.0.0.1", a_port).await.unwrap();

    let master = a.attach_master(topic("mem")).await.unwrap();
    let clone_b = b.attach_clone(topic("mem"), fast_intervals()).await.unwrap();
    let clone_c = c.attach_clone(topic("mem"), fast_intervals()).await.unwrap();

    // Mixed mutations from both clones. Adds commute; the put/erase pair is
    // ordered because it originates at a single clone.
    clone_b.put(Data::Count(1), "a", None).await.unwrap();
    clone_c.put(Data::Count(2), "b", None).await.unwrap();
    clone_b.add("n", 1u64).await.unwrap();
    clone_c.add("n", 2u64).await.unwrap();
    clone_b.erase(Data::Count(1)).await.unwrap();

    let expected: BTreeMap<Data, Data> =
        [(Data::Count(2), Data::from("b")), (Data::from("n"), Data::Count(3))].into();

    for store in [&master, &clone_b, &clone_c] {
        wait_until("store contents to converge", async || {
            match contents(store).await {
                Some(snapshot) if snapshot == expected => Some(()),
                _ => None,
            }
        })
        .await;
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_unique_outcomes_are_decided_by_the_master() {
    let a = endpoint();
    let b = endpoint();
    let a_port = a.listen("127.0.0.1", 0).await.unwrap();
    b.peer("127.0.0.1", a_port).await.unwrap();

    let master = a.attach_master(topic("mem")).await.unwrap();
    let clone = b.attach_clone(topic("mem"), fast_intervals()).await.unwrap();
    wait_until("clone to sync", async || clone.keys().await.ok().map(|_| ())).await;

    assert!(clone.put_unique("u", 1u64, None).await.unwrap());
    assert!(!clone.put_unique("u", 2u64, None).await.unwrap());
    assert!(!master.put_unique("u", 3u64, None).await.unwrap());
    wait_for_value(&clone, Data::from("u"), Some(Data::Count(1))).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expiring_entries_vanish_everywhere() {
    let a = endpoint();
    let b = endpoint();
    let a_port = a.listen("127.0.0.1", 0).await.unwrap();
    b.peer("127.0.0.1", a_port).await.unwrap();

    let master = a.attach_master(topic("mem")).await.unwrap();
    let clone = b.attach_clone(topic("mem"), fast_intervals()).await.unwrap();

    master
        .put("ephemeral", 1u64, Some(broker_core::Timespan::from_millis(500)))
        .await
        .unwrap();
    master.put("durable", 2u64, None).await.unwrap();

    wait_for_value(&clone, Data::from("durable"), Some(Data::Count(2))).await;
    // The expiry is broadcast as an erase, so the clone loses it too.
    wait_for_value(&clone, Data::from("ephemeral"), None).await;
    wait_for_value(&master, Data::from("ephemeral"), None).await;

    a.shutdown().await;
    b.shutdown().await;
}
