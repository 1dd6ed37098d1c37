//! Cluster integration tests
//!
//! These tests spin up real TCP nodes (a 3-node cluster unless noted) and
//! drive them through the wire protocol with concurrent clients.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use paxlog::client::PullStream;
use paxlog::protocol::{Command, Reply};
use paxlog::testing::TestCluster;

/// Read the next `count` streamed values, failing the test if the stream
/// stalls.
async fn collect_values(stream: &mut PullStream, count: usize) -> Vec<String> {
    let mut values = Vec::new();
    for _ in 0..count {
        let value = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("pull stream stalled")
            .expect("pull stream closed");
        values.push(value);
    }
    values
}

#[tokio::test]
async fn test_push_then_pull_same_node() {
    let cluster = TestCluster::new().await;
    let client = cluster.client(0);

    let reply = client.query_one(&Command::Push { value: "x".into() }).await.unwrap();
    assert_eq!(reply, Reply::Ok);

    // The committing node serves the value immediately.
    let mut stream = client.pull(0).await.unwrap();
    assert_eq!(collect_values(&mut stream, 1).await, vec!["x"]);
}

#[tokio::test]
async fn test_push_is_visible_on_every_node() {
    let cluster = TestCluster::new().await;

    let reply = cluster
        .client(0)
        .query_one(&Command::Push { value: "everywhere".into() })
        .await
        .unwrap();
    assert_eq!(reply, Reply::Ok);

    // Remote nodes learn via the asynchronous broadcast; a live tail picks
    // the value up as soon as it lands.
    for index in 0..cluster.nodes.len() {
        let mut stream = cluster.client(index).pull(0).await.unwrap();
        assert_eq!(collect_values(&mut stream, 1).await, vec!["everywhere"]);
    }
}

#[tokio::test]
async fn test_live_tail_yields_value_pushed_after_subscribe() {
    let cluster = TestCluster::new().await;

    // Subscribe before anything is committed
    let mut stream = cluster.client(1).pull(0).await.unwrap();

    cluster
        .client(0)
        .query_one(&Command::Push { value: "late".into() })
        .await
        .unwrap();

    assert_eq!(collect_values(&mut stream, 1).await, vec!["late"]);
}

#[tokio::test]
async fn test_concurrent_pushes_preserve_both_values() {
    let cluster = TestCluster::new().await;
    let client_a = cluster.client(0);
    let client_b = cluster.client(1);

    let push_x = Command::Push { value: "x".into() };
    let push_y = Command::Push { value: "y".into() };
    let (a, b) = tokio::join!(client_a.query_one(&push_x), client_b.query_one(&push_y));
    assert_eq!(a.unwrap(), Reply::Ok);
    assert_eq!(b.unwrap(), Reply::Ok);

    // Both values must be present on every node, in the same slot order.
    // (Contention can commit an adopted value at more than one slot, so
    // assert containment rather than exact length.)
    for node in &cluster.nodes {
        let entries = wait_for_values(node, &["x", "y"]).await;
        let values: Vec<&str> = entries.iter().map(|(_, v)| v.as_str()).collect();
        assert!(values.contains(&"x"), "node {} missing x: {:?}", node.index, values);
        assert!(values.contains(&"y"), "node {} missing y: {:?}", node.index, values);
    }

    // Safety: no slot holds different values on different nodes.
    let mut by_slot: HashMap<u64, String> = HashMap::new();
    for node in &cluster.nodes {
        for (slot, value) in node.log.entries() {
            match by_slot.get(&slot) {
                Some(existing) => assert_eq!(
                    existing, &value,
                    "slot {} disagrees between nodes", slot
                ),
                None => {
                    by_slot.insert(slot, value);
                }
            }
        }
    }
}

/// Poll a node's log until it contains every expected value.
async fn wait_for_values(
    node: &paxlog::testing::TestNode,
    expected: &[&str],
) -> Vec<(u64, String)> {
    for _ in 0..200 {
        let entries = node.log.entries();
        if expected
            .iter()
            .all(|want| entries.iter().any(|(_, v)| v == want))
        {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {} never learned {:?}: {:?}", node.index, expected, node.log.entries());
}

#[tokio::test]
async fn test_status_probe() {
    let cluster = TestCluster::new().await;
    for index in 0..cluster.nodes.len() {
        let reply = cluster.client(index).query_one(&Command::Status).await.unwrap();
        assert_eq!(reply, Reply::Ok);
    }
}

#[tokio::test]
async fn test_consensus_commands_over_the_wire() {
    let cluster = TestCluster::new().await;
    let client = cluster.client(0);

    // Phase one on a fresh acceptor: promise with no previous value
    let reply = client.query_one(&Command::Prepare { n: 300 }).await.unwrap();
    assert_eq!(reply, Reply::Promise(None));

    // A lower number is refused, reporting the standing promise
    let reply = client.query_one(&Command::Prepare { n: 200 }).await.unwrap();
    assert_eq!(reply, Reply::Refuse(Some(300)));

    // Phase two at the promised number
    let accept = Command::Accept { n: 300, id: "id-1".into(), value: "v".into() };
    assert_eq!(client.query_one(&accept).await.unwrap(), Reply::Accepted);

    // A later prepare returns the accepted value
    let reply = client.query_one(&Command::Prepare { n: 400 }).await.unwrap();
    match reply {
        Reply::Promise(Some(previous)) => {
            assert_eq!(previous.n, 300);
            assert_eq!(previous.id, "id-1");
            assert_eq!(previous.value, "v");
        }
        other => panic!("expected promise with previous value, got {:?}", other),
    }
}

#[tokio::test]
async fn test_set_is_idempotent_but_conflicts_are_fatal() {
    let cluster = TestCluster::new().await;
    let client = cluster.client(0);

    let set = Command::Set { n: 5, id: "id-5".into(), value: "v".into() };
    assert_eq!(client.query_one(&set).await.unwrap(), Reply::Ok);
    // Same slot, same value: idempotent re-delivery
    assert_eq!(client.query_one(&set).await.unwrap(), Reply::Ok);

    // Same slot, different value: protocol-safety violation
    let conflict = Command::Set { n: 5, id: "id-6".into(), value: "w".into() };
    match client.query_one(&conflict).await.unwrap() {
        Reply::Err(message) => assert!(message.contains("slot 5"), "unexpected: {}", message),
        other => panic!("expected error reply, got {:?}", other),
    }

    // The original entry survived
    assert_eq!(cluster.nodes[0].log.get(5).as_deref(), Some("v"));
}

#[tokio::test]
async fn test_malformed_input_closes_only_that_connection() {
    let cluster = TestCluster::new().await;
    let addr = cluster.nodes[0].addr;

    // Raw connection sending garbage
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);
    stream.write_all(b"FROB 1 2 3\n").await.unwrap();

    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("ERR"), "expected error reply, got {:?}", line);

    // The server closed the connection afterwards
    line.clear();
    let read = stream.read_line(&mut line).await.unwrap();
    assert_eq!(read, 0);

    // The node is unaffected
    let reply = cluster.client(0).query_one(&Command::Status).await.unwrap();
    assert_eq!(reply, Reply::Ok);
}

#[tokio::test]
async fn test_connection_metadata_is_not_consensus_relevant() {
    let cluster = TestCluster::new().await;
    let addr = cluster.nodes[0].addr;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);
    stream.write_all(b"STATUS;name=inspector;mood=curious\n").await.unwrap();

    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim(), "OK");
}

#[tokio::test]
async fn test_push_catches_up_with_cluster_round() {
    let cluster = TestCluster::new().await;

    // Promise a far-ahead proposal number on every acceptor, as if the rest
    // of the cluster had raced through 200 rounds already.
    let high = 200u64 << paxlog::core::config::NODE_BITS;
    for index in 0..cluster.nodes.len() {
        let reply = cluster
            .client(index)
            .query_one(&Command::Prepare { n: high })
            .await
            .unwrap();
        assert_eq!(reply, Reply::Promise(None));
    }

    // A push must jump past the standing promises within the client timeout
    // instead of retrying one round at a time.
    let reply = cluster
        .client(0)
        .query_one(&Command::Push { value: "caught-up".into() })
        .await
        .unwrap();
    assert_eq!(reply, Reply::Ok);

    let mut stream = cluster.client(0).pull(0).await.unwrap();
    assert_eq!(collect_values(&mut stream, 1).await, vec!["caught-up"]);
}

#[tokio::test]
async fn test_five_node_cluster_commits() {
    let cluster = TestCluster::with_nodes(5).await;

    let reply = cluster
        .client(2)
        .query_one(&Command::Push { value: "wide".into() })
        .await
        .unwrap();
    assert_eq!(reply, Reply::Ok);

    let mut stream = cluster.client(4).pull(0).await.unwrap();
    assert_eq!(collect_values(&mut stream, 1).await, vec!["wide"]);
}
