//! Replication Integration Tests
//!
//! Runs real services on loopback sockets:
//! - two-node convergence with last-writer-wins
//! - three-node full mesh
//! - duplicate delivery from a hand-driven peer
//! - handshake rejection of unknown names
//! - catching up after a peer restarts

use chronokv_core::replication::{Message, MessageCodec, ReplicatorConfig, ReplicatorService};
use chronokv_core::store::{Mutation, Record, Store, TableKey, Timestamp, TxnClock};
use chronokv_core::testing::{TestContext, wait_until};
use chronokv_core::Result;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(15);

struct Node {
    addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Logs show up with `RUST_LOG=chronokv=debug cargo test -- --nocapture`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Node {
    async fn start(store: Arc<Store>, config: ReplicatorConfig) -> Self {
        init_tracing();
        let service = ReplicatorService::bind(store, fast(config))
            .await
            .unwrap();
        let addr = service.local_addr();
        let shutdown = service.shutdown_token();
        let handle = tokio::spawn(service.run());
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    fn connect_addr(&self) -> String {
        format!("127.0.0.1:{}", self.addr.unwrap().port())
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn fast(mut config: ReplicatorConfig) -> ReplicatorConfig {
    config.poll_interval = Duration::from_millis(20);
    config.reconnect_delay = Duration::from_millis(50);
    config.connect_timeout = Duration::from_secs(1);
    config.handshake_timeout = Duration::from_secs(2);
    config
}

fn value(store: &Store, key: &[u8]) -> Option<Vec<u8>> {
    let txn = store.read_txn().unwrap();
    store.get(&txn, b"t", key).unwrap().map(<[u8]>::to_vec)
}

fn log_len(store: &Store) -> u64 {
    let txn = store.read_txn().unwrap();
    store.log_len(&txn).unwrap()
}

fn backlog(store: &Store) -> u64 {
    let txn = store.read_txn().unwrap();
    store
        .nodes(&txn)
        .unwrap()
        .iter()
        .map(|peer| store.pending_count(&txn, peer).unwrap())
        .sum()
}

fn put_at(store: &Store, seconds: u32, key: &[u8], value: &[u8]) -> Timestamp {
    let mut txn = store
        .write_txn_with_clock(TxnClock::at(seconds, 0, store.origin()))
        .unwrap();
    let ts = store.put(&mut txn, b"t", key, value).unwrap();
    txn.commit().unwrap();
    ts
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_converge_on_later_write() {
    let ctx = TestContext::new();
    let store_a = Arc::new(ctx.open_store_with_origin("a", 1));
    let store_b = Arc::new(ctx.open_store_with_origin("b", 2));

    let early = put_at(&store_a, 1_000, b"k1", b"v1");
    let late = put_at(&store_b, 2_000, b"k1", b"v2");
    assert!(early < late);

    let a = Node::start(
        Arc::clone(&store_a),
        ReplicatorConfig::new(ctx.store_path("a"), "a")
            .with_accept("b")
            .with_port(0),
    )
    .await;
    let b = Node::start(
        Arc::clone(&store_b),
        ReplicatorConfig::new(ctx.store_path("b"), "b").with_connect("a", a.connect_addr()),
    )
    .await;

    let converged = wait_until(CONVERGENCE_TIMEOUT, || {
        value(&store_a, b"k1").as_deref() == Some(&b"v2"[..])
            && value(&store_b, b"k1").as_deref() == Some(&b"v2"[..])
            && log_len(&store_a) == 2
            && log_len(&store_b) == 2
            && backlog(&store_a) == 0
            && backlog(&store_b) == 0
    })
    .await;
    assert!(converged, "nodes did not converge");

    for store in [&store_a, &store_b] {
        let txn = store.read_txn().unwrap();
        assert!(store.mutation(&txn, &early).unwrap().is_some());
        assert!(store.mutation(&txn, &late).unwrap().is_some());
        assert_eq!(store.version(&txn, b"t", b"k1").unwrap(), Some(late));
    }

    // writes made while the session is up flow too, deletes included
    let mut txn = store_a.write_txn().unwrap();
    store_a.put(&mut txn, b"t", b"k2", b"live").unwrap();
    store_a.del(&mut txn, b"t", b"k1").unwrap();
    txn.commit().unwrap();

    let converged = wait_until(CONVERGENCE_TIMEOUT, || {
        value(&store_b, b"k2").as_deref() == Some(&b"live"[..])
            && value(&store_b, b"k1").is_none()
            && backlog(&store_a) == 0
            && backlog(&store_b) == 0
    })
    .await;
    assert!(converged, "live writes did not replicate");

    b.stop().await;
    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_converge() {
    let ctx = TestContext::new();
    let stores: Vec<Arc<Store>> = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, name)| Arc::new(ctx.open_store_with_origin(name, i as u32 + 1)))
        .collect();

    for (i, store) in stores.iter().enumerate() {
        let mut txn = store.write_txn().unwrap();
        for k in 0..10u8 {
            let key = [b'0' + i as u8, k];
            store.put(&mut txn, b"t", &key, &[k]).unwrap();
        }
        txn.commit().unwrap();
    }

    let a = Node::start(
        Arc::clone(&stores[0]),
        ReplicatorConfig::new(ctx.store_path("a"), "a")
            .with_accept("b")
            .with_accept("c")
            .with_port(0),
    )
    .await;
    let b = Node::start(
        Arc::clone(&stores[1]),
        ReplicatorConfig::new(ctx.store_path("b"), "b")
            .with_accept("c")
            .with_connect("a", a.connect_addr())
            .with_port(0),
    )
    .await;
    let c = Node::start(
        Arc::clone(&stores[2]),
        ReplicatorConfig::new(ctx.store_path("c"), "c")
            .with_connect("a", a.connect_addr())
            .with_connect("b", b.connect_addr()),
    )
    .await;

    let converged = wait_until(CONVERGENCE_TIMEOUT, || {
        stores
            .iter()
            .all(|s| log_len(s) == 30 && backlog(s) == 0)
    })
    .await;
    assert!(converged, "three nodes did not converge");

    for store in &stores {
        for i in 0..3u8 {
            for k in 0..10u8 {
                assert_eq!(value(store, &[b'0' + i, k]), Some(vec![k]));
            }
        }
    }

    c.stop().await;
    b.stop().await;
    a.stop().await;
}

/// Port that was free a moment ago, for configs that must name each
/// other's address before either node is up
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_symmetric_mesh_converges() {
    let ctx = TestContext::new();
    let store_a = Arc::new(ctx.open_store_with_origin("a", 1));
    let store_b = Arc::new(ctx.open_store_with_origin("b", 2));
    put_at(&store_a, 100, b"from-a", b"1");
    put_at(&store_b, 200, b"from-b", b"2");

    let (port_a, port_b) = (free_port(), free_port());
    let a = Node::start(
        Arc::clone(&store_a),
        ReplicatorConfig::new(ctx.store_path("a"), "a")
            .with_accept("b")
            .with_connect("b", format!("127.0.0.1:{port_b}"))
            .with_port(port_a),
    )
    .await;
    let b = Node::start(
        Arc::clone(&store_b),
        ReplicatorConfig::new(ctx.store_path("b"), "b")
            .with_accept("a")
            .with_connect("a", format!("127.0.0.1:{port_a}"))
            .with_port(port_b),
    )
    .await;

    let converged = wait_until(CONVERGENCE_TIMEOUT, || {
        [&store_a, &store_b].iter().all(|s| {
            value(s, b"from-a").is_some() && value(s, b"from-b").is_some() && backlog(s) == 0
        })
    })
    .await;
    assert!(converged, "mesh with two sessions per pair did not converge");
    assert_eq!(log_len(&store_a), 2);
    assert_eq!(log_len(&store_b), 2);

    b.stop().await;
    a.stop().await;
}

async fn handshake(
    addr: &str,
    name: &str,
) -> (
    FramedRead<tokio::net::tcp::OwnedReadHalf, MessageCodec>,
    FramedWrite<tokio::net::tcp::OwnedWriteHalf, MessageCodec>,
) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (rd, wr) = stream.into_split();
    let mut reader = FramedRead::new(rd, MessageCodec::new());
    let mut writer = FramedWrite::new(wr, MessageCodec::new());
    writer.send(Message::Identity(name.to_owned())).await.unwrap();
    let first = reader.next().await.unwrap().unwrap();
    assert!(matches!(first, Message::Identity(_)));
    (reader, writer)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_delivery_is_acknowledged_and_ignored() {
    let ctx = TestContext::new();
    let store = Arc::new(ctx.open_store("a"));
    let node = Node::start(
        Arc::clone(&store),
        ReplicatorConfig::new(ctx.store_path("a"), "a")
            .with_accept("remote")
            .with_port(0),
    )
    .await;

    let (mut reader, mut writer) = handshake(&node.connect_addr(), "remote").await;

    let ts = Timestamp::new(500, 0, 99, 1);
    let mutation = Mutation::new(ts, TableKey::new(b"t", b"dup").unwrap(), Some(b"once".to_vec())).unwrap();
    for _ in 0..2 {
        writer
            .send(Message::LogEntry(Record::Full(mutation.clone())))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::LogEntry(Record::Ack(ts)));
    }

    assert_eq!(log_len(&store), 1);
    assert_eq!(value(&store, b"dup"), Some(b"once".to_vec()));
    {
        let txn = store.read_txn().unwrap();
        assert_eq!(store.version(&txn, b"t", b"dup").unwrap(), Some(ts));
        assert_eq!(store.pending_count(&txn, "remote").unwrap(), 0);
    }

    drop(writer);
    drop(reader);
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_peer_is_disconnected() {
    let ctx = TestContext::new();
    let store = Arc::new(ctx.open_store("a"));
    let mut txn = store.write_txn().unwrap();
    store.put(&mut txn, b"t", b"secret", b"x").unwrap();
    txn.commit().unwrap();

    let node = Node::start(
        Arc::clone(&store),
        ReplicatorConfig::new(ctx.store_path("a"), "a")
            .with_accept("friend")
            .with_port(0),
    )
    .await;

    let (mut reader, _writer) = handshake(&node.connect_addr(), "stranger").await;
    let next = tokio::time::timeout(Duration::from_secs(5), reader.next())
        .await
        .unwrap();
    assert!(next.is_none() || next.unwrap().is_err());

    {
        let txn = store.read_txn().unwrap();
        assert!(!store.node_exists(&txn, "stranger").unwrap());
        assert_eq!(store.pending_count(&txn, "friend").unwrap(), 1);
    }
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_outbound_session_catches_up_after_peer_restart() {
    let ctx = TestContext::new();
    let store_a = Arc::new(ctx.open_store("a"));
    let store_b = Arc::new(ctx.open_store("b"));

    let a = Node::start(
        Arc::clone(&store_a),
        ReplicatorConfig::new(ctx.store_path("a"), "a")
            .with_accept("b")
            .with_port(0),
    )
    .await;
    let a_addr = a.connect_addr();
    let b = Node::start(
        Arc::clone(&store_b),
        ReplicatorConfig::new(ctx.store_path("b"), "b").with_connect("a", a_addr.clone()),
    )
    .await;

    put_at(&store_b, 10, b"first", b"1");
    assert!(wait_until(CONVERGENCE_TIMEOUT, || value(&store_a, b"first").is_some()).await);

    a.stop().await;
    put_at(&store_b, 20, b"while-down", b"2");

    // same port, so b's reconnect loop finds it again
    let port: u16 = a_addr.rsplit_once(':').unwrap().1.parse().unwrap();
    let a = Node::start(
        Arc::clone(&store_a),
        ReplicatorConfig::new(ctx.store_path("a"), "a")
            .with_accept("b")
            .with_port(port),
    )
    .await;

    let caught_up = wait_until(CONVERGENCE_TIMEOUT, || {
        value(&store_a, b"while-down").is_some() && backlog(&store_b) == 0
    })
    .await;
    assert!(caught_up, "restarted peer did not catch up");

    b.stop().await;
    a.stop().await;
}
