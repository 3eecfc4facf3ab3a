//! Integration tests for the reliable transport.
//!
//! Each test binds real `tokio::net::UdpSocket`s on loopback, optionally
//! routed through the fault simulator, and drives two or three transports
//! against each other.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use branch_snapshot::config::{PeerTable, TransportConfig};
use branch_snapshot::packet::{Message, PeerId};
use branch_snapshot::simulator::SimulatorConfig;
use branch_snapshot::socket::Socket;
use branch_snapshot::transport::{Inbound, Transport, TransportError};

/// Bind one loopback socket per id and build the matching peer table.
async fn sockets(ids: &[PeerId]) -> (Vec<Socket>, PeerTable) {
    let mut socks = Vec::new();
    let mut table = BTreeMap::new();
    for &id in ids {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::bind(addr).await.expect("bind");
        table.insert(id, sock.local_addr);
        socks.push(sock);
    }
    (socks, PeerTable::new(table))
}

fn fast() -> TransportConfig {
    TransportConfig {
        ack_timeout: Duration::from_millis(30),
    }
}

fn faulty(seed: u64, loss: f64, dup: f64, reorder: f64) -> SimulatorConfig {
    SimulatorConfig {
        loss_rate: loss,
        duplicate_rate: dup,
        reorder_rate: reorder,
        reorder_delay_ms: 15,
        seed: Some(seed),
    }
}

type Endpoint = (Transport, Inbound);

async fn pair(faults: Option<(SimulatorConfig, SimulatorConfig)>) -> (Endpoint, Endpoint) {
    let (mut socks, table) = sockets(&[1, 2]).await;
    let mut b_sock = socks.pop().unwrap();
    let mut a_sock = socks.pop().unwrap();
    if let Some((fa, fb)) = faults {
        a_sock = a_sock.with_faults(fa);
        b_sock = b_sock.with_faults(fb);
    }
    let a = Transport::start(1, &table, a_sock, &fast()).expect("start 1");
    let b = Transport::start(2, &table, b_sock, &fast()).expect("start 2");
    (a, b)
}

async fn receive_n(inbound: &mut Inbound, n: usize) -> Vec<branch_snapshot::transport::Envelope> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let env = tokio::time::timeout(Duration::from_secs(10), inbound.next())
            .await
            .expect("timed out waiting for inbound message")
            .expect("transport closed");
        out.push(env);
    }
    out
}

#[tokio::test]
async fn message_is_delivered_and_acknowledged() {
    let ((a, _a_in), (_b, mut b_in)) = pair(None).await;

    let handle = a.send(2, Message::Transfer { amount: 30 }).unwrap();
    let env = receive_n(&mut b_in, 1).await.remove(0);
    assert_eq!(env.sender, 1);
    assert_eq!(env.seq, 0);
    assert_eq!(env.message, Message::Transfer { amount: 30 });

    let delivered = tokio::time::timeout(Duration::from_secs(5), handle.delivered())
        .await
        .expect("ack timed out")
        .expect("delivered");
    assert_eq!(delivered.peer, 2);
    assert_eq!(delivered.seq, 0);
}

#[tokio::test]
async fn per_link_order_is_preserved() {
    let ((a, _a_in), (_b, mut b_in)) = pair(None).await;

    for amount in 1..=20 {
        a.send(2, Message::Transfer { amount }).unwrap();
    }
    let got: Vec<u64> = receive_n(&mut b_in, 20)
        .await
        .into_iter()
        .map(|e| match e.message {
            Message::Transfer { amount } => amount,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(got, (1..=20).collect::<Vec<_>>());
}

#[tokio::test]
async fn duplicates_and_reordering_never_reach_the_application() {
    const COUNT: u64 = 40;
    let ((a, _a_in), (_b, mut b_in)) = pair(Some((
        faulty(11, 0.1, 0.5, 0.3),
        faulty(12, 0.1, 0.5, 0.3),
    )))
    .await;

    let handles: Vec<_> = (1..=COUNT)
        .map(|amount| a.send(2, Message::Transfer { amount }).unwrap())
        .collect();

    let received = receive_n(&mut b_in, COUNT as usize).await;
    for h in handles {
        tokio::time::timeout(Duration::from_secs(10), h.delivered())
            .await
            .expect("delivery timed out")
            .unwrap();
    }

    // Let any straggling duplicates arrive; none may be delivered.
    let extra = tokio::time::timeout(Duration::from_millis(300), b_in.next()).await;
    assert!(extra.is_err(), "duplicate delivered: {extra:?}");

    let seqs: HashSet<_> = received.iter().map(|e| (e.sender, e.seq)).collect();
    assert_eq!(seqs.len(), COUNT as usize, "each (sender, seq) exactly once");
    let amounts: Vec<u64> = received
        .iter()
        .map(|e| match e.message {
            Message::Transfer { amount } => amount,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(amounts, (1..=COUNT).collect::<Vec<_>>());
}

#[tokio::test]
async fn lossy_link_eventually_delivers() {
    let ((a, _a_in), (_b, mut b_in)) = pair(Some((
        faulty(21, 0.5, 0.0, 0.0),
        faulty(22, 0.5, 0.0, 0.0),
    )))
    .await;

    let handle = a.send(2, Message::Marker { snapshot_id: 3 }).unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(10), handle.delivered())
        .await
        .expect("never delivered")
        .unwrap();
    assert!(delivered.attempts >= 1);
    let env = receive_n(&mut b_in, 1).await.remove(0);
    assert_eq!(env.message, Message::Marker { snapshot_id: 3 });
}

#[tokio::test]
async fn both_directions_work_independently() {
    let ((a, mut a_in), (b, mut b_in)) = pair(None).await;
    a.send(2, Message::Transfer { amount: 5 }).unwrap();
    b.send(1, Message::Transfer { amount: 6 }).unwrap();
    assert_eq!(receive_n(&mut b_in, 1).await[0].message, Message::Transfer { amount: 5 });
    assert_eq!(receive_n(&mut a_in, 1).await[0].message, Message::Transfer { amount: 6 });
}

#[tokio::test]
async fn unreachable_peer_does_not_block_others() {
    // Branch 3 is in the table but never started.
    let (mut socks, table) = sockets(&[1, 2, 3]).await;
    let _silent = socks.pop().unwrap();
    let b_sock = socks.pop().unwrap();
    let a_sock = socks.pop().unwrap();
    let (a, _a_in) = Transport::start(1, &table, a_sock, &fast()).unwrap();
    let (_b, mut b_in) = Transport::start(2, &table, b_sock, &fast()).unwrap();

    let stuck = a.send(3, Message::Transfer { amount: 1 }).unwrap();
    let ok = a.send(2, Message::Transfer { amount: 2 }).unwrap();

    tokio::time::timeout(Duration::from_secs(5), ok.delivered())
        .await
        .expect("link to 2 blocked by link to 3")
        .unwrap();
    assert_eq!(receive_n(&mut b_in, 1).await[0].message, Message::Transfer { amount: 2 });

    let pending = tokio::time::timeout(Duration::from_millis(200), stuck.delivered()).await;
    assert!(pending.is_err(), "send to a dead peer must stay pending");
}

#[tokio::test]
async fn unknown_peer_is_a_configuration_error() {
    let ((a, _a_in), _b) = pair(None).await;
    assert!(matches!(
        a.send(9, Message::Transfer { amount: 1 }),
        Err(TransportError::UnknownPeer(9))
    ));
    assert!(matches!(
        a.send(1, Message::Transfer { amount: 1 }),
        Err(TransportError::UnknownPeer(1))
    ));
}

#[tokio::test]
async fn unknown_local_id_is_rejected_at_start() {
    let (mut socks, table) = sockets(&[1]).await;
    let sock = socks.pop().unwrap();
    assert!(matches!(
        Transport::start(5, &table, sock, &fast()),
        Err(TransportError::UnknownLocalPeer(5))
    ));
}

#[tokio::test]
async fn garbage_datagram_is_dropped_and_link_keeps_working() {
    let (mut socks, table) = sockets(&[1, 2]).await;
    let b_sock = socks.pop().unwrap();
    let a_sock = socks.pop().unwrap();
    let b_addr = b_sock.local_addr;

    let stray = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let (a, _a_in) = Transport::start(1, &table, a_sock, &fast()).unwrap();
    let (_b, mut b_in) = Transport::start(2, &table, b_sock, &fast()).unwrap();

    // Unknown application tag, then unknown link tag.
    let mut bad = vec![0x01, 0, 0, 0, 0, 0, 0, 0, 1, 0x7f];
    bad.extend_from_slice(&5u64.to_be_bytes());
    stray.send_raw(&bad, b_addr).await.unwrap();
    stray.send_raw(&[0x09], b_addr).await.unwrap();

    a.send(2, Message::Transfer { amount: 8 }).unwrap();
    let env = receive_n(&mut b_in, 1).await.remove(0);
    assert_eq!(env.message, Message::Transfer { amount: 8 });
    assert_eq!(env.seq, 0);
}
