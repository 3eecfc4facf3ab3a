//! End-to-end tests: whole branches talking over loopback UDP.

use std::collections::BTreeMap;
use std::time::Duration;

use branch_snapshot::config::{BranchConfig, PeerTable};
use branch_snapshot::simulator::SimulatorConfig;
use branch_snapshot::socket::Socket;
use branch_snapshot::{global_total, Branch, PeerId, SnapshotId, SnapshotLookup, SnapshotRecord};

const BALANCE: u64 = 100;

async fn cluster(
    ids: &[PeerId],
    transfer_period: Option<Duration>,
    faults: Option<SimulatorConfig>,
) -> Vec<Branch> {
    let mut sockets = Vec::new();
    let mut table = BTreeMap::new();
    for &id in ids {
        let sock = Socket::bind("127.0.0.1:0".parse().unwrap()).await.expect("bind");
        table.insert(id, sock.local_addr);
        sockets.push(sock);
    }
    let peers = PeerTable::new(table);

    ids.iter()
        .zip(sockets)
        .map(|(&id, mut sock)| {
            if let Some(f) = &faults {
                sock = sock.with_faults(SimulatorConfig {
                    seed: f.seed.map(|s| s ^ u64::from(id)),
                    ..f.clone()
                });
            }
            let mut config = BranchConfig::new(id, BALANCE, peers.clone());
            config.transport.ack_timeout = Duration::from_millis(20);
            config.ledger.transfer_period = transfer_period;
            Branch::start_on(config, sock).expect("start branch")
        })
        .collect()
}

async fn wait_completed(branches: &[Branch], sid: SnapshotId) -> Vec<SnapshotRecord> {
    let poll = async {
        let mut out = Vec::new();
        for b in branches {
            loop {
                match b.snapshot_result(sid).await.unwrap() {
                    SnapshotLookup::Completed(r) => {
                        out.push(r);
                        break;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        }
        out
    };
    tokio::time::timeout(Duration::from_secs(15), poll)
        .await
        .expect("snapshot did not complete")
}

async fn stop_all(branches: Vec<Branch>) {
    for b in branches {
        b.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_under_load_balances() {
    let branches = cluster(&[1, 2, 3], Some(Duration::from_millis(5)), None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(branches[0].start_snapshot(1).await);
    let records = wait_completed(&branches, 1).await;
    assert_eq!(global_total(&records), 3 * BALANCE);
    for r in &records {
        assert_eq!(r.id, 1);
        assert_eq!(r.markers_seen.len(), 2);
    }

    // A second snapshot from another initiator.
    assert!(branches[2].start_snapshot(2).await);
    let records = wait_completed(&branches, 2).await;
    assert_eq!(global_total(&records), 3 * BALANCE);

    // Ids are single-use.
    assert!(!branches[1].start_snapshot(1).await);

    stop_all(branches).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_over_faulty_network_balances() {
    let faults = SimulatorConfig {
        loss_rate: 0.2,
        duplicate_rate: 0.2,
        reorder_rate: 0.2,
        reorder_delay_ms: 10,
        seed: Some(99),
    };
    let branches = cluster(&[1, 2, 3], Some(Duration::from_millis(25)), Some(faults)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(branches[1].start_snapshot(5).await);
    let records = wait_completed(&branches, 5).await;
    assert_eq!(global_total(&records), 3 * BALANCE);

    stop_all(branches).await;
}

#[tokio::test]
async fn take_hands_over_the_record_once() {
    let branches = cluster(&[1, 2], None, None).await;

    assert!(branches[0].start_snapshot(3).await);
    let records = wait_completed(&branches, 3).await;
    assert_eq!(branches[0].active_snapshot().await.unwrap(), None);
    assert_eq!(records[0].recorded_balance, BALANCE);
    assert_eq!(records[1].recorded_balance, BALANCE);

    match branches[0].take_snapshot_result(3).await.unwrap() {
        SnapshotLookup::Completed(r) => assert_eq!(r.contribution(), BALANCE),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        branches[0].snapshot_result(3).await.unwrap(),
        SnapshotLookup::NotFound
    );
    assert_eq!(
        branches[0].take_snapshot_result(3).await.unwrap(),
        SnapshotLookup::NotFound
    );
    assert!(!branches[0].start_snapshot(3).await);
    assert_eq!(
        branches[1].snapshot_result(99).await.unwrap(),
        SnapshotLookup::NotFound
    );

    stop_all(branches).await;
}

#[tokio::test]
async fn explicit_transfer_moves_money() {
    let branches = cluster(&[1, 2], None, None).await;

    assert!(branches[0].transfer(2, 40).await.unwrap());
    let after = branches[0].balances().await.unwrap();
    assert_eq!(after.available, 60);
    assert_eq!(after.total(), BALANCE);

    let settle = async {
        loop {
            let sender = branches[0].balances().await.unwrap();
            let receiver = branches[1].available_balance().await.unwrap();
            if sender.reserved == 0 && receiver == BALANCE + 40 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), settle)
        .await
        .expect("transfer never settled");
    assert_eq!(branches[0].total_balance().await.unwrap(), 60);

    // Insufficient funds, unknown destination, and self are all refused.
    assert!(!branches[0].transfer(2, 61).await.unwrap());
    assert!(!branches[0].transfer(9, 1).await.unwrap());
    assert!(!branches[0].transfer(1, 1).await.unwrap());
    assert_eq!(branches[0].available_balance().await.unwrap(), 60);

    stop_all(branches).await;
}

#[tokio::test]
async fn lone_branch_snapshot_completes_immediately() {
    let branches = cluster(&[4], Some(Duration::from_millis(5)), None).await;
    assert!(branches[0].start_snapshot(1).await);
    match branches[0].snapshot_result(1).await.unwrap() {
        SnapshotLookup::Completed(r) => {
            assert_eq!(r.recorded_balance, BALANCE);
            assert!(r.channel_state.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
    stop_all(branches).await;
}

#[tokio::test]
async fn second_snapshot_is_rejected_while_one_records() {
    // Branch 3 is configured but never started, so snapshot 1 cannot finish.
    let mut table = BTreeMap::new();
    let mut sockets = Vec::new();
    for id in [1, 2, 3] {
        let sock = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        table.insert(id, sock.local_addr);
        sockets.push(sock);
    }
    let peers = PeerTable::new(table);
    let _silent = sockets.pop().unwrap();
    let mut branches = Vec::new();
    for (id, sock) in [1, 2].into_iter().zip(sockets) {
        let mut config = BranchConfig::new(id, BALANCE, peers.clone());
        config.transport.ack_timeout = Duration::from_millis(20);
        config.ledger.transfer_period = Some(Duration::from_millis(5));
        branches.push(Branch::start_on(config, sock).unwrap());
    }

    assert!(branches[0].start_snapshot(1).await);
    assert_eq!(branches[0].active_snapshot().await.unwrap(), Some(1));
    assert!(!branches[0].start_snapshot(2).await);

    // Branch 2 joins snapshot 1 through the marker and refuses its own.
    let joined = async {
        while branches[1].active_snapshot().await.unwrap() != Some(1) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), joined)
        .await
        .expect("marker never arrived");
    assert!(!branches[1].start_snapshot(3).await);
    assert_eq!(
        branches[0].snapshot_result(1).await.unwrap(),
        SnapshotLookup::StillRecording
    );

    stop_all(branches).await;
}

#[tokio::test]
async fn dropped_branch_releases_its_socket() {
    let branches = cluster(&[1, 2], Some(Duration::from_millis(5)), None).await;
    let addr = branches[0].local_addr();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(branches);

    // The loop exits on its own and closes the socket, so the port frees up.
    let rebind = async {
        loop {
            match Socket::bind(addr).await {
                Ok(sock) => return sock,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    };
    let sock = tokio::time::timeout(Duration::from_secs(5), rebind)
        .await
        .expect("socket of a dropped branch was never released");
    assert_eq!(sock.local_addr, addr);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simultaneous_initiations_all_complete() {
    let branches = cluster(&[1, 2, 3], Some(Duration::from_millis(5)), None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Either may lose the race to the other's marker and be refused, but
    // whatever was accepted must finish.
    let (a, b) = tokio::join!(branches[0].start_snapshot(10), branches[2].start_snapshot(20));
    assert!(a || b);
    for (sid, accepted) in [(10, a), (20, b)] {
        if accepted {
            let records = wait_completed(&branches, sid).await;
            assert_eq!(global_total(&records), 3 * BALANCE, "snapshot {sid}");
        }
    }

    for b in &branches {
        assert_eq!(b.active_snapshot().await.unwrap(), None);
    }
    assert!(branches[1].start_snapshot(30).await);
    let records = wait_completed(&branches, 30).await;
    assert_eq!(global_total(&records), 3 * BALANCE);

    stop_all(branches).await;
}
