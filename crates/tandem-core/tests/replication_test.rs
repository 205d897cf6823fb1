//! Replication integration tests
//!
//! Masters served over TCP and in-process channels, slaves bootstrapped by
//! store copy, commits, pulls and branch detection end to end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tandem_core::log::CommittedTransaction;
use tandem_core::master::{IdType, LockStatus, TxData};
use tandem_core::server::{Server, ServerConfig};
use tandem_core::testing::{commit_test_transactions, setup_test_master, setup_test_slave};
use tandem_core::transport::LocalTransport;
use tandem_core::{Error, Master, MasterClient, MasterImpl, MasterServer, SlaveSession};

fn serve(master: Arc<MasterImpl>) -> Server {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let config = ServerConfig {
        workers: 4,
        ..Default::default()
    };
    Server::start(Arc::new(MasterServer::new(master)), addr, config).unwrap()
}

fn connect(server: &Server, machine_id: i32) -> MasterClient {
    MasterClient::connect("127.0.0.1", server.local_addr().port(), machine_id)
}

/// Commit one transaction on behalf of `slave` and apply what comes back
fn commit_through(slave: &SlaveSession, master: &dyn Master, node: u64, data: &[u8]) -> u64 {
    let ctx = slave.begin_transaction().unwrap();
    slave.apply(master.initialize_tx(&ctx).unwrap()).unwrap();
    let lock = slave
        .apply(master.acquire_node_write_lock(&ctx, &[node]).unwrap())
        .unwrap();
    assert_eq!(lock.status, LockStatus::Locked);
    let tx_id = slave
        .apply(
            master
                .commit_single_resource_transaction(&ctx, "graph", &mut TxData(data))
                .unwrap(),
        )
        .unwrap();
    slave
        .apply(master.finish_transaction(&ctx, true).unwrap())
        .unwrap();
    tx_id
}

#[test]
fn test_slave_commits_over_tcp() {
    let (master, ctx) = setup_test_master(1).unwrap();
    commit_test_transactions(master.database(), 1..=3, 1).unwrap();
    let server = serve(master.clone());
    let client = connect(&server, 1);

    let slave = setup_test_slave(&client, 2, &ctx).unwrap();
    assert_eq!(slave.database().main_data_source().last_committed_tx(), 3);

    let tx_id = commit_through(&slave, &client, 10, b"create node 10");
    assert_eq!(tx_id, 4);
    assert_eq!(slave.database().main_data_source().last_committed_tx(), 4);
    assert_eq!(master.database().main_data_source().last_committed_tx(), 4);

    slave.check_consistency_with_master(&client).unwrap();
    assert_eq!(master.stats().open_transactions, 0);
}

#[test]
fn test_second_slave_pulls_commits() {
    let (master, ctx) = setup_test_master(1).unwrap();
    let server = serve(master.clone());
    let client = connect(&server, 1);

    let writer = setup_test_slave(&client, 2, &ctx).unwrap();
    let reader = setup_test_slave(&client, 3, &ctx).unwrap();

    for node in 0..5 {
        commit_through(&writer, &client, node, format!("node {}", node).as_bytes());
    }
    reader.pull_updates(&client).unwrap();
    assert_eq!(reader.database().main_data_source().last_committed_tx(), 5);
    assert_eq!(
        reader.database().main_data_source().master_for_committed_tx(5).unwrap(),
        master.database().main_data_source().master_for_committed_tx(5).unwrap()
    );
}

#[test]
fn test_concurrent_slaves_get_distinct_tx_ids() {
    let (master, ctx) = setup_test_master(1).unwrap();
    let server = serve(master.clone());

    let handles: Vec<_> = (2..6)
        .map(|machine_id| {
            let client = connect(&server, 1);
            let slave = setup_test_slave(&client, machine_id, &ctx).unwrap();
            thread::spawn(move || {
                (0..5)
                    .map(|i| {
                        let node = machine_id as u64 * 100 + i;
                        commit_through(&slave, &client, node, &node.to_be_bytes())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    assert_eq!(master.stats().commits, 20);
}

#[test]
fn test_lock_conflict_between_slaves() {
    let (master, ctx) = setup_test_master(1).unwrap();
    let master = Arc::new(
        MasterImpl::new(1, master.database().clone()).with_lock_timeout(Duration::from_millis(100)),
    );
    let server = serve(master.clone());
    let client = connect(&server, 1);
    let first = setup_test_slave(&client, 2, &ctx).unwrap();
    let second = setup_test_slave(&client, 3, &ctx).unwrap();

    let a = first.begin_transaction().unwrap();
    let b = second.begin_transaction().unwrap();
    first.apply(client.initialize_tx(&a).unwrap()).unwrap();
    second.apply(client.initialize_tx(&b).unwrap()).unwrap();

    let held = first
        .apply(client.acquire_relationship_write_lock(&a, &[7]).unwrap())
        .unwrap();
    assert!(held.is_granted());
    let denied = second
        .apply(client.acquire_relationship_read_lock(&b, &[7]).unwrap())
        .unwrap();
    assert_eq!(denied.status, LockStatus::NotLocked);

    first.apply(client.finish_transaction(&a, false).unwrap()).unwrap();
    let granted = second
        .apply(client.acquire_relationship_read_lock(&b, &[7]).unwrap())
        .unwrap();
    assert!(granted.is_granted());
}

#[test]
fn test_branched_slave_is_refused() {
    let (master, ctx) = setup_test_master(1).unwrap();
    commit_test_transactions(master.database(), 1..=3, 1).unwrap();
    let server = serve(master.clone());
    let client = connect(&server, 1);
    let slave = setup_test_slave(&client, 2, &ctx).unwrap();

    // The slave commits tx 4 under another master while the cluster moves on.
    let local = CommittedTransaction::new(4, 9, 0xdead_beef, b"local".to_vec());
    slave.database().main_data_source().apply(&local).unwrap();
    commit_test_transactions(master.database(), 4..=4, 1).unwrap();

    let err = slave.pull_updates(&client).unwrap_err();
    assert!(matches!(err, Error::BranchedData(_)), "unexpected {:?}", err);
    let err = slave.check_consistency_with_master(&client).unwrap_err();
    assert!(matches!(err, Error::BranchedData(_)));
}

#[test]
fn test_master_over_local_transport() {
    let (master, ctx) = setup_test_master(1).unwrap();
    let transport = Arc::new(LocalTransport::new(Arc::new(MasterServer::new(master.clone()))));
    let client = MasterClient::new(transport.clone(), 1, 4, Duration::from_secs(1));

    let slave = setup_test_slave(&client, 2, &ctx).unwrap();
    let first = client.allocate_ids(IdType::Relationship).unwrap().into_value();
    let second = client.allocate_ids(IdType::Relationship).unwrap().into_value();
    assert!(second.start >= first.start + first.length);

    let rel_type = slave
        .apply(
            client
                .create_relationship_type(&slave.context().unwrap(), "KNOWS")
                .unwrap(),
        )
        .unwrap();
    assert_eq!(rel_type, 0);
    assert_eq!(commit_through(&slave, &client, 1, b"x"), 1);
}

#[test]
fn test_demoted_master_is_reported() {
    let (master, ctx) = setup_test_master(1).unwrap();
    let server = serve(master.clone());
    let client = connect(&server, 1);
    let slave = setup_test_slave(&client, 2, &ctx).unwrap();

    master.demote();
    let err = slave.pull_updates(&client).unwrap_err();
    assert!(matches!(err, Error::NotMaster(_)));
    assert!(err.requires_master_resolution());
}

#[test]
fn test_unreachable_master_is_a_communication_error() {
    let (master, _ctx) = setup_test_master(1).unwrap();
    let mut server = serve(master);
    let port = server.local_addr().port();
    server.shutdown();

    let client = MasterClient::connect("127.0.0.1", port, 1);
    let err = client.allocate_ids(IdType::Node).unwrap_err();
    assert!(matches!(err, Error::Communication { .. }), "unexpected {:?}", err);
    assert!(err.is_retryable());
}
